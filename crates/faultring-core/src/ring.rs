//! Process-side handle to the shared error ring.
//!
//! [`ErrorRing`] is an explicit `Uninit -> Attached` state machine. Until a
//! region is attached every operation fails with [`Error::NotInitialized`]
//! (or, for [`ErrorRing::capture`], silently does nothing). Detaching returns
//! to `Uninit` without touching the shared contents, so a process can reload
//! and re-attach to the same ring.
//!
//! Lock discipline: writers (capture, clear) take the exclusive guard,
//! readers (queries, stats) the shared one. Nothing that allocates, logs or
//! calls out to other code runs while a guard is held, except the single
//! timestamp read inside capture.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::capture::{ErrorEvent, ReentryGuard, with_current_request};
use crate::config::RingConfig;
use crate::error::{Error, Result};
use crate::guard::{ReadGuard, WriteGuard};
use crate::record::{EncodedSlot, Record, SLOT_SIZE, Severity, SlotPrefix, now_micros};
use crate::region::{Attachment, RegionLayout, RegionPlan, SharedRegion};
use crate::ring_store::{AppendReceipt, RingStats, RingStore};

/// Registrant name the ring reserves its segment under.
pub const RING_REGISTRANT: &str = "faultring.ring";

/// Process-global ring, shared by the capture hook and callers.
static GLOBAL_RING: OnceLock<Arc<ErrorRing>> = OnceLock::new();

enum RingState {
    Uninit,
    Attached(Arc<AttachedRing>),
}

struct AttachedRing {
    region: SharedRegion,
    lock_name: String,
    capacity: usize,
    origin_id: i32,
    threshold: Severity,
}

impl AttachedRing {
    fn read(&self) -> Result<ReadGuard<'_>> {
        ReadGuard::acquire(
            &self.region,
            &self.lock_name,
            RING_REGISTRANT,
            self.capacity,
        )
    }

    fn write(&self) -> Result<WriteGuard<'_>> {
        WriteGuard::acquire(
            &self.region,
            &self.lock_name,
            RING_REGISTRANT,
            self.capacity,
        )
    }
}

/// Handle to the shared error ring for this process.
pub struct ErrorRing {
    state: RwLock<RingState>,
}

impl Default for ErrorRing {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ErrorRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.state.read() {
            RingState::Uninit => f
                .debug_struct("ErrorRing")
                .field("state", &"uninit")
                .finish(),
            RingState::Attached(ring) => f
                .debug_struct("ErrorRing")
                .field("region", &ring.region.path())
                .field("capacity", &ring.capacity)
                .field("origin_id", &ring.origin_id)
                .field("threshold", &ring.threshold)
                .finish(),
        }
    }
}

impl ErrorRing {
    /// A detached handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RingState::Uninit),
        }
    }

    /// Initialize (or get) the process-global handle.
    pub fn init_global() -> Arc<Self> {
        GLOBAL_RING.get_or_init(|| Arc::new(Self::new())).clone()
    }

    /// The process-global handle, if initialized.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_RING.get().cloned()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Add the ring's space and lock requirements to `plan`.
    ///
    /// Safe to call more than once with the same config.
    pub fn register(plan: &mut RegionPlan, config: &RingConfig) -> Result<()> {
        config.validate()?;
        plan.request_space(
            RING_REGISTRANT,
            RingStore::<Vec<u8>>::required_size(config.capacity),
        )?;
        plan.request_lock(RING_REGISTRANT, &config.lock_name)?;
        Ok(())
    }

    /// Create the region or attach to an existing one, using a plan that
    /// holds only the ring.
    pub fn attach(&self, config: &RingConfig) -> Result<Attachment> {
        let mut plan = RegionPlan::new();
        Self::register(&mut plan, config)?;
        self.attach_with_layout(config, plan.layout())
    }

    /// Create or attach using a layout shared with other registrants.
    pub fn attach_with_layout(
        &self,
        config: &RingConfig,
        layout: RegionLayout,
    ) -> Result<Attachment> {
        config.validate()?;
        let origin_id = config.effective_origin();
        let capacity = config.capacity;
        let region = SharedRegion::create_or_attach(
            &config.region_dir,
            &config.region_name,
            layout,
            |region| {
                let segment = region.segment(RING_REGISTRANT)?;
                RingStore::format(segment, capacity, origin_id, now_micros())?;
                Ok(())
            },
        )?;
        self.install(region, config, origin_id)
    }

    /// Attach to a region another process created. Never creates one.
    pub fn attach_existing(&self, config: &RingConfig) -> Result<Attachment> {
        let mut plan = RegionPlan::new();
        Self::register(&mut plan, config)?;
        let region =
            SharedRegion::attach_existing(&config.region_dir, &config.region_name, plan.layout())?;
        self.install(region, config, config.effective_origin())
    }

    fn install(
        &self,
        region: SharedRegion,
        config: &RingConfig,
        origin_id: i32,
    ) -> Result<Attachment> {
        let ring = AttachedRing {
            region,
            lock_name: config.lock_name.clone(),
            capacity: config.capacity,
            origin_id,
            threshold: config.capture_threshold,
        };
        // Validates the header against the configured capacity.
        drop(ring.read()?);

        let attachment = ring.region.attachment();
        info!(
            region = %ring.region.path().display(),
            origin_id,
            capacity = ring.capacity,
            created = attachment == Attachment::Created,
            "Error ring attached"
        );
        *self.state.write() = RingState::Attached(Arc::new(ring));
        Ok(attachment)
    }

    /// Drop the local handle. Shared contents are untouched. Returns whether
    /// a region was attached.
    pub fn detach(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state.write(), RingState::Uninit);
        let was_attached = matches!(previous, RingState::Attached(_));
        if was_attached {
            debug!("Error ring detached");
        }
        was_attached
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        matches!(*self.state.read(), RingState::Attached(_))
    }

    /// Origin id this process stamps on captures.
    #[must_use]
    pub fn origin_id(&self) -> Option<i32> {
        match &*self.state.read() {
            RingState::Attached(ring) => Some(ring.origin_id),
            RingState::Uninit => None,
        }
    }

    /// Lowest severity [`ErrorRing::capture`] records.
    #[must_use]
    pub fn capture_threshold(&self) -> Option<Severity> {
        match &*self.state.read() {
            RingState::Attached(ring) => Some(ring.threshold),
            RingState::Uninit => None,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        match &*self.state.read() {
            RingState::Attached(ring) => Some(ring.capacity),
            RingState::Uninit => None,
        }
    }

    fn attached(&self) -> Result<Arc<AttachedRing>> {
        match &*self.state.read() {
            RingState::Attached(ring) => Ok(Arc::clone(ring)),
            RingState::Uninit => Err(Error::NotInitialized),
        }
    }

    // ── Write path ──────────────────────────────────────────────────

    /// Record an event at or above the configured capture threshold.
    ///
    /// Never fails and never panics on ring errors; a dropped capture is
    /// logged at debug level.
    pub fn capture(&self, event: &ErrorEvent) {
        let Some(_reentry) = ReentryGuard::enter() else {
            return;
        };
        if self
            .capture_threshold()
            .is_some_and(|threshold| event.severity < threshold)
        {
            return;
        }
        if let Err(e) = self.try_capture(event) {
            debug!(error = %e, "Error capture dropped");
        }
    }

    /// Record an event whatever its severity, reporting failures.
    pub fn try_capture(&self, event: &ErrorEvent) -> Result<AppendReceipt> {
        let ring = self.attached()?;
        let origin_id = event.origin_id.unwrap_or(ring.origin_id);
        let mut slot = with_current_request(|ambient| {
            EncodedSlot::new(
                origin_id,
                event.severity,
                event.status_code.as_deref().unwrap_or(""),
                &event.message,
                event.query_text.as_deref().or(ambient).unwrap_or(""),
            )
        });

        let receipt = {
            let mut guard = ring.write()?;
            guard.append(&mut slot, now_micros())?
        };

        debug!(origin_id, slot = receipt.slot, "Captured error event");
        Ok(receipt)
    }

    /// Reset the ring to empty.
    pub fn clear(&self) -> Result<()> {
        let ring = self.attached()?;
        {
            let mut guard = ring.write()?;
            guard.clear()?;
        }
        info!(region = %ring.region.path().display(), "Error ring cleared");
        Ok(())
    }

    // ── Read path ───────────────────────────────────────────────────

    /// Most recent live record from `origin_id`, or `None`.
    ///
    /// If several records share the newest timestamp, the last one in slot
    /// order is returned.
    pub fn query_last(&self, origin_id: i32) -> Result<Option<Record>> {
        let ring = self.attached()?;
        let mut buf = vec![0u8; SLOT_SIZE];
        let found = {
            let guard = ring.read()?;
            match guard.latest_slot_for(origin_id)? {
                Some(index) => {
                    guard.read_slot_into(index, &mut buf)?;
                    true
                }
                None => false,
            }
        };
        Ok(found.then(|| Record::decode(&buf)))
    }

    /// Up to `limit` live records in slot order.
    ///
    /// `limit <= 0` or larger than the capacity means "all of them". The
    /// slots are copied out under the shared lock in one pass; filtering
    /// happens afterwards on the private copy.
    pub fn query_history(&self, limit: i64) -> Result<HistoryIter> {
        let ring = self.attached()?;
        let mut snapshot = vec![0u8; ring.capacity * SLOT_SIZE];
        {
            let guard = ring.read()?;
            guard.copy_slots_into(&mut snapshot)?;
        }
        Ok(HistoryIter::new(snapshot, clamp_limit(limit, ring.capacity)))
    }

    /// Occupancy and counters.
    pub fn stats(&self) -> Result<RingStats> {
        let ring = self.attached()?;
        let guard = ring.read()?;
        guard.stats()
    }
}

/// Clamp a caller-supplied history limit to `[1, capacity]`.
#[must_use]
pub fn clamp_limit(limit: i64, capacity: usize) -> usize {
    match usize::try_from(limit) {
        Ok(n) if n >= 1 && n <= capacity => n,
        _ => capacity,
    }
}

// =============================================================================
// HistoryIter
// =============================================================================

/// One-shot iterator over a private snapshot of the ring.
pub struct HistoryIter {
    snapshot: Vec<u8>,
    next_slot: usize,
    remaining: usize,
}

impl HistoryIter {
    fn new(snapshot: Vec<u8>, limit: usize) -> Self {
        Self {
            snapshot,
            next_slot: 0,
            remaining: limit,
        }
    }
}

impl Iterator for HistoryIter {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        while self.remaining > 0 {
            let start = self.next_slot * SLOT_SIZE;
            let chunk = self.snapshot.get(start..start + SLOT_SIZE)?;
            self.next_slot += 1;
            if SlotPrefix::decode(chunk).is_live() {
                self.remaining -= 1;
                return Some(Record::decode(chunk));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let slots_left = (self.snapshot.len() / SLOT_SIZE).saturating_sub(self.next_slot);
        (0, Some(slots_left.min(self.remaining)))
    }
}

impl std::fmt::Debug for HistoryIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryIter")
            .field("next_slot", &self.next_slot)
            .field("remaining", &self.remaining)
            .finish()
    }
}
