//! The capture path: turning reported errors into ring records.
//!
//! Events reach the ring two ways:
//!
//! - through the error hook chain ([`HookSlot`]), where [`CaptureHook`]
//!   records the event and then always forwards it to the hook that was
//!   installed before it;
//! - through [`CaptureLayer`], a `tracing` layer that captures events at or
//!   above the threshold while every other layer sees them unchanged.
//!
//! The request text stored with a record comes from the event itself or, if
//! it carries none, from the thread's [`RequestContext`].

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::Context;

use crate::record::Severity;
use crate::ring::ErrorRing;

// =============================================================================
// ErrorEvent
// =============================================================================

/// An error reported by the host, before it is encoded into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub severity: Severity,
    pub message: String,
    pub status_code: Option<String>,
    /// Overrides the ambient request text when set.
    pub query_text: Option<String>,
    /// Overrides the ring's origin id when set.
    pub origin_id: Option<i32>,
}

impl ErrorEvent {
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            status_code: None,
            query_text: None,
            origin_id: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status_code: impl Into<String>) -> Self {
        self.status_code = Some(status_code.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, query_text: impl Into<String>) -> Self {
        self.query_text = Some(query_text.into());
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin_id: i32) -> Self {
        self.origin_id = Some(origin_id);
        self
    }
}

// =============================================================================
// Hook chain
// =============================================================================

/// Observer of reported errors.
pub trait ErrorHook: Send + Sync {
    fn on_error(&self, event: &ErrorEvent);
}

impl<F> ErrorHook for F
where
    F: Fn(&ErrorEvent) + Send + Sync,
{
    fn on_error(&self, event: &ErrorEvent) {
        self(event);
    }
}

/// Hook that writes qualifying events to the ring, then forwards every event
/// to the previously installed hook.
pub struct CaptureHook {
    ring: Arc<ErrorRing>,
    threshold: Severity,
    next: Option<Arc<dyn ErrorHook>>,
}

impl CaptureHook {
    #[must_use]
    pub fn new(
        ring: Arc<ErrorRing>,
        threshold: Severity,
        next: Option<Arc<dyn ErrorHook>>,
    ) -> Self {
        Self {
            ring,
            threshold,
            next,
        }
    }

    #[must_use]
    pub fn threshold(&self) -> Severity {
        self.threshold
    }

    /// The hook this one forwards to.
    #[must_use]
    pub fn next(&self) -> Option<&Arc<dyn ErrorHook>> {
        self.next.as_ref()
    }
}

impl ErrorHook for CaptureHook {
    fn on_error(&self, event: &ErrorEvent) {
        if event.severity >= self.threshold {
            self.ring.capture(event);
        }
        if let Some(next) = &self.next {
            next.on_error(event);
        }
    }
}

impl std::fmt::Debug for CaptureHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHook")
            .field("threshold", &self.threshold)
            .field("chained", &self.next.is_some())
            .finish()
    }
}

/// Process-wide error hook slot.
static GLOBAL_HOOKS: HookSlot = HookSlot::new();

/// Holds the currently installed error hook.
pub struct HookSlot {
    current: RwLock<Option<Arc<dyn ErrorHook>>>,
}

impl Default for HookSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl HookSlot {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: parking_lot::const_rwlock(None),
        }
    }

    /// The process-wide slot.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL_HOOKS
    }

    /// Install `hook`, returning the one it replaced.
    pub fn install(&self, hook: Arc<dyn ErrorHook>) -> Option<Arc<dyn ErrorHook>> {
        self.current.write().replace(hook)
    }

    /// Put back a previously returned hook (or none).
    pub fn restore(&self, previous: Option<Arc<dyn ErrorHook>>) {
        *self.current.write() = previous;
    }

    /// Install a [`CaptureHook`] chained in front of the current hook.
    pub fn install_capture(&self, ring: Arc<ErrorRing>, threshold: Severity) -> Arc<CaptureHook> {
        let mut current = self.current.write();
        let hook = Arc::new(CaptureHook::new(ring, threshold, current.take()));
        *current = Some(Arc::clone(&hook) as Arc<dyn ErrorHook>);
        hook
    }

    /// Remove a capture hook installed with [`HookSlot::install_capture`],
    /// reinstating the hook it chained to.
    ///
    /// Only takes effect while `hook` is the installed hook; returns `false`
    /// and leaves the slot alone once another hook has been chained in front.
    pub fn uninstall_capture(&self, hook: &Arc<CaptureHook>) -> bool {
        let mut current = self.current.write();
        let installed = matches!(
            &*current,
            Some(c) if std::ptr::addr_eq(Arc::as_ptr(c), Arc::as_ptr(hook))
        );
        if installed {
            *current = hook.next.clone();
        }
        installed
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<dyn ErrorHook>> {
        self.current.read().clone()
    }

    /// Deliver an event to the installed hook. The slot lock is not held
    /// while the hook runs.
    pub fn emit(&self, event: &ErrorEvent) {
        let hook = self.current();
        if let Some(hook) = hook {
            hook.on_error(event);
        }
    }
}

impl std::fmt::Debug for HookSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSlot")
            .field("installed", &self.current.read().is_some())
            .finish()
    }
}

// =============================================================================
// Ambient request text
// =============================================================================

thread_local! {
    static CURRENT_REQUEST: RefCell<Option<String>> = const { RefCell::new(None) };
    static IN_CAPTURE: Cell<bool> = const { Cell::new(false) };
}

/// RAII guard setting the request text for the current thread.
///
/// Dropping the guard restores whatever was set before, so scopes nest.
///
/// ```ignore
/// let _req = RequestContext::enter("SELECT * FROM accounts");
/// hooks.emit(&ErrorEvent::new(Severity::Error, "permission denied"));
/// ```
#[derive(Debug)]
pub struct RequestContext {
    previous: Option<String>,
}

impl RequestContext {
    pub fn enter(text: impl Into<String>) -> Self {
        let previous = CURRENT_REQUEST.with(|c| c.replace(Some(text.into())));
        Self { previous }
    }

    /// The request text set on this thread, if any.
    #[must_use]
    pub fn current() -> Option<String> {
        with_current_request(|text| text.map(str::to_string))
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT_REQUEST.try_with(|c| *c.borrow_mut() = previous);
    }
}

/// Run `f` with the thread's request text.
///
/// During thread teardown the text is already gone and `f` sees `None`.
pub(crate) fn with_current_request<R>(f: impl FnOnce(Option<&str>) -> R) -> R {
    let text = CURRENT_REQUEST
        .try_with(|c| c.try_borrow().ok().and_then(|t| t.clone()))
        .ok()
        .flatten();
    f(text.as_deref())
}

/// Marks the thread as inside a capture; nested captures are dropped.
pub(crate) struct ReentryGuard(());

impl ReentryGuard {
    pub(crate) fn enter() -> Option<Self> {
        IN_CAPTURE.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Self(()))
            }
        })
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        IN_CAPTURE.with(|flag| flag.set(false));
    }
}

/// Whether the current thread is inside a capture.
#[must_use]
pub fn capture_in_progress() -> bool {
    IN_CAPTURE.with(Cell::get)
}

// =============================================================================
// Tracing layer
// =============================================================================

/// `tracing` layer that feeds qualifying events into the ring.
///
/// Field mapping: `message` becomes the error message, `status_code` the
/// status code, and `query` (if present) replaces the ambient request text.
pub struct CaptureLayer {
    ring: Arc<ErrorRing>,
    threshold: Severity,
}

impl CaptureLayer {
    #[must_use]
    pub fn new(ring: Arc<ErrorRing>, threshold: Severity) -> Self {
        Self { ring, threshold }
    }

    /// Most verbose tracing level that can reach the threshold. Use it as a
    /// per-layer filter so other layers keep their own filtering.
    #[must_use]
    pub fn level_filter(&self) -> LevelFilter {
        match self.threshold {
            Severity::Trace => LevelFilter::TRACE,
            Severity::Debug => LevelFilter::DEBUG,
            Severity::Info | Severity::Notice => LevelFilter::INFO,
            Severity::Warning => LevelFilter::WARN,
            Severity::Error | Severity::Fatal => LevelFilter::ERROR,
        }
    }
}

impl std::fmt::Debug for CaptureLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureLayer")
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let severity = Severity::from(*event.metadata().level());
        if severity < self.threshold || capture_in_progress() {
            return;
        }

        let mut visitor = CaptureVisitor::default();
        event.record(&mut visitor);

        let mut captured = ErrorEvent::new(severity, visitor.message.unwrap_or_default());
        captured.status_code = visitor.status_code;
        captured.query_text = visitor.query;
        self.ring.capture(&captured);
    }
}

#[derive(Default)]
struct CaptureVisitor {
    message: Option<String>,
    status_code: Option<String>,
    query: Option<String>,
}

impl CaptureVisitor {
    fn set(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "status_code" => self.status_code = Some(value),
            "query" => self.query = Some(value),
            _ => {}
        }
    }
}

impl Visit for CaptureVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.set(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.set(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if matches!(field.name(), "message" | "status_code" | "query") {
            self.set(field, format!("{value:?}"));
        }
    }
}
