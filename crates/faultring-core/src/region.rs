//! Shared region lifecycle.
//!
//! Startup is two-phase. During the reservation phase every registrant adds
//! its space and lock requirements to a [`RegionPlan`]; nothing exists on
//! disk yet. The frozen [`RegionLayout`] is then handed to
//! [`SharedRegion::create_or_attach`], which either creates the region (first
//! process) or attaches to the existing one (everybody else).
//!
//! A region is a fixed-size file in a memory-backed directory, with sibling
//! files for each named lock:
//!
//! ```text
//! <dir>/<name>.ring            region contents (layout.total_size bytes)
//! <dir>/<name>.<lock>.lock     one per named lock
//! <dir>/<name>.init.lock       serializes create/attach/destroy
//! ```
//!
//! The creator initializes a temporary file and renames it into place while
//! holding the init lock, so the presence of `<name>.ring` means the region is
//! fully initialized.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ring_store::{RingMemory, checked_range};

/// Alignment applied to every segment and to the total size.
pub const REGION_ALIGN: u64 = 8;

const RING_SUFFIX: &str = "ring";
const LOCK_SUFFIX: &str = "lock";
const INIT_LOCK: &str = "init";

/// Round `n` up to [`REGION_ALIGN`].
#[must_use]
pub const fn align_up(n: u64) -> u64 {
    n.div_ceil(REGION_ALIGN) * REGION_ALIGN
}

// =============================================================================
// Reservation phase
// =============================================================================

/// Accumulates space and lock requests before the region exists.
///
/// Requests are keyed by registrant. Repeating an identical request is a no-op
/// so initialization hooks can be chained safely; a registrant asking for a
/// different amount the second time is rejected.
#[derive(Debug, Clone, Default)]
pub struct RegionPlan {
    spaces: Vec<(String, u64)>,
    locks: Vec<LockRequest>,
}

/// A named lock owned by one registrant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub registrant: String,
    pub name: String,
}

impl RegionPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `bytes` of region space for `registrant`.
    pub fn request_space(&mut self, registrant: &str, bytes: u64) -> Result<()> {
        if registrant.is_empty() {
            return Err(Error::Plan("registrant name must not be empty".to_string()));
        }
        if bytes == 0 {
            return Err(Error::Plan(format!(
                "registrant {registrant} requested zero bytes"
            )));
        }
        match self.spaces.iter().find(|(name, _)| name == registrant) {
            Some((_, existing)) if *existing == bytes => Ok(()),
            Some((_, existing)) => Err(Error::Plan(format!(
                "registrant {registrant} already reserved {existing} bytes, now asks for {bytes}"
            ))),
            None => {
                self.spaces.push((registrant.to_string(), bytes));
                Ok(())
            }
        }
    }

    /// Request a named lock for `registrant`.
    pub fn request_lock(&mut self, registrant: &str, lock_name: &str) -> Result<()> {
        if lock_name.is_empty() || lock_name == INIT_LOCK {
            return Err(Error::Plan(format!("invalid lock name {lock_name:?}")));
        }
        if let Some(existing) = self.locks.iter().find(|l| l.registrant == registrant) {
            if existing.name == lock_name {
                return Ok(());
            }
            return Err(Error::Plan(format!(
                "registrant {registrant} already holds lock {}, now asks for {lock_name}",
                existing.name
            )));
        }
        if let Some(owner) = self.locks.iter().find(|l| l.name == lock_name) {
            return Err(Error::Plan(format!(
                "lock {lock_name} already requested by {}",
                owner.registrant
            )));
        }
        self.locks.push(LockRequest {
            registrant: registrant.to_string(),
            name: lock_name.to_string(),
        });
        Ok(())
    }

    /// Freeze the plan. Segments are laid out in registration order.
    #[must_use]
    pub fn layout(&self) -> RegionLayout {
        let mut offset = 0u64;
        let segments = self
            .spaces
            .iter()
            .map(|(registrant, bytes)| {
                let segment = Segment {
                    registrant: registrant.clone(),
                    offset,
                    len: align_up(*bytes),
                };
                offset += segment.len;
                segment
            })
            .collect();
        RegionLayout {
            segments,
            locks: self.locks.clone(),
            total_size: offset,
        }
    }
}

/// One registrant's slice of the region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub registrant: String,
    pub offset: u64,
    pub len: u64,
}

/// Frozen region layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLayout {
    pub segments: Vec<Segment>,
    pub locks: Vec<LockRequest>,
    pub total_size: u64,
}

impl RegionLayout {
    #[must_use]
    pub fn segment(&self, registrant: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.registrant == registrant)
    }

    #[must_use]
    pub fn has_lock(&self, lock_name: &str) -> bool {
        self.locks.iter().any(|l| l.name == lock_name)
    }
}

// =============================================================================
// SharedRegion
// =============================================================================

/// How this process obtained its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// This process created and initialized the region.
    Created,
    /// The region already existed.
    Attached,
}

/// An attached shared region.
#[derive(Debug)]
pub struct SharedRegion {
    dir: PathBuf,
    name: String,
    file: File,
    layout: RegionLayout,
    attachment: Attachment,
}

impl SharedRegion {
    /// Create the region, or attach to it if another process already did.
    ///
    /// `init` runs only in the creating process, while the init lock is held
    /// and before the region becomes visible to anyone else.
    pub fn create_or_attach<F>(
        dir: &Path,
        name: &str,
        layout: RegionLayout,
        init: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        fs::create_dir_all(dir)?;
        let _init_lock = lock_file_exclusive(&file_path(dir, name, INIT_LOCK, LOCK_SUFFIX))?;

        for lock in &layout.locks {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(file_path(dir, name, &lock.name, LOCK_SUFFIX))?;
        }

        let path = region_path(dir, name);
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => {
                let region = Self::from_file(dir, name, file, layout, Attachment::Attached)?;
                debug!(region = %path.display(), "Attached to existing shared region");
                Ok(region)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Self::create(dir, name, layout, init)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attach to a region some other process created. Fails with
    /// [`Error::NotInitialized`] if there is none.
    pub fn attach_existing(dir: &Path, name: &str, layout: RegionLayout) -> Result<Self> {
        let path = region_path(dir, name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::NotInitialized),
            Err(e) => return Err(e.into()),
        };
        Self::from_file(dir, name, file, layout, Attachment::Attached)
    }

    /// Remove the region and its named locks. Returns whether a region existed.
    ///
    /// Processes still holding a handle keep working on the unlinked file;
    /// the next attach creates a fresh, empty region. The init lock file is
    /// left in place so concurrent creators stay serialized.
    pub fn destroy(dir: &Path, name: &str) -> Result<bool> {
        let init_path = file_path(dir, name, INIT_LOCK, LOCK_SUFFIX);
        if !dir.is_dir() {
            return Ok(false);
        }
        let _init_lock = lock_file_exclusive(&init_path)?;

        let existed = remove_if_exists(&region_path(dir, name))?;

        let prefix = format!("{name}.");
        let lock_ext = format!(".{LOCK_SUFFIX}");
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(middle) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&lock_ext))
            else {
                continue;
            };
            if middle != INIT_LOCK && !middle.contains('.') {
                remove_if_exists(&entry.path())?;
            }
        }

        info!(region = %region_path(dir, name).display(), existed, "Destroyed shared region");
        Ok(existed)
    }

    fn create<F>(dir: &Path, name: &str, layout: RegionLayout, init: F) -> Result<Self>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        let tmp_path = dir.join(format!(
            "{name}.{RING_SUFFIX}.{}.tmp",
            std::process::id()
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.set_len(layout.total_size)?;

        let region = Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            file,
            layout,
            attachment: Attachment::Created,
        };

        let published = init(&region)
            .and_then(|()| region.file.sync_data().map_err(Error::from))
            .and_then(|()| fs::rename(&tmp_path, region.path()).map_err(Error::from));
        if let Err(e) = published {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        info!(
            region = %region.path().display(),
            size = region.layout.total_size,
            created = true,
            "Created shared region"
        );
        Ok(region)
    }

    fn from_file(
        dir: &Path,
        name: &str,
        file: File,
        layout: RegionLayout,
        attachment: Attachment,
    ) -> Result<Self> {
        let found = file.metadata()?.len();
        if found != layout.total_size {
            return Err(Error::LayoutMismatch {
                expected: format!("region of {} bytes", layout.total_size),
                found: format!("region of {found} bytes"),
            });
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            file,
            layout,
            attachment,
        })
    }

    /// Whether this handle created the region.
    #[must_use]
    pub fn attachment(&self) -> Attachment {
        self.attachment
    }

    #[must_use]
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the region file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        region_path(&self.dir, &self.name)
    }

    /// Path of a named lock file. The lock must be part of the layout.
    pub fn lock_path(&self, lock_name: &str) -> Result<PathBuf> {
        if !self.layout.has_lock(lock_name) {
            return Err(Error::Plan(format!(
                "lock {lock_name} was not requested for region {}",
                self.name
            )));
        }
        Ok(file_path(&self.dir, &self.name, lock_name, LOCK_SUFFIX))
    }

    /// View of one registrant's segment.
    pub fn segment(&self, registrant: &str) -> Result<SegmentView<'_>> {
        let segment = self.layout.segment(registrant).ok_or_else(|| {
            Error::Plan(format!(
                "registrant {registrant} has no segment in region {}",
                self.name
            ))
        })?;
        Ok(SegmentView {
            file: &self.file,
            offset: segment.offset,
            len: segment.len,
        })
    }
}

/// Path of the region file for `name` in `dir`.
#[must_use]
pub fn region_path(dir: &Path, name: &str) -> PathBuf {
    file_path(dir, name, RING_SUFFIX, "")
}

fn file_path(dir: &Path, name: &str, part: &str, suffix: &str) -> PathBuf {
    if suffix.is_empty() {
        dir.join(format!("{name}.{part}"))
    } else {
        dir.join(format!("{name}.{part}.{suffix}"))
    }
}

fn lock_file_exclusive(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    fs2::FileExt::lock_exclusive(&file)?;
    Ok(file)
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// SegmentView
// =============================================================================

/// Byte window onto one segment of a region.
#[derive(Debug, Clone, Copy)]
pub struct SegmentView<'a> {
    file: &'a File,
    offset: u64,
    len: u64,
}

impl RingMemory for SegmentView<'_> {
    fn size(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let range = checked_range(offset, buf.len(), self.len as usize)?;
        positional::read_exact_at(self.file, buf, self.offset + range.start as u64)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let range = checked_range(offset, data.len(), self.len as usize)?;
        positional::write_all_at(self.file, data, self.offset + range.start as u64)
    }
}

#[cfg(unix)]
mod positional {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt as PositionalExt;

    pub(super) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
        PositionalExt::read_exact_at(file, buf, offset)
    }

    pub(super) fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
        PositionalExt::write_all_at(file, data, offset)
    }
}

#[cfg(windows)]
mod positional {
    use std::fs::File;
    use std::io;
    use std::os::windows::fs::FileExt as PositionalExt;

    pub(super) fn read_exact_at(
        file: &File,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match PositionalExt::seek_read(file, buf, offset) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buf = &mut std::mem::take(&mut buf)[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(super) fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
        while !data.is_empty() {
            match PositionalExt::seek_write(file, data, offset) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    data = &data[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_layout(bytes: u64) -> RegionLayout {
        let mut plan = RegionPlan::new();
        plan.request_space("test", bytes).unwrap();
        plan.request_lock("test", "main").unwrap();
        plan.layout()
    }

    // -- RegionPlan ---------------------------------------------------------

    #[test]
    fn align_up_rounds_to_eight() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(9), 16);
    }

    #[test]
    fn repeated_identical_request_is_noop() {
        let mut plan = RegionPlan::new();
        plan.request_space("ring", 100).unwrap();
        plan.request_space("ring", 100).unwrap();
        plan.request_lock("ring", "ring").unwrap();
        plan.request_lock("ring", "ring").unwrap();
        let layout = plan.layout();
        assert_eq!(layout.segments.len(), 1);
        assert_eq!(layout.locks.len(), 1);
        assert_eq!(layout.total_size, 104);
    }

    #[test]
    fn conflicting_request_rejected() {
        let mut plan = RegionPlan::new();
        plan.request_space("ring", 100).unwrap();
        assert!(matches!(plan.request_space("ring", 200), Err(Error::Plan(_))));
        plan.request_lock("ring", "a").unwrap();
        assert!(matches!(plan.request_lock("ring", "b"), Err(Error::Plan(_))));
        assert!(matches!(plan.request_lock("other", "a"), Err(Error::Plan(_))));
    }

    #[test]
    fn invalid_requests_rejected() {
        let mut plan = RegionPlan::new();
        assert!(plan.request_space("", 8).is_err());
        assert!(plan.request_space("x", 0).is_err());
        assert!(plan.request_lock("x", "").is_err());
        assert!(plan.request_lock("x", INIT_LOCK).is_err());
    }

    #[test]
    fn registrants_get_non_overlapping_aligned_segments() {
        let mut plan = RegionPlan::new();
        plan.request_space("a", 13).unwrap();
        plan.request_space("b", 8).unwrap();
        plan.request_space("c", 1).unwrap();
        let layout = plan.layout();
        let a = layout.segment("a").unwrap();
        let b = layout.segment("b").unwrap();
        let c = layout.segment("c").unwrap();
        assert_eq!((a.offset, a.len), (0, 16));
        assert_eq!((b.offset, b.len), (16, 8));
        assert_eq!((c.offset, c.len), (24, 8));
        assert_eq!(layout.total_size, 32);
        assert!(layout.segment("d").is_none());
    }

    // -- SharedRegion -------------------------------------------------------

    #[test]
    fn first_attach_creates_then_attaches() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = single_layout(64);
        let mut runs = 0;
        let first = SharedRegion::create_or_attach(tmp.path(), "r", layout.clone(), |_| {
            runs += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(first.attachment(), Attachment::Created);

        let second =
            SharedRegion::create_or_attach(tmp.path(), "r", layout, |_| panic!("ran init twice"))
                .unwrap();
        assert_eq!(second.attachment(), Attachment::Attached);
        assert_eq!(runs, 1);
        assert!(region_path(tmp.path(), "r").exists());
        assert!(tmp.path().join("r.main.lock").exists());
    }

    #[test]
    fn init_writes_are_visible_to_later_attachers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = single_layout(16);
        let _creator = SharedRegion::create_or_attach(tmp.path(), "r", layout.clone(), |region| {
            let mut view = region.segment("test")?;
            view.write_at(0, b"hello")?;
            Ok(())
        })
        .unwrap();

        let other = SharedRegion::attach_existing(tmp.path(), "r", layout).unwrap();
        let view = other.segment("test").unwrap();
        let mut buf = [0u8; 5];
        view.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn failed_init_leaves_nothing_behind() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = SharedRegion::create_or_attach(tmp.path(), "r", single_layout(8), |_| {
            Err(Error::Corrupt("init failed".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
        assert!(!region_path(tmp.path(), "r").exists());
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn attach_existing_without_region_is_not_initialized() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = SharedRegion::attach_existing(tmp.path(), "r", single_layout(8)).unwrap_err();
        assert!(err.is_not_initialized());
    }

    #[test]
    fn size_mismatch_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        SharedRegion::create_or_attach(tmp.path(), "r", single_layout(64), |_| Ok(())).unwrap();
        let err = SharedRegion::create_or_attach(tmp.path(), "r", single_layout(128), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::LayoutMismatch { .. }));
    }

    #[test]
    fn destroy_removes_region_and_locks_but_not_init_lock() {
        let tmp = tempfile::TempDir::new().unwrap();
        SharedRegion::create_or_attach(tmp.path(), "r", single_layout(8), |_| Ok(())).unwrap();
        // Another region sharing the directory must survive.
        SharedRegion::create_or_attach(tmp.path(), "other", single_layout(8), |_| Ok(())).unwrap();

        assert!(SharedRegion::destroy(tmp.path(), "r").unwrap());
        assert!(!region_path(tmp.path(), "r").exists());
        assert!(!tmp.path().join("r.main.lock").exists());
        assert!(tmp.path().join("r.init.lock").exists());
        assert!(region_path(tmp.path(), "other").exists());
        assert!(tmp.path().join("other.main.lock").exists());

        assert!(!SharedRegion::destroy(tmp.path(), "r").unwrap());
    }

    #[test]
    fn destroy_in_missing_dir_is_noop() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(!SharedRegion::destroy(&tmp.path().join("absent"), "r").unwrap());
    }

    #[test]
    fn lock_path_requires_requested_lock() {
        let tmp = tempfile::TempDir::new().unwrap();
        let region =
            SharedRegion::create_or_attach(tmp.path(), "r", single_layout(8), |_| Ok(())).unwrap();
        assert_eq!(region.lock_path("main").unwrap(), tmp.path().join("r.main.lock"));
        assert!(matches!(region.lock_path("other"), Err(Error::Plan(_))));
        assert!(matches!(region.segment("nobody"), Err(Error::Plan(_))));
    }

    #[test]
    fn segment_view_bounds_checked() {
        let tmp = tempfile::TempDir::new().unwrap();
        let region =
            SharedRegion::create_or_attach(tmp.path(), "r", single_layout(8), |_| Ok(())).unwrap();
        let mut view = region.segment("test").unwrap();
        assert_eq!(view.size(), 8);
        assert!(view.write_at(4, &[1, 2, 3, 4]).is_ok());
        assert!(view.write_at(5, &[1, 2, 3, 4]).is_err());
        let mut buf = [0u8; 9];
        assert!(view.read_at(0, &mut buf).is_err());
    }
}
