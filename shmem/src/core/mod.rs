use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use serde_derive::{Deserialize, Serialize};

use crate::errors::{Result, ShmemLibError};
use crate::record::{RecordLayout, RecordView, RECORD_OFFSET};

pub mod lock;

use self::lock::SharedLock;

pub const DEFAULT_HASHING_BLOB_CAPACITY: usize = 4096;
pub const DEFAULT_BLOCK_BLOB_CAPACITY: usize = 65536;
pub const MAX_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

pub static SHMEM_FILE_NAME: &str = "pool-template";

/// Segment header, at offset 0.
pub(crate) const HEADER_SIZE: usize = 64;
/// Room reserved for the process-shared mutex, right after the header.
pub(crate) const LOCK_REGION_SIZE: usize = 128;

const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"POOLTPL\0");
const LAYOUT_VERSION: u32 = 1;

const STATE_UNINIT: u32 = 0;
const STATE_READY: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
struct HeaderFields {
    magic: u64,
    layout_version: u32,
    _reserved: u32,
    segment_size: u64,
    hashing_blob_capacity: u64,
    block_blob_capacity: u64,
}

#[repr(C)]
struct SegmentHeader {
    /// Flipped to READY by the creator once the lock is usable.
    state: AtomicU32,
    _pad: u32,
    fields: HeaderFields,
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() <= HEADER_SIZE);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub data_dir: String,
    pub shmem_file_name: String,
    pub hashing_blob_capacity: usize,
    pub block_blob_capacity: usize,
    /// 0 waits forever.
    pub lock_timeout_ms: u64,
    pub attach_timeout_ms: u64,
    /// Replace whatever segment the link file points at instead of attaching
    /// to it. Only the fetcher sets this.
    pub recreate: bool,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            data_dir: "/tmp".to_string(),
            shmem_file_name: SHMEM_FILE_NAME.to_string(),
            hashing_blob_capacity: DEFAULT_HASHING_BLOB_CAPACITY,
            block_blob_capacity: DEFAULT_BLOCK_BLOB_CAPACITY,
            lock_timeout_ms: 5000,
            attach_timeout_ms: 2000,
            recreate: false,
        }
    }
}

impl ShmemConfig {
    pub fn builder() -> ShmemConfigBuilder {
        ShmemConfigBuilder {
            cfg: ShmemConfig::default(),
        }
    }

    /// The link file every cooperating process opens the segment by.
    pub fn link_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.shmem_file_name)
    }

    pub fn layout(&self) -> RecordLayout {
        RecordLayout::new(self.hashing_blob_capacity, self.block_blob_capacity)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.lock_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shmem_file_name.is_empty() {
            return Err(ShmemLibError::Config("shmem_file_name is empty".into()));
        }
        if self.hashing_blob_capacity == 0 {
            return Err(ShmemLibError::Config(
                "hashing_blob_capacity must be non-zero".into(),
            ));
        }
        if self.hashing_blob_capacity > MAX_SEGMENT_SIZE
            || self.block_blob_capacity > MAX_SEGMENT_SIZE
            || self.layout().segment_size() > MAX_SEGMENT_SIZE
        {
            return Err(ShmemLibError::Config(format!(
                "blob capacities {} + {} exceed the {} byte segment limit",
                self.hashing_blob_capacity, self.block_blob_capacity, MAX_SEGMENT_SIZE
            )));
        }
        Ok(())
    }
}

pub struct ShmemConfigBuilder {
    cfg: ShmemConfig,
}

impl ShmemConfigBuilder {
    pub fn data_dir(mut self, data_dir: impl Into<String>) -> Self {
        self.cfg.data_dir = data_dir.into();
        self
    }

    pub fn shmem_file_name(mut self, name: impl Into<String>) -> Self {
        self.cfg.shmem_file_name = name.into();
        self
    }

    pub fn hashing_blob_capacity(mut self, capacity: usize) -> Self {
        self.cfg.hashing_blob_capacity = capacity;
        self
    }

    pub fn block_blob_capacity(mut self, capacity: usize) -> Self {
        self.cfg.block_blob_capacity = capacity;
        self
    }

    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.cfg.lock_timeout_ms = ms;
        self
    }

    pub fn attach_timeout_ms(mut self, ms: u64) -> Self {
        self.cfg.attach_timeout_ms = ms;
        self
    }

    pub fn recreate(mut self, recreate: bool) -> Self {
        self.cfg.recreate = recreate;
        self
    }

    pub fn build(self) -> Result<ShmemConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// This process's attachment to the shared template segment.
///
/// Whoever creates the segment owns it: dropping the owner's handle removes
/// the OS object and the link file, dropping anyone else's only unmaps.
///
/// Records are only written through [`TemplateWriter::update`](crate::TemplateWriter::update):
///
/// ```compile_fail
/// fn bump(segment: &template_shmem::TemplateSegment) {
///     let _ = segment.with_record_mut(|_record| ());
/// }
/// ```
pub struct TemplateSegment {
    // Declared before `shmem` so the mutex handle goes away before the mapping.
    lock: SharedLock,
    shmem: Shmem,
    layout: RecordLayout,
}

// The mapping and the mutex handle are raw pointers into memory that every
// attached process shares anyway; all record access goes through the lock.
unsafe impl Send for TemplateSegment {}
unsafe impl Sync for TemplateSegment {}

fn open_linked(link: &Path) -> Result<Shmem> {
    ShmemConf::new()
        .flink(link)
        .open()
        .map_err(|e| ShmemLibError::segment(format!("open {}", link.display()), e))
}

impl TemplateSegment {
    /// Attaches to the segment named by `cfg`, creating it if nobody has.
    pub fn init(cfg: &ShmemConfig) -> Result<TemplateSegment> {
        cfg.validate()?;
        let layout = cfg.layout();
        let link = cfg.link_path();
        if cfg.recreate {
            remove_stale(&link);
        }

        let mut conf = ShmemConf::new().size(layout.segment_size()).flink(&link);
        if cfg.recreate {
            conf = conf.force_create_flink();
        }
        let shmem = match conf.create() {
            Ok(v) => v,
            Err(ShmemError::LinkExists) => open_linked(&link)?,
            Err(e) => return Err(ShmemLibError::segment(format!("create {}", link.display()), e)),
        };

        let segment = if shmem.is_owner() {
            TemplateSegment::initialize(shmem, layout, cfg)?
        } else {
            TemplateSegment::attach(shmem, layout, cfg)?
        };
        tracing::info!("shmem info: {}", segment);
        Ok(segment)
    }

    fn initialize(shmem: Shmem, layout: RecordLayout, cfg: &ShmemConfig) -> Result<TemplateSegment> {
        let size = layout.segment_size();
        if shmem.len() < size {
            return Err(ShmemLibError::LayoutMismatch(format!(
                "created {} bytes, layout needs {}",
                shmem.len(),
                size
            )));
        }
        let base = shmem.as_ptr();
        let header = base as *mut SegmentHeader;
        let lock = unsafe {
            ptr::write_bytes(base, 0, size);
            ptr::addr_of_mut!((*header).fields).write(HeaderFields {
                magic: SEGMENT_MAGIC,
                layout_version: LAYOUT_VERSION,
                _reserved: 0,
                segment_size: size as u64,
                hashing_blob_capacity: layout.hashing_blob_capacity() as u64,
                block_blob_capacity: layout.block_blob_capacity() as u64,
            });
            SharedLock::create(base.add(HEADER_SIZE), base.add(RECORD_OFFSET), cfg.lock_timeout())?
        };
        state(base).store(STATE_READY, Ordering::Release);
        Ok(TemplateSegment { lock, shmem, layout })
    }

    fn attach(shmem: Shmem, layout: RecordLayout, cfg: &ShmemConfig) -> Result<TemplateSegment> {
        if shmem.len() < HEADER_SIZE {
            return Err(ShmemLibError::LayoutMismatch(format!(
                "existing segment is only {} bytes",
                shmem.len()
            )));
        }
        let base = shmem.as_ptr();
        wait_ready(base, cfg.attach_timeout())?;

        let found = unsafe { ptr::addr_of!((*(base as *const SegmentHeader)).fields).read() };
        let expected = HeaderFields {
            magic: SEGMENT_MAGIC,
            layout_version: LAYOUT_VERSION,
            _reserved: 0,
            segment_size: layout.segment_size() as u64,
            hashing_blob_capacity: layout.hashing_blob_capacity() as u64,
            block_blob_capacity: layout.block_blob_capacity() as u64,
        };
        if found != expected {
            tracing::warn!(?found, ?expected, "refusing to attach to template segment");
            return Err(ShmemLibError::LayoutMismatch(format!(
                "segment has capacities {}/{} (layout v{}), this process expects {}/{} (layout v{})",
                found.hashing_blob_capacity,
                found.block_blob_capacity,
                found.layout_version,
                expected.hashing_blob_capacity,
                expected.block_blob_capacity,
                expected.layout_version,
            )));
        }
        if shmem.len() < layout.segment_size() {
            return Err(ShmemLibError::LayoutMismatch(format!(
                "mapped {} bytes, layout needs {}",
                shmem.len(),
                layout.segment_size()
            )));
        }

        let lock = unsafe {
            SharedLock::attach(base.add(HEADER_SIZE), base.add(RECORD_OFFSET), cfg.lock_timeout())?
        };
        Ok(TemplateSegment { lock, shmem, layout })
    }

    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }

    pub fn link_path(&self) -> Option<&Path> {
        self.shmem.get_flink_path().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    pub(crate) fn lock(&self) -> &SharedLock {
        &self.lock
    }

    /// Runs `f` against the record with the lock held.
    pub fn with_record<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RecordView<'_>) -> R,
    {
        let guard = self.lock.acquire()?;
        let view = unsafe { RecordView::new(guard.data_ptr(), self.layout) };
        let result = f(&view);
        guard.release();
        Ok(result)
    }

    /// Runs `f` against the record with the lock held, allowing writes.
    pub(crate) fn with_record_mut<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RecordView<'_>) -> R,
    {
        let guard = self.lock.acquire()?;
        let mut view = unsafe { RecordView::new(guard.data_ptr(), self.layout) };
        let result = f(&mut view);
        guard.release();
        Ok(result)
    }

    /// Unmaps; the owner also removes the segment. Same as dropping.
    pub fn close(self) {
        tracing::info!(owner = self.is_owner(), os_id = self.os_id(), "closing template segment");
    }
}

impl fmt::Display for TemplateSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "os_id={} link={} size={} owner={} capacities={}/{}",
            self.os_id(),
            self.link_path()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.len(),
            self.is_owner(),
            self.layout.hashing_blob_capacity(),
            self.layout.block_blob_capacity(),
        )
    }
}

/// Takes ownership of a segment left behind by a previous creator so that
/// dropping it unlinks both the OS object and the link file. A process still
/// attached keeps its mapping of the old segment until it reattaches.
fn remove_stale(link: &Path) {
    if !link.exists() {
        return;
    }
    match open_linked(link) {
        Ok(mut stale) => {
            tracing::warn!(
                link = %link.display(),
                os_id = stale.get_os_id(),
                "replacing existing template segment"
            );
            stale.set_owner(true);
        }
        // The OS object is already gone; `force_create_flink` rewrites the link.
        Err(e) => tracing::warn!(link = %link.display(), error = %e, "dangling template segment link"),
    }
}

#[inline]
fn state<'a>(base: *mut u8) -> &'a AtomicU32 {
    unsafe { &*ptr::addr_of!((*(base as *const SegmentHeader)).state) }
}

/// Waits for the creator to finish initializing; a creator that died halfway
/// leaves the state UNINIT and we give up after `timeout`.
fn wait_ready(base: *mut u8, timeout: Duration) -> Result<()> {
    let started = Instant::now();
    loop {
        match state(base).load(Ordering::Acquire) {
            STATE_READY => return Ok(()),
            STATE_UNINIT if started.elapsed() < timeout => thread::sleep(Duration::from_millis(1)),
            STATE_UNINIT => return Err(ShmemLibError::NotReady(timeout)),
            other => {
                return Err(ShmemLibError::LayoutMismatch(format!(
                    "unknown segment state {}",
                    other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Arc};

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::record::BlockTemplate;

    fn test_config(dir: &TempDir, capacity: usize) -> ShmemConfig {
        static SHMEM_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);
        ShmemConfig::builder()
            .data_dir(dir.path().to_string_lossy())
            .shmem_file_name(format!(
                "core_test_{}_{}",
                std::process::id(),
                SHMEM_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
            ))
            .hashing_blob_capacity(capacity)
            .block_blob_capacity(capacity)
            .lock_timeout_ms(1000)
            .build()
            .unwrap()
    }

    #[test]
    fn config_rejects_bad_values() {
        assert!(ShmemConfig::builder().shmem_file_name("").build().is_err());
        assert!(ShmemConfig::builder().hashing_blob_capacity(0).build().is_err());
        assert!(ShmemConfig::builder()
            .block_blob_capacity(MAX_SEGMENT_SIZE)
            .build()
            .is_err());
        assert!(ShmemConfig::builder()
            .block_blob_capacity(usize::MAX)
            .build()
            .is_err());
        assert_eq!(ShmemConfig::builder().lock_timeout_ms(0).build().unwrap().lock_timeout(), None);
    }

    #[test]
    fn creator_owns_and_attacher_does_not() {
        let dir = tempdir().unwrap();
        let cfg = test_config(&dir, 4096);

        let owner = TemplateSegment::init(&cfg).unwrap();
        assert!(owner.is_owner());
        assert!(owner.len() >= cfg.layout().segment_size());

        let other = TemplateSegment::init(&cfg).unwrap();
        assert!(!other.is_owner());
        assert_eq!(other.os_id(), owner.os_id());
        assert_eq!(owner.with_record(|r| r.version()).unwrap(), 0);
    }

    #[test]
    fn fresh_record_is_zeroed() {
        let dir = tempdir().unwrap();
        let segment = TemplateSegment::init(&test_config(&dir, 256)).unwrap();
        let template = segment.with_record(|r| r.read_template()).unwrap().unwrap();
        assert_eq!(template, BlockTemplate::default());
    }

    #[test]
    fn writes_are_visible_through_another_mapping() {
        let dir = tempdir().unwrap();
        let cfg = test_config(&dir, 256);
        let writer = TemplateSegment::init(&cfg).unwrap();
        let reader = TemplateSegment::init(&cfg).unwrap();

        let mut template = BlockTemplate::default();
        template.height = 42;
        template.hashing_blob = vec![9; 256];
        writer
            .with_record_mut(|r| {
                r.write_template(&template)?;
                Ok::<_, ShmemLibError>(r.bump_version())
            })
            .unwrap()
            .unwrap();

        let (version, seen) = reader
            .with_record(|r| (r.version(), r.read_template()))
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(seen.unwrap(), template);
    }

    #[test]
    fn capacity_mismatch_is_refused() {
        let dir = tempdir().unwrap();
        let cfg = test_config(&dir, 4096);
        let _owner = TemplateSegment::init(&cfg).unwrap();

        let mut skewed = cfg.clone();
        skewed.hashing_blob_capacity = 8192;
        match TemplateSegment::init(&skewed) {
            Err(ShmemLibError::LayoutMismatch(msg)) => assert!(msg.contains("4096")),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("attached with mismatched capacity"),
        }
    }

    #[test]
    fn owner_close_removes_link_file() {
        let dir = tempdir().unwrap();
        let cfg = test_config(&dir, 64);
        let owner = TemplateSegment::init(&cfg).unwrap();
        let other = TemplateSegment::init(&cfg).unwrap();
        assert!(cfg.link_path().exists());

        other.close();
        assert!(cfg.link_path().exists());
        owner.close();
        assert!(!cfg.link_path().exists());
    }

    #[test]
    fn recreate_replaces_segment_left_by_dead_owner() {
        let dir = tempdir().unwrap();
        let cfg = test_config(&dir, 64);

        // A creator that dies mid-update: the lock stays held and nothing
        // unlinks the segment.
        let crashed = TemplateSegment::init(&cfg).unwrap();
        std::mem::forget(crashed.lock().acquire().unwrap());
        let stale_id = crashed.os_id().to_string();
        std::mem::forget(crashed);
        assert!(cfg.link_path().exists());

        let mut restart = cfg.clone();
        restart.recreate = true;
        let restarted = TemplateSegment::init(&restart).unwrap();
        assert!(restarted.is_owner());
        assert_ne!(restarted.os_id(), stale_id);

        let mut template = BlockTemplate::default();
        template.height = 7;
        let version = restarted
            .with_record_mut(|r| {
                r.write_template(&template)?;
                Ok::<_, ShmemLibError>(r.bump_version())
            })
            .unwrap()
            .unwrap();
        assert_eq!(version, 1);

        let worker = TemplateSegment::init(&cfg).unwrap();
        assert_eq!(worker.os_id(), restarted.os_id());
        assert_eq!(worker.with_record(|r| r.read_template()).unwrap().unwrap(), template);

        worker.close();
        restarted.close();
        assert!(!cfg.link_path().exists());
    }

    #[test]
    fn recreate_without_existing_segment_just_creates() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir, 64);
        cfg.recreate = true;
        let segment = TemplateSegment::init(&cfg).unwrap();
        assert!(segment.is_owner());
        assert_eq!(segment.with_record(|r| r.version()).unwrap(), 0);
    }

    #[test]
    fn missing_directory_is_a_segment_error() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir, 64);
        cfg.data_dir = dir.path().join("does/not/exist").to_string_lossy().into_owned();
        let err = TemplateSegment::init(&cfg).err().unwrap();
        assert!(err.is_segment_error(), "{}", err);
    }

    #[test]
    fn held_lock_times_out() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir, 64);
        let holder = Arc::new(TemplateSegment::init(&cfg).unwrap());
        cfg.lock_timeout_ms = 50;
        let waiter = TemplateSegment::init(&cfg).unwrap();

        let (held_tx, held_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let holding = {
            let holder = Arc::clone(&holder);
            thread::spawn(move || {
                let guard = holder.lock().acquire().unwrap();
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
                guard.release();
            })
        };

        held_rx.recv().unwrap();
        match waiter.with_record(|r| r.version()) {
            Err(ShmemLibError::LockTimeout(t)) => assert_eq!(t, Duration::from_millis(50)),
            other => panic!("expected LockTimeout, got {:?}", other.map(|_| ())),
        }
        done_tx.send(()).unwrap();
        holding.join().unwrap();

        assert_eq!(waiter.with_record(|r| r.version()).unwrap(), 0);
    }
}
