use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use super::core::*;
use crate::errors::Result;
use crate::record::BlockTemplate;

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub shmem: ShmemConfig,
}

/// A private copy of the shared template and the version it was taken at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateSnapshot {
    pub version: u64,
    pub template: BlockTemplate,
}

pub struct TemplateReader {
    segment: Arc<TemplateSegment>,
    last_seen_version: u64,
}

impl TemplateReader {
    pub fn new(cfg: &ReaderConfig) -> Result<TemplateReader> {
        let segment = TemplateSegment::init(&cfg.shmem)?;
        Ok(TemplateReader::from_segment(Arc::new(segment)))
    }

    /// Shares an existing attachment, e.g. between worker threads.
    pub fn from_segment(segment: Arc<TemplateSegment>) -> TemplateReader {
        TemplateReader {
            segment,
            last_seen_version: 0,
        }
    }

    pub fn segment(&self) -> &Arc<TemplateSegment> {
        &self.segment
    }

    /// Copies the whole record under the lock; never a mix of two updates.
    pub fn get_latest(&self) -> Result<TemplateSnapshot> {
        let mut snapshot = TemplateSnapshot::default();
        self.read_into(&mut snapshot)?;
        Ok(snapshot)
    }

    /// Like [`get_latest`](Self::get_latest) but reuses `out`'s buffers.
    pub fn read_into(&self, out: &mut TemplateSnapshot) -> Result<()> {
        self.segment.with_record(|record| -> Result<()> {
            record.read_template_into(&mut out.template)?;
            out.version = record.version();
            Ok(())
        })?
    }

    /// True only when the shared version is strictly greater than
    /// `local_version`. A local version ahead of the shared one is not newer.
    pub fn is_newer(&self, local_version: u64) -> Result<bool> {
        let shared = self.segment.with_record(|record| record.version())?;
        Ok(shared > local_version)
    }

    /// Version of the last snapshot [`refresh`](Self::refresh) handed out.
    pub fn last_seen_version(&self) -> u64 {
        self.last_seen_version
    }

    /// Returns the latest snapshot if it is newer than the last one this
    /// reader returned, without copying the blobs when nothing changed.
    pub fn refresh(&mut self) -> Result<Option<TemplateSnapshot>> {
        if !self.is_newer(self.last_seen_version)? {
            return Ok(None);
        }
        let snapshot = self.get_latest()?;
        tracing::debug!(
            from = self.last_seen_version,
            to = snapshot.version,
            height = snapshot.template.height,
            "picked up newer block template"
        );
        self.last_seen_version = snapshot.version;
        Ok(Some(snapshot))
    }

    pub fn close(self) {
        if let Ok(segment) = Arc::try_unwrap(self.segment) {
            segment.close();
        }
    }
}
