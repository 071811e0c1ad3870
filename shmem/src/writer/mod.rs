use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use super::core::*;
use crate::errors::Result;
use crate::record::BlockTemplate;

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct WriterConfig {
    pub shmem: ShmemConfig,
}

/// Publishes block templates for every attached worker.
///
/// Normally only the fetcher holds one. More than one writer works, but when
/// two race the last to take the lock wins the content.
pub struct TemplateWriter {
    segment: Arc<TemplateSegment>,
}

impl TemplateWriter {
    pub fn new(cfg: &WriterConfig) -> Result<TemplateWriter> {
        let segment = TemplateSegment::init(&cfg.shmem)?;
        Ok(TemplateWriter::from_segment(Arc::new(segment)))
    }

    pub fn from_segment(segment: Arc<TemplateSegment>) -> TemplateWriter {
        TemplateWriter { segment }
    }

    pub fn segment(&self) -> &Arc<TemplateSegment> {
        &self.segment
    }

    /// Replaces the shared template and returns its new version.
    ///
    /// An oversized blob is rejected before the lock is taken, so the shared
    /// record and its version stay as they were.
    pub fn update(&self, template: &BlockTemplate) -> Result<u64> {
        self.segment.layout().validate(template)?;
        let version = self.segment.with_record_mut(|record| -> Result<u64> {
            record.write_template(template)?;
            Ok(record.bump_version())
        })??;
        tracing::debug!(
            version,
            height = template.height,
            hashing_blob = template.hashing_blob.len(),
            "published block template"
        );
        Ok(version)
    }

    pub fn current_version(&self) -> Result<u64> {
        self.segment.with_record(|record| record.version())
    }

    pub fn close(self) {
        if let Ok(segment) = Arc::try_unwrap(self.segment) {
            segment.close();
        }
    }
}
