use std::time::Duration;

use shared_memory::ShmemError;
use thiserror::Error;

use crate::record::BlobKind;

pub type Result<T> = std::result::Result<T, ShmemLibError>;

/// Everything that can go wrong while sharing a block template.
///
/// Callers should treat any of these as "template distribution unavailable"
/// and stop handing out work. Nothing in this crate retries on its own.
#[derive(Debug, Error)]
pub enum ShmemLibError {
    #[error("shared memory segment {context}: {source}")]
    Segment {
        context: String,
        #[source]
        source: ShmemError,
    },

    #[error("segment layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("segment was not initialized by its creator within {0:?}")]
    NotReady(Duration),

    #[error("{blob} blob is {size} bytes but the segment holds at most {capacity}")]
    BlobTooLarge {
        blob: BlobKind,
        size: usize,
        capacity: usize,
    },

    #[error("template lock failed: {0}")]
    LockAcquisition(String),

    #[error("template lock not acquired within {0:?}; the holder may have died")]
    LockTimeout(Duration),

    #[error("corrupt template record: {0}")]
    CorruptRecord(String),

    #[error("invalid hex digest: {0}")]
    InvalidDigest(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ShmemLibError {
    pub(crate) fn segment(context: impl Into<String>, source: ShmemError) -> Self {
        ShmemLibError::Segment {
            context: context.into(),
            source,
        }
    }

    /// Errors that mean this process cannot use the mapping at all.
    pub fn is_segment_error(&self) -> bool {
        matches!(
            self,
            ShmemLibError::Segment { .. }
                | ShmemLibError::LayoutMismatch(_)
                | ShmemLibError::NotReady(_)
                | ShmemLibError::CorruptRecord(_)
        )
    }

    /// Only an oversized template is something the fetcher can recover from.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ShmemLibError::BlobTooLarge { .. } | ShmemLibError::InvalidDigest(_)
        )
    }
}
