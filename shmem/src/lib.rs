pub mod core;
mod errors;
pub mod reader;
pub mod record;
pub mod writer;


pub use crate::core::{ShmemConfig, TemplateSegment};
pub use crate::errors::{Result, ShmemLibError};
pub use crate::reader::{ReaderConfig, TemplateReader, TemplateSnapshot};
pub use crate::record::{BlobKind, BlockTemplate, HexDigest, RecordLayout};
pub use crate::writer::{TemplateWriter, WriterConfig};

pub const DEFAULT_HASHING_BLOB_CAPACITY: usize = crate::core::DEFAULT_HASHING_BLOB_CAPACITY;
pub const DEFAULT_BLOCK_BLOB_CAPACITY: usize = crate::core::DEFAULT_BLOCK_BLOB_CAPACITY;
