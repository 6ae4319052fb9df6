//! Backend-polymorphic transfer contract and shared per-transfer state
//!
//! Every backend (S3, local, ...) implements [`TransferClient`]. A client
//! instance is scoped to one transfer job: it owns the chunk plan and the
//! per-operation retry counters, and exposes chunk-level operations so an
//! external scheduler can parallelize across chunks under its own fan-out.

pub mod local;
pub mod types;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::StatusCode;
use thiserror::Error;

pub use types::{
    EncryptionMetadata, FileHeader, StageInfo, TransferJob, TransferStatus,
};

/// Logical operation a retry counter is keyed by.
///
/// Each key is used for exactly one logical operation per transfer, so
/// counters never need resetting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryKey {
    Probe,
    Initiate,
    Complete,
    Abort,
    Accelerate,
    Chunk(usize),
}

impl fmt::Display for RetryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryKey::Probe => write!(f, "probe"),
            RetryKey::Initiate => write!(f, "initiate"),
            RetryKey::Complete => write!(f, "complete"),
            RetryKey::Abort => write!(f, "abort"),
            RetryKey::Accelerate => write!(f, "accelerate"),
            RetryKey::Chunk(id) => write!(f, "chunk {}", id),
        }
    }
}

/// Transfer client errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("service error: {status} - {message}")]
    Service { status: StatusCode, message: String },

    #[error("retries exhausted for {key} after {attempts} attempts")]
    RetriesExhausted { key: RetryKey, attempts: u32 },

    #[error("security token expired and could not be refreshed")]
    CredentialsExpired,

    #[error("multipart upload incomplete: no etag recorded for part {part}")]
    MissingPartEtag { part: usize },

    #[error("no local destination directory for download")]
    NoLocalDestination,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<quick_xml::Error> for TransferError {
    fn from(err: quick_xml::Error) -> Self {
        TransferError::XmlParse(format!("XML parse error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// How a transfer is split into independently moved chunks.
///
/// `num_chunks == 1` selects the single-request path, anything larger the
/// multipart path. Immutable once computed for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_size: usize,
    pub num_chunks: usize,
    pub total_size: u64,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let num_chunks = (total_size.div_ceil(chunk_size as u64)).max(1) as usize;
        Self {
            chunk_size,
            num_chunks,
            total_size,
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.num_chunks > 1
    }

    /// Byte offset the chunk starts at.
    pub fn offset(&self, chunk_id: usize) -> u64 {
        chunk_id as u64 * self.chunk_size as u64
    }

    /// Inclusive byte range of a chunk; the last chunk is open-ended.
    pub fn byte_range(&self, chunk_id: usize) -> (u64, Option<u64>) {
        let start = self.offset(chunk_id);
        if chunk_id + 1 < self.num_chunks {
            (start, Some(start + self.chunk_size as u64 - 1))
        } else {
            (start, None)
        }
    }
}

/// Contract every storage backend implements.
///
/// One client instance serves one transfer job. `upload`/`download` drive
/// the chunk operations internally; the chunk-level methods are exposed so a
/// caller can schedule them across its own workers. Each chunk operation is
/// independently retryable and idempotent per index.
#[async_trait]
pub trait TransferClient: Send + Sync {
    fn plan(&self) -> &ChunkPlan;

    /// Metadata of the named remote file; `None` means the object does not
    /// exist (job status set to `NotFound`), which is a valid outcome, not
    /// an error.
    async fn probe(&self, job: &mut TransferJob, filename: &str) -> Result<Option<FileHeader>>;

    /// Full upload, single-shot or chunked depending on the plan. On success
    /// sets `result_status = Uploaded` and `dst_file_size`.
    async fn upload(&self, job: &mut TransferJob) -> Result<()>;

    /// Full download. On success sets `result_status = Downloaded` and
    /// `dst_file_size` from the bytes actually written.
    async fn download(&self, job: &mut TransferJob) -> Result<()>;

    /// Transfer one chunk's bytes to its slot. Re-uploading the same index
    /// overwrites the prior part.
    async fn upload_chunk(&self, chunk_id: usize, chunk: Bytes) -> Result<()>;

    /// Fetch one chunk's byte range and write it at its offset in the
    /// destination file.
    async fn download_chunk(&self, chunk_id: usize) -> Result<()>;
}
