//! Transfer job records and result types shared by every backend

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of a transfer, written back onto the job by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Uploaded,
    Downloaded,
    NotFound,
    Error,
    Skipped,
}

/// Stage descriptor handed down by the data-loading pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInfo {
    /// Stage location string, `bucket/prefix/...` for remote backends or a
    /// directory path for the local backend.
    pub location: String,

    /// Region of the object store deployment.
    pub region: String,

    /// Service-provided endpoint host override (e.g. FIPS deployments).
    /// Takes priority over every endpoint flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_point: Option<String>,
}

/// Opaque encryption material produced/consumed by an external encryption
/// layer; transported as object metadata, never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    pub key: String,
    pub iv: String,
    pub matdesc: String,
}

/// Result of probing a remote object's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub digest: Option<String>,
    pub content_length: u64,
    pub encryption_metadata: Option<EncryptionMetadata>,
}

/// One file movement. Owned by the caller; the transfer client mutates only
/// the result fields (`result_status`, `dst_file_size`).
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Local path (upload) or remote name (download) of the source.
    pub src_file_name: String,

    /// In-memory source override; when set, uploads read from it instead of
    /// opening `src_file_name`.
    pub src_stream: Option<Bytes>,

    /// Destination name at the stage.
    pub dst_file_name: String,

    /// Declared size of the object being moved; drives the chunk plan.
    pub declared_size: u64,

    /// Hex digest of the file content, carried as object metadata.
    pub sha256_digest: String,

    /// Directory downloads are written into.
    pub local_location: Option<PathBuf>,

    pub encryption_metadata: Option<EncryptionMetadata>,

    pub result_status: TransferStatus,

    /// Size of the object after the transfer. For downloads this is the
    /// stat-reported size of the written file, authoritative over
    /// `declared_size`.
    pub dst_file_size: u64,
}

impl TransferJob {
    /// Job uploading a local file (or stream) to `dst_file_name`.
    pub fn upload(
        src_file_name: impl Into<String>,
        dst_file_name: impl Into<String>,
        declared_size: u64,
    ) -> Self {
        Self {
            src_file_name: src_file_name.into(),
            src_stream: None,
            dst_file_name: dst_file_name.into(),
            declared_size,
            sha256_digest: String::new(),
            local_location: None,
            encryption_metadata: None,
            result_status: TransferStatus::Pending,
            dst_file_size: 0,
        }
    }

    /// Job downloading a remote object into `local_location`.
    pub fn download(
        src_file_name: impl Into<String>,
        dst_file_name: impl Into<String>,
        declared_size: u64,
        local_location: impl Into<PathBuf>,
    ) -> Self {
        Self {
            src_file_name: src_file_name.into(),
            src_stream: None,
            dst_file_name: dst_file_name.into(),
            declared_size,
            sha256_digest: String::new(),
            local_location: Some(local_location.into()),
            encryption_metadata: None,
            result_status: TransferStatus::Pending,
            dst_file_size: 0,
        }
    }
}
