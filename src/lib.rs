//! stagehaul - chunked object-storage transfer client with SigV4 signing

pub mod config;
pub mod credentials;
pub mod s3;
pub mod transfer;

pub use config::Config;
pub use credentials::{CredentialRefresher, CredentialSet, StorageCredentials};
pub use s3::S3TransferClient;
pub use transfer::local::LocalTransferClient;
pub use transfer::{
    ChunkPlan, EncryptionMetadata, FileHeader, StageInfo, TransferClient, TransferError,
    TransferJob, TransferStatus,
};
