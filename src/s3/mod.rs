//! S3 backend with AWS SigV4 signing
//!
//! This module provides:
//! - AWS Signature Version 4 signing, computed fresh per send attempt
//! - A request dispatcher with bounded retries and expired-token detection
//! - The chunked multipart transfer client

pub mod client;
pub mod dispatch;
pub mod signer;

// Re-export main types for convenience
pub use client::{S3TransferClient, StageLocation};
pub use dispatch::{HttpResponse, RequestDispatcher, RetryPolicy, SignedRequest};
pub use signer::{Headers, SigV4Signer};
