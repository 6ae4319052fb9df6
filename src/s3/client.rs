//! S3 transfer backend
//!
//! Drives the multipart state machine (initiate, part uploads, complete or
//! abort) on top of the signed request dispatcher. One client instance serves
//! one transfer job and owns its chunk plan, multipart state and retry
//! counters; chunk operations are independently retryable and safe to fan out
//! across concurrent workers.

use std::borrow::Cow;
use std::fmt::Write as FmtWrite;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use hyper::header::{CONTENT_LENGTH, ETAG};
use hyper::{HeaderMap, Method, StatusCode};
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::config::TransferConfig;
use crate::credentials::StorageCredentials;
use crate::s3::dispatch::{HttpResponse, RequestDispatcher, SignedRequest};
use crate::s3::signer::{sha256_hex, Headers, SigV4Signer};
use crate::transfer::{
    ChunkPlan, EncryptionMetadata, FileHeader, Result, RetryKey, StageInfo, TransferClient,
    TransferError, TransferJob, TransferStatus,
};

/// Vendor-reserved object-metadata header prefix.
const META_PREFIX: &str = "x-amz-meta-";
/// Content digest key under the reserved prefix.
const DIGEST: &str = "sha256-digest";

// Client-side encryption material keys, carried opaquely.
const AMZ_KEY: &str = "x-amz-key";
const AMZ_IV: &str = "x-amz-iv";
const AMZ_MATDESC: &str = "x-amz-matdesc";

const OCTET_STREAM: &str = "application/octet-stream";

/// Hex lookup table for URI encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Bucket and key prefix parsed once from a stage-location string.
///
/// `bucket/prefix/...` splits on the first `/`; a non-empty prefix is
/// normalized to end with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLocation {
    pub bucket: String,
    pub prefix: String,
}

impl StageLocation {
    pub fn parse(location: &str) -> Self {
        let (bucket, path) = match location.find('/') {
            Some(pos) => (&location[..pos], &location[pos + 1..]),
            None => (location, ""),
        };
        let mut prefix = path.to_string();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self {
            bucket: bucket.to_string(),
            prefix,
        }
    }
}

/// Endpoint precedence: explicit service override, then the accelerate flag,
/// then the regional form, then the global virtual-hosted default.
fn select_endpoint(location: &StageLocation, stage: &StageInfo, config: &TransferConfig) -> String {
    if let Some(end_point) = &stage.end_point {
        format!("https://{}.{}", location.bucket, end_point)
    } else if config.use_accelerate_endpoint {
        format!("https://{}.s3-accelerate.amazonaws.com", location.bucket)
    } else if config.use_regional_url {
        format!(
            "https://{}.s3.{}.amazonaws.com",
            location.bucket, stage.region
        )
    } else {
        format!("https://{}.s3.amazonaws.com", location.bucket)
    }
}

/// Live multipart upload: the remote-assigned id plus one etag slot per
/// planned chunk. `upload_id` stays set throughout the part phase and is
/// cleared only by completion or abort.
#[derive(Debug, Default)]
struct MultipartState {
    upload_id: Option<String>,
    etags: Vec<Option<String>>,
}

/// S3 backend of the transfer contract.
pub struct S3TransferClient {
    dispatcher: RequestDispatcher,
    signer: SigV4Signer,
    location: StageLocation,
    endpoint: String,
    plan: ChunkPlan,
    concurrency: usize,
    // Snapshot of the job fields the chunk operations need; the job record
    // itself stays with the caller.
    src_file_name: String,
    src_stream: Option<Bytes>,
    dst_file_name: String,
    download_path: Option<PathBuf>,
    sha256_digest: String,
    encryption_metadata: Option<EncryptionMetadata>,
    state: Mutex<MultipartState>,
}

impl S3TransferClient {
    pub fn new(
        job: &TransferJob,
        stage: &StageInfo,
        credentials: Arc<StorageCredentials>,
        config: &TransferConfig,
    ) -> Self {
        let location = StageLocation::parse(&stage.location);
        let endpoint = select_endpoint(&location, stage, config);
        let plan = ChunkPlan::new(job.declared_size, config.effective_chunk_size());
        let dispatcher =
            RequestDispatcher::new(credentials, config.retry_policy(), config.insecure_tls);
        let download_path = job.local_location.as_ref().map(|dir| {
            let name = Path::new(&job.dst_file_name)
                .file_name()
                .unwrap_or_else(|| job.dst_file_name.as_ref());
            dir.join(name)
        });

        Self {
            dispatcher,
            signer: SigV4Signer::new(stage.region.clone()),
            location,
            endpoint,
            plan,
            concurrency: config.concurrency.max(1),
            src_file_name: job.src_file_name.clone(),
            src_stream: job.src_stream.clone(),
            dst_file_name: job.dst_file_name.clone(),
            download_path,
            sha256_digest: job.sha256_digest.clone(),
            encryption_metadata: job.encryption_metadata.clone(),
            state: Mutex::new(MultipartState::default()),
        }
    }

    /// Encode an object key, preserving forward slashes.
    /// Returns Cow::Borrowed when no encoding is needed (common case).
    fn encode_key(key: &str) -> Cow<'_, str> {
        let needs_encoding = key
            .bytes()
            .any(|b| !matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/'));

        if !needs_encoding {
            return Cow::Borrowed(key);
        }

        let mut result = String::with_capacity(key.len() + 32);
        for byte in key.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                    result.push(byte as char);
                }
                _ => {
                    result.push('%');
                    result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                    result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
                }
            }
        }
        Cow::Owned(result)
    }

    /// Encode a string for use in a URL query parameter value (RFC 3986).
    fn url_encode_into(buf: &mut String, s: &str) {
        for byte in s.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    buf.push(byte as char);
                }
                _ => {
                    buf.push('%');
                    buf.push(HEX_UPPER[(byte >> 4) as usize] as char);
                    buf.push(HEX_UPPER[(byte & 0xf) as usize] as char);
                }
            }
        }
    }

    /// Full URL of a named object under the stage prefix.
    fn object_url(&self, name: &str) -> String {
        let key = format!("{}{}", self.location.prefix, name.trim_start_matches('/'));
        let encoded = Self::encode_key(&key);
        let mut url = String::with_capacity(self.endpoint.len() + 1 + encoded.len());
        url.push_str(&self.endpoint);
        url.push('/');
        url.push_str(&encoded);
        url
    }

    /// Object metadata attached to uploads: the content digest plus the
    /// encryption triple when present.
    fn object_metadata(&self) -> Headers {
        let mut headers = Headers::new();
        headers.set(&format!("{}{}", META_PREFIX, DIGEST), &self.sha256_digest);
        if let Some(enc) = &self.encryption_metadata {
            headers.set(&format!("{}{}", META_PREFIX, AMZ_KEY), &enc.key);
            headers.set(&format!("{}{}", META_PREFIX, AMZ_IV), &enc.iv);
            headers.set(&format!("{}{}", META_PREFIX, AMZ_MATDESC), &enc.matdesc);
        }
        headers
    }

    /// Send one signed request through the dispatcher.
    ///
    /// The payload hash is computed once here; the build closure re-signs
    /// with a fresh timestamp and credential snapshot on every attempt.
    async fn send(
        &self,
        method: Method,
        url: &str,
        retry_key: RetryKey,
        headers: Headers,
        body: Bytes,
    ) -> Result<HttpResponse> {
        let payload_hash = sha256_hex(&body);
        let verb = method.as_str().to_owned();
        self.dispatcher
            .send(method, retry_key, move |creds| {
                let signed = self.signer.sign_with_hash(
                    &verb,
                    url,
                    headers.clone(),
                    &payload_hash,
                    creds,
                    Utc::now(),
                );
                SignedRequest {
                    url: url.to_string(),
                    headers: signed,
                    body: body.clone(),
                }
            })
            .await
    }

    /// Read the chunk's byte range from the in-memory stream or source file.
    fn read_chunk(&self, chunk_id: usize) -> Result<Bytes> {
        let start = self.plan.offset(chunk_id);
        let len = (self.plan.total_size.saturating_sub(start)).min(self.plan.chunk_size as u64)
            as usize;
        if let Some(stream) = &self.src_stream {
            let start = (start as usize).min(stream.len());
            let end = (start + len).min(stream.len());
            return Ok(stream.slice(start..end));
        }
        let mut file = std::fs::File::open(&self.src_file_name)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(Bytes::from(buffer))
    }

    /// Write a downloaded chunk at its byte offset in the destination file.
    fn write_chunk(&self, chunk_id: usize, data: &[u8]) -> Result<()> {
        let dst = self
            .download_path
            .as_ref()
            .ok_or(TransferError::NoLocalDestination)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(dst)?;
        file.seek(SeekFrom::Start(self.plan.offset(chunk_id)))?;
        file.write_all(data)?;
        Ok(())
    }

    async fn initiate_multipart_upload(&self) -> Result<()> {
        let url = format!("{}?uploads", self.object_url(&self.dst_file_name));
        let mut headers = self.object_metadata();
        headers.set("content-type", OCTET_STREAM);

        let response = self
            .send(Method::POST, &url, RetryKey::Initiate, headers, Bytes::new())
            .await?;
        if response.status != StatusCode::OK {
            return Err(service_error(response));
        }

        let upload_id = parse_upload_id(&response.body)?;
        debug!(upload_id = %upload_id, chunks = self.plan.num_chunks, "multipart upload initiated");

        let mut state = self.state.lock().unwrap();
        state.upload_id = Some(upload_id);
        state.etags = vec![None; self.plan.num_chunks];
        Ok(())
    }

    /// Fan the part uploads out with bounded concurrency. Completion order is
    /// unconstrained; each part records its etag at its own slot.
    async fn upload_parts(&self) -> Result<()> {
        let results: Vec<Result<()>> = stream::iter(0..self.plan.num_chunks)
            .map(|chunk_id| async move {
                let chunk = self.read_chunk(chunk_id)?;
                self.upload_chunk(chunk_id, chunk).await
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for result in results {
            result?;
        }
        Ok(())
    }

    /// Merge the uploaded parts server-side.
    ///
    /// Refuses while any etag slot is unpopulated. The part list is emitted
    /// in ascending part-number order with etag values exactly as the store
    /// returned them.
    async fn complete_multipart_upload(&self) -> Result<()> {
        let (upload_id, etags) = {
            let state = self.state.lock().unwrap();
            let upload_id = state
                .upload_id
                .clone()
                .ok_or_else(|| TransferError::InvalidResponse("no multipart upload in flight".to_string()))?;
            let mut etags = Vec::with_capacity(state.etags.len());
            for (idx, etag) in state.etags.iter().enumerate() {
                match etag {
                    Some(etag) => etags.push(etag.clone()),
                    None => return Err(TransferError::MissingPartEtag { part: idx + 1 }),
                }
            }
            (upload_id, etags)
        };

        let base_url = self.object_url(&self.dst_file_name);
        let mut url = String::with_capacity(base_url.len() + 64);
        url.push_str(&base_url);
        url.push_str("?uploadId=");
        Self::url_encode_into(&mut url, &upload_id);

        let mut xml = String::with_capacity(etags.len() * 96 + 64);
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        xml.push_str("<CompleteMultipartUpload>");
        for (idx, etag) in etags.iter().enumerate() {
            xml.push_str("<Part><PartNumber>");
            let _ = write!(xml, "{}", idx + 1);
            xml.push_str("</PartNumber><ETag>");
            xml.push_str(etag);
            xml.push_str("</ETag></Part>");
        }
        xml.push_str("</CompleteMultipartUpload>");

        debug!(upload_id = %upload_id, parts = etags.len(), "completing multipart upload");

        let mut headers = Headers::new();
        headers.set("content-type", "application/xml");

        let response = self
            .send(
                Method::POST,
                &url,
                RetryKey::Complete,
                headers,
                Bytes::from(xml),
            )
            .await?;
        if !response.status.is_success() {
            return Err(service_error(response));
        }

        self.state.lock().unwrap().upload_id = None;
        Ok(())
    }

    /// Cancel the upload and drop the parts uploaded so far. A no-op when no
    /// upload was ever initiated.
    async fn abort_multipart_upload(&self) -> Result<()> {
        let upload_id = match self.state.lock().unwrap().upload_id.clone() {
            Some(id) => id,
            None => return Ok(()),
        };

        let base_url = self.object_url(&self.dst_file_name);
        let mut url = String::with_capacity(base_url.len() + 64);
        url.push_str(&base_url);
        url.push_str("?uploadId=");
        Self::url_encode_into(&mut url, &upload_id);

        warn!(upload_id = %upload_id, "aborting multipart upload");

        let response = self
            .send(
                Method::DELETE,
                &url,
                RetryKey::Abort,
                Headers::new(),
                Bytes::new(),
            )
            .await?;
        if !response.status.is_success() {
            return Err(service_error(response));
        }

        self.state.lock().unwrap().upload_id = None;
        Ok(())
    }

    async fn perform_upload(&self) -> Result<()> {
        if !self.plan.is_multipart() {
            let chunk = self.read_chunk(0)?;
            return self.upload_chunk(0, chunk).await;
        }

        self.initiate_multipart_upload().await?;
        let result = match self.upload_parts().await {
            Ok(()) => self.complete_multipart_upload().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            // The abort's own failure is reported alongside, never in place
            // of, the failure that triggered it.
            if let Err(abort_err) = self.abort_multipart_upload().await {
                warn!(error = %abort_err, "abort after failed upload also failed");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Returns the stat-reported size of the written file.
    async fn perform_download(&self) -> Result<u64> {
        let dst = self
            .download_path
            .clone()
            .ok_or(TransferError::NoLocalDestination)?;
        if let Some(dir) = dst.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // Pre-size the file so concurrent chunk writers land at their offsets.
        let file = std::fs::File::create(&dst)?;
        file.set_len(self.plan.total_size)?;
        drop(file);

        if self.plan.is_multipart() {
            let results: Vec<Result<()>> = stream::iter(0..self.plan.num_chunks)
                .map(|chunk_id| self.download_chunk(chunk_id))
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
            for result in results {
                result?;
            }
        } else {
            self.download_chunk(0).await?;
        }

        Ok(std::fs::metadata(&dst)?.len())
    }

    /// Whether transfer acceleration is enabled on the bucket.
    ///
    /// `GET /?accelerate`; any non-200 answer reads as disabled.
    pub async fn transfer_accelerate_config(&self) -> Result<bool> {
        let url = format!("{}/?accelerate", self.endpoint);
        let response = self
            .send(
                Method::GET,
                &url,
                RetryKey::Accelerate,
                Headers::new(),
                Bytes::new(),
            )
            .await?;
        if response.status != StatusCode::OK {
            debug!(status = %response.status, "accelerate configuration unavailable");
            return Ok(false);
        }
        let enabled = parse_accelerate_status(&response.body)?;
        debug!(enabled, "transfer acceleration status");
        Ok(enabled)
    }
}

#[async_trait]
impl TransferClient for S3TransferClient {
    fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    async fn probe(&self, job: &mut TransferJob, filename: &str) -> Result<Option<FileHeader>> {
        let url = self.object_url(filename);
        let response = self
            .send(
                Method::HEAD,
                &url,
                RetryKey::Probe,
                Headers::new(),
                Bytes::new(),
            )
            .await?;

        match response.status {
            StatusCode::OK => {
                job.result_status = TransferStatus::Uploaded;
                Ok(Some(parse_file_header(&response.headers)?))
            }
            StatusCode::NOT_FOUND => {
                debug!(bucket = %self.location.bucket, file = filename, "object not found");
                job.result_status = TransferStatus::NotFound;
                Ok(None)
            }
            _ => Err(service_error(response)),
        }
    }

    async fn upload(&self, job: &mut TransferJob) -> Result<()> {
        match self.perform_upload().await {
            Ok(()) => {
                job.result_status = TransferStatus::Uploaded;
                job.dst_file_size = job.declared_size;
                Ok(())
            }
            Err(err) => {
                job.result_status = TransferStatus::Error;
                Err(err)
            }
        }
    }

    async fn download(&self, job: &mut TransferJob) -> Result<()> {
        match self.perform_download().await {
            Ok(written) => {
                // The bytes actually written win over the declared size.
                job.dst_file_size = written;
                job.result_status = TransferStatus::Downloaded;
                Ok(())
            }
            Err(err) => {
                job.result_status = TransferStatus::Error;
                Err(err)
            }
        }
    }

    async fn upload_chunk(&self, chunk_id: usize, chunk: Bytes) -> Result<()> {
        let url = self.object_url(&self.dst_file_name);

        if !self.plan.is_multipart() {
            // Single-request path: one PUT carrying the object metadata.
            let mut headers = self.object_metadata();
            headers.set("content-type", OCTET_STREAM);
            let response = self
                .send(Method::PUT, &url, RetryKey::Chunk(chunk_id), headers, chunk)
                .await?;
            if !response.status.is_success() {
                return Err(service_error(response));
            }
            return Ok(());
        }

        let upload_id = self
            .state
            .lock()
            .unwrap()
            .upload_id
            .clone()
            .ok_or_else(|| {
                TransferError::InvalidResponse("part upload before initiation".to_string())
            })?;

        let mut part_url = String::with_capacity(url.len() + 64);
        part_url.push_str(&url);
        part_url.push_str("?partNumber=");
        let _ = write!(part_url, "{}", chunk_id + 1);
        part_url.push_str("&uploadId=");
        Self::url_encode_into(&mut part_url, &upload_id);

        let response = self
            .send(
                Method::PUT,
                &part_url,
                RetryKey::Chunk(chunk_id),
                Headers::new(),
                chunk,
            )
            .await?;
        if response.status != StatusCode::OK {
            return Err(service_error(response));
        }

        // Stored exactly as returned, quotes included; completion echoes it
        // back verbatim.
        let etag = response
            .headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                TransferError::InvalidResponse("missing ETag header on part upload".to_string())
            })?
            .to_string();
        self.state.lock().unwrap().etags[chunk_id] = Some(etag);
        Ok(())
    }

    async fn download_chunk(&self, chunk_id: usize) -> Result<()> {
        debug!(chunk = chunk_id, "downloading chunk");
        let url = self.object_url(&self.src_file_name);

        let mut headers = Headers::new();
        if self.plan.is_multipart() {
            let (start, end) = self.plan.byte_range(chunk_id);
            let range = match end {
                Some(end) => format!("bytes={}-{}", start, end),
                None => format!("bytes={}-", start),
            };
            headers.set("range", range);
        }

        let response = self
            .send(
                Method::GET,
                &url,
                RetryKey::Chunk(chunk_id),
                headers,
                Bytes::new(),
            )
            .await?;
        if response.status != StatusCode::OK && response.status != StatusCode::PARTIAL_CONTENT {
            return Err(service_error(response));
        }

        self.write_chunk(chunk_id, &response.body)
    }
}

fn service_error(response: HttpResponse) -> TransferError {
    TransferError::Service {
        status: response.status,
        message: String::from_utf8_lossy(&response.body).to_string(),
    }
}

/// Rebuild a [`FileHeader`] from the reserved metadata headers of a HEAD
/// response. Encryption material is reconstructed only when the key field is
/// present.
fn parse_file_header(headers: &HeaderMap) -> Result<FileHeader> {
    let meta = |key: &str| {
        headers
            .get(format!("{}{}", META_PREFIX, key).as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let encryption_metadata = meta(AMZ_KEY).map(|key| EncryptionMetadata {
        key,
        iv: meta(AMZ_IV).unwrap_or_default(),
        matdesc: meta(AMZ_MATDESC).unwrap_or_default(),
    });
    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            TransferError::InvalidResponse("missing Content-Length on HEAD response".to_string())
        })?;
    Ok(FileHeader {
        digest: meta(DIGEST),
        content_length,
        encryption_metadata,
    })
}

/// Parse the UploadId out of an InitiateMultipartUpload response, by element
/// name rather than tree position.
fn parse_upload_id(xml_data: &[u8]) -> Result<String> {
    let mut reader = Reader::from_reader(xml_data);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut upload_id = String::new();
    let mut current_text = String::with_capacity(128);

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"UploadId" {
                    upload_id = std::mem::take(&mut current_text);
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(TransferError::XmlParse(format!("XML parse error: {}", e))),
            _ => {}
        }
    }

    if upload_id.is_empty() {
        return Err(TransferError::InvalidResponse(
            "Missing UploadId in response".to_string(),
        ));
    }
    Ok(upload_id)
}

/// Parse a GetBucketAccelerateConfiguration response: `<Status>` equals
/// `Enabled`.
fn parse_accelerate_status(xml_data: &[u8]) -> Result<bool> {
    let mut reader = Reader::from_reader(xml_data);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut status = String::new();
    let mut current_text = String::with_capacity(32);

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"Status" {
                    status = std::mem::take(&mut current_text);
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(TransferError::XmlParse(format!("XML parse error: {}", e))),
            _ => {}
        }
    }

    Ok(status == "Enabled")
}
