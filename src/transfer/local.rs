//! Local-filesystem transfer backend
//!
//! Copies bytes between filesystem paths. No network, no signing; chunk
//! operations are positioned reads and writes so the contract stays the same
//! as the remote backends.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::transfer::{
    ChunkPlan, FileHeader, Result, StageInfo, TransferClient, TransferError, TransferJob,
    TransferStatus,
};

/// Expand a leading `~` to the user's home directory.
fn expand_user(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(format!("{}{}", home, rest));
            }
        }
    }
    PathBuf::from(path)
}

/// Filesystem backend of the transfer contract.
pub struct LocalTransferClient {
    stage_dir: PathBuf,
    plan: ChunkPlan,
    src_file_name: String,
    src_stream: Option<Bytes>,
    dst_file_name: String,
    download_path: Option<PathBuf>,
}

impl LocalTransferClient {
    pub fn new(job: &TransferJob, stage: &StageInfo, chunk_size: usize) -> Self {
        let download_path = job.local_location.as_ref().map(|dir| {
            let name = Path::new(&job.dst_file_name)
                .file_name()
                .unwrap_or_else(|| job.dst_file_name.as_ref());
            dir.join(name)
        });
        Self {
            stage_dir: expand_user(&stage.location),
            plan: ChunkPlan::new(job.declared_size, chunk_size),
            src_file_name: job.src_file_name.clone(),
            src_stream: job.src_stream.clone(),
            dst_file_name: job.dst_file_name.clone(),
            download_path,
        }
    }

    fn stage_path(&self, name: &str) -> PathBuf {
        self.stage_dir.join(name.trim_start_matches('/'))
    }

    fn copy_to_stage(&self) -> Result<()> {
        let dst = self.stage_path(&self.dst_file_name);
        match &self.src_stream {
            Some(stream) => std::fs::write(&dst, stream)?,
            None => {
                std::fs::copy(&self.src_file_name, &dst)?;
            }
        }
        Ok(())
    }

    /// Returns the stat-reported size of the written file.
    fn copy_from_stage(&self) -> Result<u64> {
        let dst = self
            .download_path
            .clone()
            .ok_or(TransferError::NoLocalDestination)?;
        if let Some(dir) = dst.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::copy(self.stage_path(&self.src_file_name), &dst)?;
        Ok(std::fs::metadata(&dst)?.len())
    }
}

#[async_trait]
impl TransferClient for LocalTransferClient {
    fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    async fn probe(&self, job: &mut TransferJob, filename: &str) -> Result<Option<FileHeader>> {
        match std::fs::metadata(self.stage_path(filename)) {
            Ok(meta) => {
                job.result_status = TransferStatus::Uploaded;
                Ok(Some(FileHeader {
                    digest: None,
                    content_length: meta.len(),
                    encryption_metadata: None,
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = filename, "not found at stage");
                job.result_status = TransferStatus::NotFound;
                Ok(None)
            }
            Err(err) => Err(TransferError::Io(err)),
        }
    }

    async fn upload(&self, job: &mut TransferJob) -> Result<()> {
        match self.copy_to_stage() {
            Ok(()) => {
                job.dst_file_size = job.declared_size;
                job.result_status = TransferStatus::Uploaded;
                Ok(())
            }
            Err(err) => {
                job.result_status = TransferStatus::Error;
                Err(err)
            }
        }
    }

    async fn download(&self, job: &mut TransferJob) -> Result<()> {
        match self.copy_from_stage() {
            // Stat of the written file, not the declared size.
            Ok(written) => {
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
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.stage_path(&self.dst_file_name))?;
        file.seek(SeekFrom::Start(self.plan.offset(chunk_id)))?;
        file.write_all(&chunk)?;
        Ok(())
    }

    async fn download_chunk(&self, chunk_id: usize) -> Result<()> {
        let dst = self
            .download_path
            .as_ref()
            .ok_or(TransferError::NoLocalDestination)?;

        let mut src = std::fs::File::open(self.stage_path(&self.src_file_name))?;
        let (start, end) = self.plan.byte_range(chunk_id);
        src.seek(SeekFrom::Start(start))?;
        let mut buffer = Vec::new();
        match end {
            Some(end) => {
                buffer.resize((end - start + 1) as usize, 0);
                src.read_exact(&mut buffer)?;
            }
            // Last chunk runs to the end of the file.
            None => {
                src.read_to_end(&mut buffer)?;
            }
        }

        let mut out = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(dst)?;
        out.seek(SeekFrom::Start(start))?;
        out.write_all(&buffer)?;
        Ok(())
    }
}
