//! Filesystem sink for downloaded media.
//!
//! Bytes go to a hidden `.part` file next to the target and reach the final
//! path through one rename, so an interrupted transfer never leaves a
//! half-written file where a finished one is expected.

use crate::error::DownloadError;
use crate::source::MediaStream;
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { path: PathBuf, bytes: u64 },
    /// An identical file was already in place; nothing was written.
    Duplicate { path: PathBuf },
}

#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Length of the file at `path`, if one exists.
    async fn existing_len(&self, path: &Path) -> Option<u64>;

    async fn write_atomic(
        &self,
        path: &Path,
        stream: MediaStream,
    ) -> Result<WriteOutcome, DownloadError>;
}

#[derive(Debug, Clone, Default)]
pub struct FsSink;

impl FsSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSink for FsSink {
    async fn existing_len(&self, path: &Path) -> Option<u64> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        }
    }

    async fn write_atomic(
        &self,
        path: &Path,
        stream: MediaStream,
    ) -> Result<WriteOutcome, DownloadError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::filesystem(parent, e))?;

        let tmp = temp_path(path);
        let bytes = match write_stream(&tmp, stream).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        match place(&tmp, path).await {
            Ok(outcome) => Ok(match outcome {
                WriteOutcome::Written { path, .. } => WriteOutcome::Written { path, bytes },
                dup => dup,
            }),
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }
}

async fn write_stream(tmp: &Path, mut stream: MediaStream) -> Result<u64, DownloadError> {
    let mut file = fs::File::create(tmp)
        .await
        .map_err(|e| DownloadError::filesystem(tmp, e))?;
    let mut bytes = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::filesystem(tmp, e))?;
        bytes += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| DownloadError::filesystem(tmp, e))?;
    file.sync_all()
        .await
        .map_err(|e| DownloadError::filesystem(tmp, e))?;
    Ok(bytes)
}

/// Move the finished temporary file into place. An identical file already at
/// `path` makes this a duplicate; a different one pushes the new file to the
/// next free `name (n).ext`. Names are claimed atomically, so concurrent
/// writers never replace each other's files.
async fn place(tmp: &Path, path: &Path) -> Result<WriteOutcome, DownloadError> {
    let mut target = path.to_path_buf();
    let mut n = 1;
    loop {
        if claim(tmp, &target)
            .await
            .map_err(|e| DownloadError::filesystem(&target, e))?
        {
            return Ok(WriteOutcome::Written {
                path: target,
                bytes: 0,
            });
        }
        if same_content(tmp, &target).await? {
            fs::remove_file(tmp)
                .await
                .map_err(|e| DownloadError::filesystem(tmp, e))?;
            return Ok(WriteOutcome::Duplicate { path: target });
        }
        target = numbered(path, n);
        n += 1;
    }
}

/// Give `tmp` the name `target` unless something already has it. Returns
/// `false` when the name is taken.
async fn claim(tmp: &Path, target: &Path) -> io::Result<bool> {
    match fs::hard_link(tmp, target).await {
        Ok(()) => {
            if let Err(e) = fs::remove_file(tmp).await {
                log::warn!("Could not remove {}: {}", tmp.display(), e);
            }
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        // No hard links here: reserve the name with an empty file first.
        Err(_) => match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(target)
            .await
        {
            Ok(_) => {
                fs::rename(tmp, target).await?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        },
    }
}

async fn same_content(a: &Path, b: &Path) -> Result<bool, DownloadError> {
    let len_a = fs::metadata(a)
        .await
        .map_err(|e| DownloadError::filesystem(a, e))?
        .len();
    let len_b = fs::metadata(b)
        .await
        .map_err(|e| DownloadError::filesystem(b, e))?
        .len();
    if len_a != len_b {
        return Ok(false);
    }

    let mut fa = fs::File::open(a)
        .await
        .map_err(|e| DownloadError::filesystem(a, e))?;
    let mut fb = fs::File::open(b)
        .await
        .map_err(|e| DownloadError::filesystem(b, e))?;
    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    loop {
        let n = fa
            .read(&mut buf_a)
            .await
            .map_err(|e| DownloadError::filesystem(a, e))?;
        if n == 0 {
            return Ok(true);
        }
        fb.read_exact(&mut buf_b[..n])
            .await
            .map_err(|e| DownloadError::filesystem(b, e))?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tag: u32 = rand::rng().random();
    path.with_file_name(format!(".{}.{:08x}.part", name, tag))
}

/// `dir/name.ext` -> `dir/name (n).ext`
fn numbered(path: &Path, n: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    };
    path.with_file_name(name)
}
