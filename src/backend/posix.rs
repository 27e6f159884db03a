//! POSIX-style backend adapter: random-access writes to a pre-allocated
//! temp file, drained by a single writer task per upload. A dedicated
//! worker plus a bounded queue removes the need to serialize seek+write
//! pairs with a per-chunk lock and makes the backpressure contract
//! explicit.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use log::{debug, warn};
use parking_lot::Mutex as SyncMutex;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};

use super::{Backend, ByteStream, ItemDescriptor, ListOptions, ListResult, UploadHandle};
use crate::config::BackendKind;
use crate::error::{GatewayError, Result};
use crate::identity::CallerIdentity;

const CHUNK_CHANNEL_CAPACITY: usize = 100;
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

struct ChunkWriteRequest {
    data: Bytes,
    chunk_index: u64,
}

/// Per-upload resources that the POSIX backend keeps alongside the generic
/// session-registry entry: the temp file handle's path, the bounded
/// channel feeding the writer task, the error cell, and the completion
/// barrier.
struct PosixUpload {
    temp_path: PathBuf,
    final_path: PathBuf,
    total_size: u64,
    chunk_size: u64,
    expected_chunks: u64,
    received: SyncMutex<HashSet<u64>>,
    sender: SyncMutex<Option<mpsc::Sender<ChunkWriteRequest>>>,
    done: Arc<Notify>,
    writer_finished: Arc<AtomicBool>,
    error: SyncMutex<Option<String>>,
}

pub struct PosixBackend {
    name: String,
    root: PathBuf,
    /// Keyed by the opaque handle minted in `initiate_upload`, not by
    /// `path`. Two concurrent initiates for the same path each get a
    /// distinct entry here, so the registry-race loser's `cancel_upload`
    /// call can only ever reach the entry it itself created.
    uploads: SyncMutex<std::collections::HashMap<UploadHandle, Arc<PosixUpload>>>,
}

impl PosixBackend {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            uploads: SyncMutex::new(std::collections::HashMap::new()),
        }
    }

    /// Resolve `requested` under `self.root`, rejecting `..` traversal and
    /// any canonicalized ancestor that escapes the root. The target itself
    /// need not exist yet.
    fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let mut clean = PathBuf::new();
        for component in requested.split('/') {
            match component {
                "" | "." => continue,
                ".." => {
                    return Err(GatewayError::InvalidArgument(format!(
                        "path escapes backend root: {}",
                        requested
                    )))
                }
                other => clean.push(other),
            }
        }

        let joined = self.root.join(&clean);

        let canonical_root = self
            .root
            .canonicalize()
            .map_err(GatewayError::BackendIo)?;

        let mut probe = joined.clone();
        let existing_ancestor = loop {
            if probe.exists() {
                break probe.clone();
            }
            match probe.parent() {
                Some(parent) if parent != probe => probe = parent.to_path_buf(),
                _ => break self.root.clone(),
            }
        };

        let canonical_ancestor = existing_ancestor
            .canonicalize()
            .map_err(GatewayError::BackendIo)?;

        if !canonical_ancestor.starts_with(&canonical_root) {
            return Err(GatewayError::InvalidArgument(format!(
                "path escapes backend root: {}",
                requested
            )));
        }

        Ok(joined)
    }

    fn upload_temp_name() -> String {
        format!("upload-{}.tmp", uuid::Uuid::new_v4())
    }
}

#[async_trait]
impl Backend for PosixBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Posix
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn list(
        &self,
        _caller: Option<&CallerIdentity>,
        path: &str,
        opts: ListOptions,
    ) -> Result<ListResult> {
        let dir = self.resolve(path)?;
        let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(GatewayError::BackendIo)?;

        let name_re = opts
            .name_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| GatewayError::InvalidArgument(format!("bad name_regex: {}", e)))?;

        let mut dirs = Vec::new();
        let mut files = Vec::new();

        while let Some(entry) = read_dir.next_entry().await.map_err(GatewayError::BackendIo)? {
            let metadata = entry.metadata().await.map_err(GatewayError::BackendIo)?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if let Some(re) = &name_re {
                if !re.is_match(&name) {
                    continue;
                }
            }

            let is_dir = metadata.is_dir();
            if opts.only_dirs && !is_dir {
                continue;
            }

            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            if !is_dir {
                if let Some(since) = opts.since {
                    if modified <= since {
                        continue;
                    }
                }
            }
            // Directories are never filtered by `since`: they carry no
            // meaningful modification time, and filtering them would make
            // navigation disappear intermittently.

            let rel_path = format!("{}/{}", path.trim_end_matches('/'), name)
                .trim_start_matches('/')
                .to_string();

            let item = ItemDescriptor {
                name,
                is_directory: is_dir,
                size: if is_dir { 0 } else { metadata.len() },
                last_modified: modified,
                path: rel_path,
            };

            if is_dir {
                dirs.push(item);
            } else {
                files.push(item);
            }
        }

        dirs.sort_by(|a, b| a.name.cmp(&b.name));
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let mut items: Vec<ItemDescriptor> = dirs;
        items.extend(files);

        let total = items.len() as u64;

        let per_page = opts.per_page.max(1) as usize;
        let start = (opts.page as usize).saturating_sub(1) * per_page;
        let page_items: Vec<ItemDescriptor> = items.into_iter().skip(start).take(per_page).collect();

        Ok(ListResult {
            items: page_items,
            total,
            page: opts.page,
            per_page: opts.per_page,
        })
    }

    async fn stat(&self, _caller: Option<&CallerIdentity>, path: &str) -> Result<ItemDescriptor> {
        let resolved = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&resolved).await.map_err(GatewayError::BackendIo)?;
        let name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(ItemDescriptor {
            name,
            is_directory: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            last_modified: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
            path: path.to_string(),
        })
    }

    async fn open_read(&self, _caller: Option<&CallerIdentity>, path: &str) -> Result<ByteStream> {
        let resolved = self.resolve(path)?;
        let file = tokio::fs::File::open(&resolved).await.map_err(GatewayError::BackendIo)?;
        let stream = tokio_util::codec::FramedRead::new(file, tokio_util::codec::BytesCodec::new())
            .map_ok(|b| b.freeze());
        Ok(Box::pin(stream))
    }

    async fn create_dir(&self, _caller: Option<&CallerIdentity>, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        if resolved.exists() {
            return Err(GatewayError::AlreadyExists(path.to_string()));
        }
        tokio::fs::create_dir_all(&resolved).await.map_err(GatewayError::BackendIo)?;
        Ok(())
    }

    async fn delete(&self, _caller: Option<&CallerIdentity>, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&resolved).await.map_err(GatewayError::BackendIo)?;
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&resolved).await.map_err(GatewayError::BackendIo)?;
        } else {
            tokio::fs::remove_file(&resolved).await.map_err(GatewayError::BackendIo)?;
        }
        Ok(())
    }

    async fn initiate_upload(
        &self,
        _caller: Option<&CallerIdentity>,
        path: &str,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<(u64, UploadHandle)> {
        let final_path = self.resolve(path)?;
        let parent = final_path
            .parent()
            .ok_or_else(|| GatewayError::InvalidArgument("path has no parent".into()))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await.map_err(GatewayError::BackendIo)?;

        let temp_path = parent.join(Self::upload_temp_name());
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(GatewayError::BackendIo)?;
        file.set_len(total_size).await.map_err(GatewayError::BackendIo)?;
        drop(file);

        let expected_chunks = if chunk_size == 0 {
            0
        } else {
            (total_size + chunk_size - 1) / chunk_size
        };

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let upload = Arc::new(PosixUpload {
            temp_path: temp_path.clone(),
            final_path,
            total_size,
            chunk_size,
            expected_chunks,
            received: SyncMutex::new(HashSet::new()),
            sender: SyncMutex::new(Some(tx)),
            done: Arc::new(Notify::new()),
            writer_finished: Arc::new(AtomicBool::new(false)),
            error: SyncMutex::new(None),
        });

        spawn_writer(upload.clone(), rx);

        let handle = uuid::Uuid::new_v4().to_string();
        self.uploads.lock().insert(handle.clone(), upload);

        Ok((0, handle))
    }

    async fn write_chunk(
        &self,
        handle: &UploadHandle,
        path: &str,
        chunk_index: u64,
        _chunk_size: u64,
        data: Bytes,
        _block_id: Option<&str>,
    ) -> Result<()> {
        let upload = self
            .uploads
            .lock()
            .get(handle)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("no upload in progress for {}", path)))?;

        if let Some(err) = upload.error.lock().clone() {
            return Err(GatewayError::BackendIo(std::io::Error::new(
                std::io::ErrorKind::Other,
                err,
            )));
        }

        let offset = chunk_index
            .checked_mul(upload.chunk_size)
            .ok_or_else(|| GatewayError::InvalidArgument("chunk offset overflow".into()))?;
        if offset.checked_add(data.len() as u64).unwrap_or(u64::MAX) > upload.total_size {
            return Err(GatewayError::InvalidArgument(format!(
                "chunk {} would write past declared total size",
                chunk_index
            )));
        }

        let sender = upload
            .sender
            .lock()
            .clone()
            .ok_or_else(|| GatewayError::Cancelled)?;

        let request = ChunkWriteRequest { data, chunk_index };
        match tokio::time::timeout(ENQUEUE_TIMEOUT, sender.send(request)).await {
            Ok(Ok(())) => {
                upload.received.lock().insert(chunk_index);
                Ok(())
            }
            Ok(Err(_)) => Err(GatewayError::Cancelled),
            Err(_) => Err(GatewayError::Backpressure(format!(
                "writer queue full for {}",
                path
            ))),
        }
    }

    async fn finalize_upload(
        &self,
        handle: &UploadHandle,
        path: &str,
        total_size: u64,
        expected_hash: Option<&str>,
        _block_ids: Option<&[String]>,
    ) -> Result<()> {
        let upload = self
            .uploads
            .lock()
            .remove(handle)
            .ok_or_else(|| GatewayError::NotFound(format!("no upload in progress for {}", path)))?;

        shutdown_writer(&upload).await;

        if let Some(err) = upload.error.lock().clone() {
            let _ = tokio::fs::remove_file(&upload.temp_path).await;
            return Err(GatewayError::BackendIo(std::io::Error::new(
                std::io::ErrorKind::Other,
                err,
            )));
        }

        let received_count = upload.received.lock().len() as u64;
        if received_count != upload.expected_chunks {
            let _ = tokio::fs::remove_file(&upload.temp_path).await;
            return Err(GatewayError::InvalidArgument(format!(
                "missing chunks: received {} of {}",
                received_count, upload.expected_chunks
            )));
        }

        let metadata = tokio::fs::metadata(&upload.temp_path).await.map_err(GatewayError::BackendIo)?;
        if metadata.len() != total_size {
            let _ = tokio::fs::remove_file(&upload.temp_path).await;
            return Err(GatewayError::InvalidArgument(format!(
                "temp file size {} does not match declared size {}",
                metadata.len(),
                total_size
            )));
        }

        {
            let mut file = tokio::fs::OpenOptions::new()
                .read(true)
                .open(&upload.temp_path)
                .await
                .map_err(GatewayError::BackendIo)?;
            file.sync_all().await.map_err(GatewayError::BackendIo)?;
            file.seek(std::io::SeekFrom::Start(0)).await.map_err(GatewayError::BackendIo)?;

            let mut final_file = tokio::fs::File::create(&upload.final_path)
                .await
                .map_err(GatewayError::BackendIo)?;

            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf).await.map_err(GatewayError::BackendIo)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                final_file.write_all(&buf[..n]).await.map_err(GatewayError::BackendIo)?;
            }
            final_file.flush().await.map_err(GatewayError::BackendIo)?;

            if let Some(expected) = expected_hash {
                let digest = hex::encode(hasher.finalize());
                if digest != expected {
                    drop(final_file);
                    let _ = tokio::fs::remove_file(&upload.final_path).await;
                    let _ = tokio::fs::remove_file(&upload.temp_path).await;
                    return Err(GatewayError::IntegrityFailed(format!(
                        "expected sha256 {} got {}",
                        expected, digest
                    )));
                }
            }
        }

        let _ = tokio::fs::remove_file(&upload.temp_path).await;

        Ok(())
    }

    async fn cancel_upload(&self, handle: Option<&UploadHandle>, _path: &str) -> Result<()> {
        let upload = match handle {
            Some(handle) => self.uploads.lock().remove(handle),
            None => None,
        };
        let upload = match upload {
            Some(upload) => upload,
            None => return Ok(()), // idempotent: no handle, or already torn down
        };
        shutdown_writer(&upload).await;
        let _ = tokio::fs::remove_file(&upload.temp_path).await;
        Ok(())
    }

    async fn upload_status(&self, handle: Option<&UploadHandle>, path: &str) -> Result<u64> {
        if let Some(upload) = handle.and_then(|h| self.uploads.lock().get(h).cloned()) {
            let metadata = tokio::fs::metadata(&upload.temp_path).await.map_err(GatewayError::BackendIo)?;
            return Ok(metadata.len());
        }
        let resolved = self.resolve(path)?;
        match tokio::fs::metadata(&resolved).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(GatewayError::BackendIo(e)),
        }
    }
}

fn spawn_writer(upload: Arc<PosixUpload>, mut rx: mpsc::Receiver<ChunkWriteRequest>) {
    tokio::spawn(async move {
        let mut file = match OpenOptions::new().write(true).open(&upload.temp_path).await {
            Ok(file) => file,
            Err(e) => {
                *upload.error.lock() = Some(format!("open temp file failed: {}", e));
                upload.writer_finished.store(true, Ordering::SeqCst);
                upload.done.notify_waiters();
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = upload.done.notified() => {
                    debug!("writer task for {:?} received forceful shutdown", upload.temp_path);
                    break;
                }
                maybe_req = rx.recv() => {
                    match maybe_req {
                        None => break, // channel closed: normal shutdown
                        Some(req) => {
                            let offset = req.chunk_index * upload.chunk_size;
                            if let Err(e) = write_one_chunk(&mut file, offset, &req.data).await {
                                warn!("chunk write failed for {:?}: {}", upload.temp_path, e);
                                *upload.error.lock() = Some(e.to_string());
                                break;
                            }
                        }
                    }
                }
            }
        }

        upload.writer_finished.store(true, Ordering::SeqCst);
        upload.done.notify_waiters();
    });
}

async fn write_one_chunk(file: &mut tokio::fs::File, offset: u64, data: &Bytes) -> std::io::Result<()> {
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    Ok(())
}

/// Close the chunk channel and the done-signal, then await the writer
/// completion barrier. Used by both `finalize` and `cancel`.
async fn shutdown_writer(upload: &Arc<PosixUpload>) {
    upload.sender.lock().take(); // drop our sender clone: contributes to channel close
    upload.done.notify_waiters(); // forceful: wake the writer even if other senders remain

    while !upload.writer_finished.load(Ordering::SeqCst) {
        let notified = upload.done.notified();
        if upload.writer_finished.load(Ordering::SeqCst) {
            break;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &tempfile::TempDir) -> PosixBackend {
        PosixBackend::new("local", dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn happy_path_upload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        let data = b"hello world, this is a chunked upload";
        let chunk_size = 8u64;
        let total_size = data.len() as u64;

        let (_, handle) = be
            .initiate_upload(None, "greeting.txt", total_size, chunk_size)
            .await
            .unwrap();

        for (idx, chunk) in data.chunks(chunk_size as usize).enumerate() {
            be.write_chunk(&handle, "greeting.txt", idx as u64, chunk_size, Bytes::copy_from_slice(chunk), None)
                .await
                .unwrap();
        }

        let mut hasher = Sha256::new();
        hasher.update(data);
        let expected = hex::encode(hasher.finalize());

        be.finalize_upload(&handle, "greeting.txt", total_size, Some(&expected), None)
            .await
            .unwrap();

        let stat = be.stat(None, "greeting.txt").await.unwrap();
        assert_eq!(stat.size, total_size);
    }

    #[tokio::test]
    async fn integrity_mismatch_rejects_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        let data = b"0123456789";
        let (_, handle) = be.initiate_upload(None, "f.bin", data.len() as u64, 5).await.unwrap();
        be.write_chunk(&handle, "f.bin", 0, 5, Bytes::copy_from_slice(&data[0..5]), None).await.unwrap();
        be.write_chunk(&handle, "f.bin", 1, 5, Bytes::copy_from_slice(&data[5..10]), None).await.unwrap();

        let err = be
            .finalize_upload(&handle, "f.bin", data.len() as u64, Some("deadbeef"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "integrity-failed");
        assert!(!dir.path().join("f.bin").exists());
    }

    #[tokio::test]
    async fn missing_chunks_rejected_at_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        let (_, handle) = be.initiate_upload(None, "partial.bin", 10, 5).await.unwrap();
        be.write_chunk(&handle, "partial.bin", 0, 5, Bytes::from_static(b"01234"), None).await.unwrap();

        let err = be.finalize_upload(&handle, "partial.bin", 10, None, None).await.unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        let (_, handle) = be.initiate_upload(None, "a.bin", 5, 5).await.unwrap();
        be.cancel_upload(Some(&handle), "a.bin").await.unwrap();
        be.cancel_upload(Some(&handle), "a.bin").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_initiate_loser_only_tears_down_its_own_upload() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        // Simulate the session-registry race: two initiates for the same
        // path both succeed at the backend layer before the registry
        // arbitrates which one wins. The registry-race loser must only be
        // able to cancel the instance its own handle identifies.
        let (_, handle_a) = be.initiate_upload(None, "race.bin", 5, 5).await.unwrap();
        let (_, handle_b) = be.initiate_upload(None, "race.bin", 5, 5).await.unwrap();
        assert_ne!(handle_a, handle_b);

        // The loser (say, handle_a) cancels itself.
        be.cancel_upload(Some(&handle_a), "race.bin").await.unwrap();

        // The winner's upload is untouched and can still be written to and
        // finalized.
        be.write_chunk(&handle_b, "race.bin", 0, 5, Bytes::from_static(b"01234"), None)
            .await
            .unwrap();
        be.finalize_upload(&handle_b, "race.bin", 5, None, None).await.unwrap();

        let stat = be.stat(None, "race.bin").await.unwrap();
        assert_eq!(stat.size, 5);
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        let err = be.stat(None, "../escape.txt").await.unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
    }

    #[tokio::test]
    async fn directory_listing_paginates_and_sorts_dirs_first() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        tokio::fs::create_dir(dir.path().join("zeta")).await.unwrap();
        tokio::fs::write(dir.path().join("alpha.txt"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("beta.txt"), b"y").await.unwrap();

        let opts = ListOptions {
            page: 1,
            per_page: 2,
            ..Default::default()
        };
        let result = be.list(None, "", opts).await.unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.items.len(), 2);
        assert!(result.items[0].is_directory);
    }
}
