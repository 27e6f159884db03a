//! Block-list backend adapter: a local simulation of an "object store with
//! block-blob semantics" (staged opaque blocks, committed as an ordered
//! manifest). No cloud SDK dependency; the staging/commit contract mirrors
//! what a real Azure Block Blob / S3 multipart client would expose behind
//! the same [`Backend`] trait boundary.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::TryStreamExt;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Backend, ByteStream, ItemDescriptor, ListOptions, ListResult, UploadHandle};
use crate::config::BackendKind;
use crate::error::{GatewayError, Result};
use crate::identity::CallerIdentity;

const DIR_MARKER: &str = ".dirmarker";
const STAGING_ROOT: &str = ".blocks";

/// Bound on concurrent delete fan-out: 4x available hardware threads.
fn delete_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 4)
        .unwrap_or(8)
}

pub struct BlockListBackend {
    name: String,
    root: PathBuf,
}

impl BlockListBackend {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    fn clean_key(path: &str) -> Result<String> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.split('/').any(|c| c == "..") {
            return Err(GatewayError::InvalidArgument(format!(
                "path escapes backend root: {}",
                path
            )));
        }
        Ok(trimmed.to_string())
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn staging_dir(&self, key: &str) -> PathBuf {
        self.root.join(STAGING_ROOT).join(key)
    }

    /// Staged blocks are named by a filesystem-safe transform of the
    /// opaque `block_id` string (hex, since the id itself is base64 and
    /// may contain `/`).
    fn staged_block_path(&self, key: &str, block_id: &str) -> PathBuf {
        self.staging_dir(key).join(hex::encode(block_id.as_bytes()))
    }

    async fn virtual_dir_exists(&self, key: &str) -> Result<bool> {
        let dir = self.object_path(key);
        match tokio::fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => {
                let mut entries = tokio::fs::read_dir(&dir).await.map_err(GatewayError::BackendIo)?;
                Ok(entries.next_entry().await.map_err(GatewayError::BackendIo)?.is_some())
            }
            Ok(_) => Ok(false), // a plain blob at this key, not a directory
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GatewayError::BackendIo(e)),
        }
    }
}

#[async_trait]
impl Backend for BlockListBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BlockList
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
        let key = Self::clean_key(path)?;
        let dir = self.object_path(&key);

        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ListResult {
                    items: Vec::new(),
                    total: 0,
                    page: opts.page,
                    per_page: opts.per_page,
                })
            }
            Err(e) => return Err(GatewayError::BackendIo(e)),
        };

        let name_re = opts
            .name_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| GatewayError::InvalidArgument(format!("bad name_regex: {}", e)))?;

        let mut dirs = Vec::new();
        let mut files = Vec::new();

        while let Some(entry) = read_dir.next_entry().await.map_err(GatewayError::BackendIo)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == DIR_MARKER || name == STAGING_ROOT {
                continue;
            }

            let metadata = entry.metadata().await.map_err(GatewayError::BackendIo)?;
            if let Some(re) = &name_re {
                if !re.is_match(&name) {
                    continue;
                }
            }

            let is_dir = metadata.is_dir();
            if opts.only_dirs && !is_dir {
                continue;
            }

            let rel_path = format!("{}/{}", key.trim_end_matches('/'), name)
                .trim_start_matches('/')
                .to_string();

            if is_dir {
                // Virtual directories have no real modification instant;
                // "now" is as good as any fixed sentinel.
                dirs.push(ItemDescriptor {
                    name,
                    is_directory: true,
                    size: 0,
                    last_modified: Utc::now(),
                    path: rel_path,
                });
            } else {
                let modified: DateTime<Utc> = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                if let Some(since) = opts.since {
                    if modified <= since {
                        continue;
                    }
                }
                files.push(ItemDescriptor {
                    name,
                    is_directory: false,
                    size: metadata.len(),
                    last_modified: modified,
                    path: rel_path,
                });
            }
        }

        dirs.sort_by(|a, b| a.name.cmp(&b.name));
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let mut items = dirs;
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
        let key = Self::clean_key(path)?;
        let object_path = self.object_path(&key);
        let metadata = tokio::fs::metadata(&object_path).await.map_err(GatewayError::BackendIo)?;
        let name = Path::new(&key)
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
            path: key,
        })
    }

    async fn open_read(&self, _caller: Option<&CallerIdentity>, path: &str) -> Result<ByteStream> {
        let key = Self::clean_key(path)?;
        let file = tokio::fs::File::open(self.object_path(&key))
            .await
            .map_err(GatewayError::BackendIo)?;
        let stream = tokio_util::codec::FramedRead::new(file, tokio_util::codec::BytesCodec::new())
            .map_ok(|b| b.freeze());
        Ok(Box::pin(stream))
    }

    async fn create_dir(&self, _caller: Option<&CallerIdentity>, path: &str) -> Result<()> {
        let key = Self::clean_key(path)?;
        if self.virtual_dir_exists(&key).await? {
            return Err(GatewayError::AlreadyExists(path.to_string()));
        }
        let dir = self.object_path(&key);
        tokio::fs::create_dir_all(&dir).await.map_err(GatewayError::BackendIo)?;
        tokio::fs::write(dir.join(DIR_MARKER), b"").await.map_err(GatewayError::BackendIo)?;
        Ok(())
    }

    async fn delete(&self, _caller: Option<&CallerIdentity>, path: &str) -> Result<()> {
        let key = Self::clean_key(path)?;
        let target = self.object_path(&key);
        let metadata = tokio::fs::metadata(&target).await.map_err(GatewayError::BackendIo)?;

        if !metadata.is_dir() {
            return tokio::fs::remove_file(&target).await.map_err(GatewayError::BackendIo);
        }

        let mut keys = Vec::new();
        for entry in walkdir::WalkDir::new(&target).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                keys.push(entry.path().to_path_buf());
            }
        }

        let limit = delete_concurrency();
        let results: Vec<std::io::Result<()>> = stream::iter(keys)
            .map(|p| async move { tokio::fs::remove_file(p).await })
            .buffer_unordered(limit)
            .collect()
            .await;
        for r in results {
            r.map_err(GatewayError::BackendIo)?;
        }

        tokio::fs::remove_dir_all(&target).await.map_err(GatewayError::BackendIo)?;
        Ok(())
    }

    async fn initiate_upload(
        &self,
        _caller: Option<&CallerIdentity>,
        path: &str,
        _total_size: u64,
        _chunk_size: u64,
    ) -> Result<(u64, UploadHandle)> {
        let key = Self::clean_key(path)?;
        // No per-upload server-side resource is held in memory here; the
        // handle only exists to satisfy the uniform trait contract, so a
        // fresh one is minted and never consulted again.
        let handle = uuid::Uuid::new_v4().to_string();

        // §4.2: a pre-existing file at this key is a resume hint (its size);
        // a pre-existing virtual directory is a hard conflict; otherwise
        // there's nothing to resume from.
        match tokio::fs::metadata(self.object_path(&key)).await {
            Ok(metadata) if metadata.is_dir() => {
                return Err(GatewayError::AlreadyExists(format!(
                    "{} is a directory",
                    path
                )))
            }
            Ok(metadata) => {
                tokio::fs::create_dir_all(self.staging_dir(&key)).await.map_err(GatewayError::BackendIo)?;
                return Ok((metadata.len(), handle));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GatewayError::BackendIo(e)),
        }

        tokio::fs::create_dir_all(self.staging_dir(&key)).await.map_err(GatewayError::BackendIo)?;
        // No server-side session state is materialized beyond the staging
        // directory: staged but uncommitted blocks aren't enumerable in a
        // backend-agnostic way, so there's no further resume hint to report.
        Ok((0, handle))
    }

    async fn write_chunk(
        &self,
        _handle: &UploadHandle,
        path: &str,
        _chunk_index: u64,
        _chunk_size: u64,
        data: Bytes,
        block_id: Option<&str>,
    ) -> Result<()> {
        let key = Self::clean_key(path)?;
        let block_id = block_id
            .ok_or_else(|| GatewayError::InvalidArgument("block_id is required for this backend".into()))?;

        tokio::fs::create_dir_all(self.staging_dir(&key)).await.map_err(GatewayError::BackendIo)?;
        let staged_path = self.staged_block_path(&key, block_id);
        let mut file = tokio::fs::File::create(&staged_path).await.map_err(GatewayError::BackendIo)?;
        file.write_all(&data).await.map_err(GatewayError::BackendIo)?;
        file.flush().await.map_err(GatewayError::BackendIo)?;
        Ok(())
    }

    async fn finalize_upload(
        &self,
        _handle: &UploadHandle,
        path: &str,
        total_size: u64,
        expected_hash: Option<&str>,
        block_ids: Option<&[String]>,
    ) -> Result<()> {
        let key = Self::clean_key(path)?;
        let block_ids = block_ids
            .ok_or_else(|| GatewayError::InvalidArgument("block_ids is required for this backend".into()))?;

        if let Some(parent) = self.object_path(&key).parent() {
            tokio::fs::create_dir_all(parent).await.map_err(GatewayError::BackendIo)?;
        }

        let final_path = self.object_path(&key);
        {
            let mut final_file = tokio::fs::File::create(&final_path).await.map_err(GatewayError::BackendIo)?;
            for block_id in block_ids {
                let staged_path = self.staged_block_path(&key, block_id);
                let mut block = match tokio::fs::File::open(&staged_path).await {
                    Ok(block) => block,
                    Err(_) => {
                        drop(final_file);
                        let _ = tokio::fs::remove_file(&final_path).await;
                        return Err(GatewayError::NotFound(format!(
                            "staged block {} not found for {}",
                            block_id, path
                        )));
                    }
                };
                let mut buf = Vec::new();
                block.read_to_end(&mut buf).await.map_err(GatewayError::BackendIo)?;
                final_file.write_all(&buf).await.map_err(GatewayError::BackendIo)?;
            }
            final_file.flush().await.map_err(GatewayError::BackendIo)?;
        }

        let metadata = tokio::fs::metadata(&final_path).await.map_err(GatewayError::BackendIo)?;
        if metadata.len() != total_size {
            let _ = tokio::fs::remove_file(&final_path).await;
            return Err(GatewayError::InvalidArgument(format!(
                "committed size {} does not match declared size {}",
                metadata.len(),
                total_size
            )));
        }

        if let Some(expected) = expected_hash {
            let mut file = tokio::fs::File::open(&final_path).await.map_err(GatewayError::BackendIo)?;
            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf).await.map_err(GatewayError::BackendIo)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            let digest = hex::encode(hasher.finalize());
            if digest != expected {
                // The blob is intentionally left in place on mismatch: the
                // client already committed the manifest, and re-driving
                // finalize with corrected block_ids should still be
                // possible.
                return Err(GatewayError::IntegrityFailed(format!(
                    "expected sha256 {} got {}",
                    expected, digest
                )));
            }
        }

        let _ = tokio::fs::remove_dir_all(self.staging_dir(&key)).await;
        Ok(())
    }

    async fn cancel_upload(&self, _handle: Option<&UploadHandle>, path: &str) -> Result<()> {
        let key = Self::clean_key(path)?;
        let _ = tokio::fs::remove_dir_all(self.staging_dir(&key)).await;
        // Matches the teardown finalize performs on its own failure paths:
        // a cancelled upload must not leave a committed-looking blob behind.
        let _ = tokio::fs::remove_file(self.object_path(&key)).await;
        Ok(())
    }

    async fn upload_status(&self, _handle: Option<&UploadHandle>, path: &str) -> Result<u64> {
        let key = Self::clean_key(path)?;
        match tokio::fs::metadata(self.object_path(&key)).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(GatewayError::BackendIo(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &tempfile::TempDir) -> BlockListBackend {
        BlockListBackend::new("objects", dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn finalize_orders_blocks_by_supplied_list_not_stage_order() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        let (_, handle) = be.initiate_upload(None, "report.bin", 6, 2).await.unwrap();

        let id0 = super::super::encode_block_id(0);
        let id1 = super::super::encode_block_id(1);
        let id2 = super::super::encode_block_id(2);

        // Staged out of index order: 2, 0, 1.
        be.write_chunk(&handle, "report.bin", 2, 2, Bytes::from_static(b"EF"), Some(&id2)).await.unwrap();
        be.write_chunk(&handle, "report.bin", 0, 2, Bytes::from_static(b"AB"), Some(&id0)).await.unwrap();
        be.write_chunk(&handle, "report.bin", 1, 2, Bytes::from_static(b"CD"), Some(&id1)).await.unwrap();

        be.finalize_upload(&handle, "report.bin", 6, None, Some(&[id0.clone(), id1.clone(), id2.clone()]))
            .await
            .unwrap();

        let mut stream = be.open_read(None, "report.bin").await.unwrap();
        use futures::StreamExt as _;
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(bytes, b"ABCDEF");
    }

    #[tokio::test]
    async fn integrity_mismatch_leaves_blob_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        let (_, handle) = be.initiate_upload(None, "x.bin", 2, 2).await.unwrap();
        let id0 = super::super::encode_block_id(0);
        be.write_chunk(&handle, "x.bin", 0, 2, Bytes::from_static(b"AB"), Some(&id0)).await.unwrap();

        let err = be
            .finalize_upload(&handle, "x.bin", 2, Some("deadbeef"), Some(&[id0]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "integrity-failed");
        assert!(dir.path().join("x.bin").exists());
    }

    #[tokio::test]
    async fn missing_staged_block_deletes_the_partial_blob() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        let (_, handle) = be.initiate_upload(None, "y.bin", 4, 2).await.unwrap();
        let id0 = super::super::encode_block_id(0);
        let id1 = super::super::encode_block_id(1);
        be.write_chunk(&handle, "y.bin", 0, 2, Bytes::from_static(b"AB"), Some(&id0)).await.unwrap();
        // id1 is never staged.

        let err = be
            .finalize_upload(&handle, "y.bin", 4, None, Some(&[id0, id1]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not-found");
        assert!(!dir.path().join("y.bin").exists());
    }

    #[tokio::test]
    async fn size_mismatch_deletes_the_partial_blob() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        let (_, handle) = be.initiate_upload(None, "z.bin", 99, 2).await.unwrap();
        let id0 = super::super::encode_block_id(0);
        be.write_chunk(&handle, "z.bin", 0, 2, Bytes::from_static(b"AB"), Some(&id0)).await.unwrap();

        let err = be
            .finalize_upload(&handle, "z.bin", 99, None, Some(&[id0]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
        assert!(!dir.path().join("z.bin").exists());
    }

    #[tokio::test]
    async fn cancel_deletes_a_committed_blob() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        let (_, handle) = be.initiate_upload(None, "w.bin", 2, 2).await.unwrap();
        let id0 = super::super::encode_block_id(0);
        be.write_chunk(&handle, "w.bin", 0, 2, Bytes::from_static(b"AB"), Some(&id0)).await.unwrap();
        be.finalize_upload(&handle, "w.bin", 2, None, Some(&[id0])).await.unwrap();
        assert!(dir.path().join("w.bin").exists());

        be.cancel_upload(None, "w.bin").await.unwrap();
        assert!(!dir.path().join("w.bin").exists());
        // idempotent
        be.cancel_upload(None, "w.bin").await.unwrap();
    }

    #[tokio::test]
    async fn create_dir_rejects_when_prefix_already_has_child() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        tokio::fs::create_dir_all(dir.path().join("notes")).await.unwrap();
        tokio::fs::write(dir.path().join("notes/readme.txt"), b"hi").await.unwrap();

        let err = be.create_dir(None, "notes").await.unwrap_err();
        assert_eq!(err.kind(), "already-exists");
    }

    #[tokio::test]
    async fn delete_removes_all_keys_under_virtual_directory() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);

        tokio::fs::create_dir_all(dir.path().join("bucket/sub")).await.unwrap();
        tokio::fs::write(dir.path().join("bucket/a.txt"), b"1").await.unwrap();
        tokio::fs::write(dir.path().join("bucket/sub/b.txt"), b"2").await.unwrap();

        be.delete(None, "bucket").await.unwrap();
        assert!(!dir.path().join("bucket").exists());
    }

    #[tokio::test]
    async fn initiate_on_a_fresh_path_reports_zero_uploaded_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);
        let (uploaded, _) = be.initiate_upload(None, "whatever.bin", 1000, 10).await.unwrap();
        assert_eq!(uploaded, 0);
    }

    #[tokio::test]
    async fn initiate_on_an_existing_file_returns_its_size_as_a_resume_hint() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);
        tokio::fs::write(dir.path().join("existing.bin"), b"already here").await.unwrap();

        let (uploaded, _) = be.initiate_upload(None, "existing.bin", 1000, 10).await.unwrap();
        assert_eq!(uploaded, "already here".len() as u64);
    }

    #[tokio::test]
    async fn initiate_on_a_virtual_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir);
        tokio::fs::create_dir_all(dir.path().join("folder")).await.unwrap();

        let err = be.initiate_upload(None, "folder", 10, 5).await.unwrap_err();
        assert_eq!(err.kind(), "already-exists");
    }
}
