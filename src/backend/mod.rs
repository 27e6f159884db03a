//! The uniform backend adapter contract. Two concrete adapters implement
//! [`Backend`]: [`posix::PosixBackend`] (random-access writes to a
//! pre-allocated temp file) and [`block_list::BlockListBackend`]
//! (stage-then-commit block manifests).

pub mod block_list;
pub mod posix;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::BackendKind;
use crate::error::Result;
use crate::identity::CallerIdentity;

/// One entry returned by `list`/`stat`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub path: String,
}

#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub page: u32,
    pub per_page: u32,
    pub name_regex: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub only_dirs: bool,
}

pub struct ListResult {
    pub items: Vec<ItemDescriptor>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<bytes::Bytes>> + Send>>;

/// Result of `initiate`: number of bytes already durably present, used as a
/// resume hint by the client.
pub type AlreadyUploadedBytes = u64;

/// Opaque per-upload token minted by `initiate_upload` and handed back by
/// the orchestrator on every later verb for the same upload. Two concurrent
/// `initiate` calls for the same path each get their own handle, so the
/// loser of the session-registry race can tear down exactly the resources
/// it created without disturbing the winner's, even though both momentarily
/// exist under the same backend path. Adapters with no per-upload
/// server-side state (the block-list backend) mint one but never consult
/// it.
pub type UploadHandle = String;

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn name(&self) -> &str;

    async fn list(&self, caller: Option<&CallerIdentity>, path: &str, opts: ListOptions) -> Result<ListResult>;
    async fn stat(&self, caller: Option<&CallerIdentity>, path: &str) -> Result<ItemDescriptor>;
    async fn open_read(&self, caller: Option<&CallerIdentity>, path: &str) -> Result<ByteStream>;
    async fn create_dir(&self, caller: Option<&CallerIdentity>, path: &str) -> Result<()>;
    async fn delete(&self, caller: Option<&CallerIdentity>, path: &str) -> Result<()>;

    /// §4.2 `initiate`. The session-registry uniqueness check happens in
    /// the orchestrator, not here; this only performs backend-native setup
    /// and returns the handle that identifies this particular attempt.
    async fn initiate_upload(
        &self,
        caller: Option<&CallerIdentity>,
        path: &str,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<(AlreadyUploadedBytes, UploadHandle)>;

    /// §4.2 `chunk`. `block_id` is required for the block-list backend and
    /// ignored by the POSIX backend.
    #[allow(clippy::too_many_arguments)]
    async fn write_chunk(
        &self,
        handle: &UploadHandle,
        path: &str,
        chunk_index: u64,
        chunk_size: u64,
        data: bytes::Bytes,
        block_id: Option<&str>,
    ) -> Result<()>;

    /// §4.2 `finalize`.
    async fn finalize_upload(
        &self,
        handle: &UploadHandle,
        path: &str,
        total_size: u64,
        expected_hash: Option<&str>,
        block_ids: Option<&[String]>,
    ) -> Result<()>;

    /// §4.2 `cancel`. Must be idempotent. `handle` is `None` when there is
    /// no live session to tear down (a second `cancel`, or a cleanup path
    /// that only knows the path), in which case the adapter falls back to
    /// whatever path-addressed cleanup it can still safely perform.
    async fn cancel_upload(&self, handle: Option<&UploadHandle>, path: &str) -> Result<()>;

    /// §4.2 `status`. `handle` is `Some` when a live session exists for
    /// this path, per the session registry.
    async fn upload_status(&self, handle: Option<&UploadHandle>, path: &str) -> Result<u64>;
}

/// Deterministic block-identifier encoding shared by both adapters: a
/// fixed-width zero-padded decimal of the chunk index, base64-encoded, so
/// `finalize` can order the manifest by index regardless of arrival order.
pub fn encode_block_id(chunk_index: u64) -> String {
    let padded = format!("{:020}", chunk_index);
    base64::encode(padded.as_bytes())
}

pub fn decode_block_id(block_id: &str) -> Result<u64> {
    let raw = base64::decode(block_id)
        .map_err(|e| crate::error::GatewayError::InvalidArgument(format!("bad block id: {}", e)))?;
    let text = String::from_utf8(raw)
        .map_err(|e| crate::error::GatewayError::InvalidArgument(format!("bad block id: {}", e)))?;
    text.trim_start_matches('0')
        .parse::<u64>()
        .or_else(|_| if text.chars().all(|c| c == '0') { Ok(0) } else { Err(()) })
        .map_err(|_| crate::error::GatewayError::InvalidArgument(format!("bad block id: {}", text)))
}
