use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info};

use veil_shared::BlobId;

use crate::error::{Result, StoreError};

/// Chunk size used by the default `stream_to` / `write_into` copies.
const COPY_CHUNK: usize = 64 * 1024;

/// Attachment storage. Blobs are addressed by the opaque id a `File` message
/// carries; the attachment transfer is the only engine component using it.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Allocate an empty blob under a fresh id.
    async fn make_blob(&self) -> Result<BlobId>;

    /// Create or truncate the blob stored under `id`.
    async fn create(&self, id: &BlobId) -> Result<()>;

    async fn contains(&self, id: &BlobId) -> bool;

    /// Size of the blob in bytes.
    async fn stat(&self, id: &BlobId) -> Result<u64>;

    /// Read up to `len` bytes starting at `offset`.
    async fn read_block(&self, id: &BlobId, offset: u64, len: usize) -> Result<Vec<u8>>;

    async fn append(&self, id: &BlobId, data: &[u8]) -> Result<()>;

    async fn delete(&self, id: &BlobId) -> Result<()>;

    /// Copy the whole blob into `sink`, returning the number of bytes written.
    async fn stream_to(
        &self,
        id: &BlobId,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let size = self.stat(id).await?;
        let mut offset = 0u64;
        while offset < size {
            let block = self.read_block(id, offset, COPY_CHUNK).await?;
            if block.is_empty() {
                break;
            }
            sink.write_all(&block).await?;
            offset += block.len() as u64;
        }
        sink.flush().await?;
        Ok(offset)
    }

    /// Replace the content of `id` with everything read from `source`.
    async fn write_into(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        id: &BlobId,
    ) -> Result<u64> {
        self.create(id).await?;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut total = 0u64;
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if let Err(e) = self.append(id, &buf[..n]).await {
                let _ = self.delete(id).await;
                return Err(e);
            }
            total += n as u64;
        }
        Ok(total)
    }

    /// Store `data` as a new blob.
    async fn import(&self, data: &[u8]) -> Result<BlobId> {
        let id = self.make_blob().await?;
        self.append(&id, data).await?;
        Ok(id)
    }
}

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in target.strip_prefix(base).unwrap_or(target).components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => return Err(StoreError::PathTraversal),
            _ => {}
        }
    }
    if !resolved.starts_with(base) {
        return Err(StoreError::PathTraversal);
    }
    Ok(resolved)
}

/// One file per blob under `base_path`, named by the blob's UUID.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    base_path: PathBuf,
    max_size: u64,
}

impl FsBlobStore {
    pub async fn new(base_path: PathBuf, max_size: u64) -> Result<Self> {
        fs::create_dir_all(&base_path).await?;
        let base_path = base_path.canonicalize().unwrap_or(base_path);
        info!(path = %base_path.display(), "Blob store initialized");
        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, id: &BlobId) -> Result<PathBuf> {
        let raw = self.base_path.join(id.0.to_string());
        ensure_within(&self.base_path, &raw)
    }

    async fn existing_path(&self, id: &BlobId) -> Result<PathBuf> {
        let path = self.blob_path(id)?;
        if fs::metadata(&path).await.is_err() {
            return Err(StoreError::BlobNotFound(*id));
        }
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn make_blob(&self) -> Result<BlobId> {
        let id = BlobId::new();
        self.create(&id).await?;
        Ok(id)
    }

    async fn create(&self, id: &BlobId) -> Result<()> {
        let path = self.blob_path(id)?;
        fs::File::create(&path).await?;
        debug!(id = %id, "Created blob");
        Ok(())
    }

    async fn contains(&self, id: &BlobId) -> bool {
        self.existing_path(id).await.is_ok()
    }

    async fn stat(&self, id: &BlobId) -> Result<u64> {
        let path = self.existing_path(id).await?;
        Ok(fs::metadata(&path).await?.len())
    }

    async fn read_block(&self, id: &BlobId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let path = self.existing_path(id).await?;
        let mut file = fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        if offset > size {
            return Err(StoreError::OutOfRange { offset, size });
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let want = len.min((size - offset) as usize);
        let mut buf = vec![0u8; want];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn append(&self, id: &BlobId, data: &[u8]) -> Result<()> {
        let path = self.existing_path(id).await?;
        let current = fs::metadata(&path).await?.len();
        let size = current + data.len() as u64;
        if size > self.max_size {
            return Err(StoreError::BlobTooLarge {
                size,
                max: self.max_size,
            });
        }

        let mut file = OpenOptions::new().append(true).open(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn delete(&self, id: &BlobId) -> Result<()> {
        let path = self.existing_path(id).await?;
        fs::remove_file(&path).await?;
        debug!(id = %id, "Deleted blob");
        Ok(())
    }
}

/// Blobs kept in memory; used by tests and ephemeral nodes.
#[derive(Debug)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobId, Vec<u8>>>,
    max_size: u64,
}

impl MemoryBlobStore {
    pub fn new(max_size: u64) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            max_size,
        }
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn make_blob(&self) -> Result<BlobId> {
        let id = BlobId::new();
        self.create(&id).await?;
        Ok(id)
    }

    async fn create(&self, id: &BlobId) -> Result<()> {
        self.blobs.write().await.insert(*id, Vec::new());
        Ok(())
    }

    async fn contains(&self, id: &BlobId) -> bool {
        self.blobs.read().await.contains_key(id)
    }

    async fn stat(&self, id: &BlobId) -> Result<u64> {
        self.blobs
            .read()
            .await
            .get(id)
            .map(|data| data.len() as u64)
            .ok_or(StoreError::BlobNotFound(*id))
    }

    async fn read_block(&self, id: &BlobId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let blobs = self.blobs.read().await;
        let data = blobs.get(id).ok_or(StoreError::BlobNotFound(*id))?;
        let size = data.len() as u64;
        if offset > size {
            return Err(StoreError::OutOfRange { offset, size });
        }
        let start = offset as usize;
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn append(&self, id: &BlobId, chunk: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        let data = blobs.get_mut(id).ok_or(StoreError::BlobNotFound(*id))?;
        let size = (data.len() + chunk.len()) as u64;
        if size > self.max_size {
            return Err(StoreError::BlobTooLarge {
                size,
                max: self.max_size,
            });
        }
        data.extend_from_slice(chunk);
        Ok(())
    }

    async fn delete(&self, id: &BlobId) -> Result<()> {
        self.blobs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::BlobNotFound(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fs_store() -> (FsBlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf(), 1024 * 1024)
            .await
            .unwrap();
        (store, dir)
    }

    async fn exercise(store: &dyn BlobStore) {
        let id = store.import(b"encrypted-blob-data").await.unwrap();
        assert!(store.contains(&id).await);
        assert_eq!(store.stat(&id).await.unwrap(), 19);
        assert_eq!(store.read_block(&id, 10, 4).await.unwrap(), b"blob");
        assert_eq!(store.read_block(&id, 15, 100).await.unwrap(), b"data");
        assert!(store.read_block(&id, 100, 1).await.is_err());

        let mut sink = Vec::new();
        assert_eq!(store.stream_to(&id, &mut sink).await.unwrap(), 19);
        assert_eq!(sink, b"encrypted-blob-data");

        let mut source: &[u8] = b"replaced";
        store.write_into(&mut source, &id).await.unwrap();
        assert_eq!(store.stat(&id).await.unwrap(), 8);

        store.delete(&id).await.unwrap();
        assert!(!store.contains(&id).await);
        assert!(matches!(
            store.stat(&id).await,
            Err(StoreError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_store_operations() {
        let (store, _dir) = fs_store().await;
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_memory_store_operations() {
        let store = MemoryBlobStore::new(1024);
        exercise(&store).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_size_limit_enforced() {
        let (store, _dir) = fs_store().await;
        let id = store.make_blob().await.unwrap();
        let big = vec![0u8; 1024 * 1024 + 1];
        assert!(matches!(
            store.append(&id, &big).await,
            Err(StoreError::BlobTooLarge { .. })
        ));

        let mem = MemoryBlobStore::new(4);
        let id = mem.make_blob().await.unwrap();
        mem.append(&id, b"1234").await.unwrap();
        assert!(mem.append(&id, b"5").await.is_err());
    }

    #[tokio::test]
    async fn test_create_with_known_id() {
        let (store, _dir) = fs_store().await;
        let id = BlobId::new();
        assert!(!store.contains(&id).await);
        store.create(&id).await.unwrap();
        store.append(&id, b"abc").await.unwrap();
        store.create(&id).await.unwrap();
        assert_eq!(store.stat(&id).await.unwrap(), 0);
    }

    #[test]
    fn test_ensure_within_rejects_parent() {
        let base = Path::new("/srv/blobs");
        assert!(ensure_within(base, &base.join("../etc/passwd")).is_err());
        assert!(ensure_within(base, &base.join("abc")).is_ok());
    }
}
