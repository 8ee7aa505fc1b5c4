use crate::backend::Backend;
use crate::crypto::Encryptor;
use crate::index::{Index, IndexFile, index_object_name};
use crate::pack::{self, PackBuilder, PackManager, pack_object_name};
use crate::{BlobType, ChunkID, ChunkMetadata, Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub metadata: ChunkMetadata,
    /// False when the blob was already indexed or claimed by another writer.
    pub is_new: bool,
    /// True when the blob was found in the durable index. Otherwise it is
    /// durable only once its pack is sealed; see [`BlobStore::flush_pending`].
    pub indexed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub blobs_added: u64,
    pub bytes_added: u64,
    pub packs_written: u64,
}

/// Deduplicating blob store shared by all workers of a session.
///
/// Dedup is decided under the pack-writer lock: a hash that is indexed or
/// already claimed by an open/sealing pack is never appended twice. Index
/// entries are published only after the pack and its index object are durable.
/// A writer that relies on another writer's claim must wait for that pack
/// through [`BlobStore::flush_pending`] before treating the blob as stored.
pub struct BlobStore {
    backend: Arc<dyn Backend>,
    encryptor: Arc<Encryptor>,
    index: RwLock<Index>,
    packer: Mutex<PackManager>,
    /// Signalled whenever a pack upload finishes, successfully or not.
    sealed: Notify,
    blobs_added: AtomicU64,
    bytes_added: AtomicU64,
    packs_written: AtomicU64,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn Backend>, encryptor: Arc<Encryptor>, index: Index, pack_size: u64) -> Self {
        Self {
            backend,
            encryptor,
            index: RwLock::new(index),
            packer: Mutex::new(PackManager::new(pack_size)),
            sealed: Notify::new(),
            blobs_added: AtomicU64::new(0),
            bytes_added: AtomicU64::new(0),
            packs_written: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn encryptor(&self) -> &Encryptor {
        &self.encryptor
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            blobs_added: self.blobs_added.load(Ordering::Relaxed),
            bytes_added: self.bytes_added.load(Ordering::Relaxed),
            packs_written: self.packs_written.load(Ordering::Relaxed),
        }
    }

    pub async fn has_blob(&self, id: &ChunkID) -> bool {
        self.index.read().await.has_chunk(id)
    }

    pub async fn lookup(&self, id: &ChunkID) -> Option<ChunkMetadata> {
        self.index.read().await.get_chunk(id).cloned()
    }

    pub async fn index_snapshot(&self) -> Index {
        self.index.read().await.clone()
    }

    /// Stores a blob unless its hash is already known. Concurrent callers
    /// racing on the same new hash produce exactly one pack entry; losers
    /// discard their encoded copy and get the winner's location.
    pub async fn put_blob(&self, blob_type: BlobType, id: ChunkID, data: &[u8]) -> Result<StoredBlob> {
        if let Some(metadata) = self.lookup(&id).await {
            return Ok(StoredBlob {
                metadata,
                is_new: false,
                indexed: true,
            });
        }

        let sealed = pack::encode_blob(&self.encryptor, &id, data)?;

        let (metadata, full_pack) = {
            let mut packer = self.packer.lock().await;
            if let Some(metadata) = self.index.read().await.get_chunk(&id).cloned() {
                return Ok(StoredBlob {
                    metadata,
                    is_new: false,
                    indexed: true,
                });
            }
            if let Some(metadata) = packer.claimed(&id).cloned() {
                return Ok(StoredBlob {
                    metadata,
                    is_new: false,
                    indexed: false,
                });
            }
            packer.add_blob(id, blob_type, &sealed, data.len() as u32)
        };

        self.blobs_added.fetch_add(1, Ordering::Relaxed);
        self.bytes_added.fetch_add(sealed.len() as u64, Ordering::Relaxed);
        debug!(blob = %id.short_string(), ?blob_type, pack = %metadata.pack_id, "Packed new blob");

        if let Some(pack) = full_pack {
            self.seal_pack(pack).await?;
        }
        Ok(StoredBlob {
            metadata,
            is_new: true,
            indexed: false,
        })
    }

    /// Reads, authenticates and hash-checks a blob.
    pub async fn get_blob(&self, id: &ChunkID) -> Result<Vec<u8>> {
        let metadata = self.lookup(id).await.ok_or_else(|| Error::ChunkNotFound {
            id: id.to_hex(),
        })?;
        self.read_blob(&metadata).await
    }

    pub async fn read_blob(&self, metadata: &ChunkMetadata) -> Result<Vec<u8>> {
        let object = pack_object_name(&metadata.pack_id);
        let sealed = self
            .backend
            .read_range(&object, metadata.offset, metadata.length as u64)
            .await?;
        pack::decode_blob(&self.encryptor, &metadata.id, &sealed, &object)
    }

    /// Seals the open pack, if any. Packs sealed concurrently by other
    /// writers may still be uploading when this returns.
    pub async fn flush(&self) -> Result<()> {
        let pack = self.packer.lock().await.finish_current_pack();
        if let Some(pack) = pack {
            self.seal_pack(pack).await?;
        }
        Ok(())
    }

    /// Seals the open pack and waits until every blob in `pending` is
    /// indexed, including blobs whose pack another writer is uploading.
    /// Fails if any of those packs could not be stored.
    pub async fn flush_pending(&self, pending: &HashSet<ChunkID>) -> Result<()> {
        self.flush().await?;
        for id in pending {
            self.wait_indexed(id).await?;
        }
        Ok(())
    }

    async fn wait_indexed(&self, id: &ChunkID) -> Result<()> {
        loop {
            let mut notified = std::pin::pin!(self.sealed.notified());
            notified.as_mut().enable();

            // Claims are released under the packer lock after the index is
            // published, so both are read under it.
            let open_pack = {
                let packer = self.packer.lock().await;
                if self.index.read().await.has_chunk(id) {
                    return Ok(());
                }
                match packer.claimed(id) {
                    Some(metadata) => packer.is_open(&metadata.pack_id),
                    None => {
                        return Err(Error::Backend(format!(
                            "pack holding blob {} was not stored",
                            id.short_string()
                        )));
                    }
                }
            };

            if open_pack {
                self.flush().await?;
            } else {
                debug!(blob = %id.short_string(), "Waiting for pack upload by another writer");
                notified.await;
            }
        }
    }

    async fn seal_pack(&self, pack: PackBuilder) -> Result<()> {
        let pack_id = pack.pack_id().clone();
        let result = self.write_pack(pack).await;
        self.packer.lock().await.release(&pack_id);
        self.sealed.notify_waiters();
        if let Err(ref e) = result {
            warn!(pack = %pack_id, error = %e, "Pack upload failed; its blobs stay unindexed");
        }
        result
    }

    async fn write_pack(&self, pack: PackBuilder) -> Result<()> {
        let pack_id = pack.pack_id().clone();
        let (header, bytes) = pack.finish(&self.encryptor)?;
        let size = bytes.len() as u64;

        self.backend.write(&pack_object_name(&pack_id), bytes).await?;

        let index_file = IndexFile::for_pack(pack_id.clone(), size, header.entries);
        self.backend
            .write(&index_object_name(&pack_id), index_file.seal(&self.encryptor)?)
            .await?;

        self.index.write().await.add_index_file(&index_file);
        self.packs_written.fetch_add(1, Ordering::Relaxed);
        info!(pack = %pack_id, size, blobs = index_file.packs[0].blobs.len(), "Sealed pack");
        Ok(())
    }

    /// Drops cached state; used when the owning repository is closed.
    pub async fn release(&self) {
        self.packer.lock().await.reset();
        self.index.write().await.clear();
        self.sealed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::memory::MemoryBackend;
    use async_trait::async_trait;
    use bytes::Bytes;

    fn store_with(backend: Arc<dyn Backend>, pack_size: u64) -> BlobStore {
        let enc = Encryptor::new(MasterKey::generate().as_bytes()).unwrap();
        BlobStore::new(backend, Arc::new(enc), Index::new(), pack_size)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(backend.clone(), 1024 * 1024);

        let id = ChunkID::from_data(b"hello");
        let first = store.put_blob(BlobType::Data, id, b"hello").await.unwrap();
        assert!(first.is_new);
        let second = store.put_blob(BlobType::Data, id, b"hello").await.unwrap();
        assert!(!second.is_new);
        assert_eq!(first.metadata, second.metadata);

        // Not readable until the pack is durable.
        assert!(matches!(store.get_blob(&id).await, Err(Error::ChunkNotFound { .. })));
        store.flush().await.unwrap();

        assert_eq!(store.get_blob(&id).await.unwrap(), b"hello");
        assert_eq!(backend.write_count("data"), 1);
        assert_eq!(backend.write_count("index"), 1);
        assert_eq!(store.stats().blobs_added, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_blob_written_once() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(store_with(backend.clone(), 1024 * 1024));
        let data = vec![42u8; 8192];
        let id = ChunkID::from_data(&data);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let data = data.clone();
            tasks.push(tokio::spawn(async move {
                store.put_blob(BlobType::Data, id, &data).await
            }));
        }

        let mut new_count = 0;
        for task in tasks {
            let stored = task.await.unwrap().unwrap();
            if stored.is_new {
                new_count += 1;
            }
        }
        store.flush().await.unwrap();

        assert_eq!(new_count, 1);
        assert_eq!(backend.write_count("data"), 1);
        let index = store.index_snapshot().await;
        assert_eq!(index.len(), 1);
        assert_eq!(index.packs.values().next().unwrap().chunk_count, 1);
    }

    #[tokio::test]
    async fn test_pack_sealed_at_threshold() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(backend.clone(), 256);

        for i in 0..20u32 {
            let data: Vec<u8> = (0..200u32).map(|b| (b.wrapping_mul(i + 7) % 251) as u8).collect();
            store
                .put_blob(BlobType::Data, ChunkID::from_data(&data), &data)
                .await
                .unwrap();
        }
        store.flush().await.unwrap();

        let packs = backend.write_count("data");
        assert!(packs > 1, "expected several packs, got {packs}");
        assert_eq!(store.stats().packs_written, packs as u64);
        assert_eq!(store.index_snapshot().await.len(), 20);
    }

    #[tokio::test]
    async fn test_tampered_pack_is_integrity_error() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(backend.clone(), 1024 * 1024);
        let id = ChunkID::from_data(b"sensitive bytes");
        let stored = store.put_blob(BlobType::Data, id, b"sensitive bytes").await.unwrap();
        store.flush().await.unwrap();

        let meta = stored.metadata;
        backend
            .flip_bit(&pack_object_name(&meta.pack_id), meta.offset as usize + 15)
            .unwrap();

        let err = store.get_blob(&id).await.unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }), "unexpected: {err}");
    }

    struct FailingWrites;

    #[async_trait]
    impl Backend for FailingWrites {
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        async fn exists(&self, _path: &str) -> Result<bool> {
            Ok(false)
        }
        async fn read(&self, path: &str) -> Result<Bytes> {
            Err(Error::Backend(format!("Failed to read {}", path)))
        }
        async fn write(&self, path: &str, _data: Bytes) -> Result<()> {
            Err(Error::Backend(format!("Failed to write {}: disk full", path)))
        }
        async fn delete(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn backend_type(&self) -> crate::backend::BackendType {
            crate::backend::BackendType::Memory
        }
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_index_entries() {
        let store = store_with(Arc::new(FailingWrites), 1024 * 1024);
        let id = ChunkID::from_data(b"x");
        store.put_blob(BlobType::Data, id, b"x").await.unwrap();

        let err = store.flush().await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert!(!store.has_blob(&id).await);

        // The claim is released, so a retry packs the blob again.
        let retry = store.put_blob(BlobType::Data, id, b"x").await.unwrap();
        assert!(retry.is_new);
    }

    /// Holds the first pack upload until released, then fails it.
    struct HeldPackWrite {
        inner: MemoryBackend,
        entered: Notify,
        release: Notify,
        held: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Backend for HeldPackWrite {
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }
        async fn read(&self, path: &str) -> Result<Bytes> {
            self.inner.read(path).await
        }
        async fn write(&self, path: &str, data: Bytes) -> Result<()> {
            if path.starts_with("data/") && !self.held.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
                return Err(Error::Backend(format!("Failed to write {}: connection lost", path)));
            }
            self.inner.write(path, data).await
        }
        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }
        fn backend_type(&self) -> crate::backend::BackendType {
            crate::backend::BackendType::Memory
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writer_relying_on_failed_upload_fails_too() {
        let backend = Arc::new(HeldPackWrite {
            inner: MemoryBackend::new(),
            entered: Notify::new(),
            release: Notify::new(),
            held: std::sync::atomic::AtomicBool::new(false),
        });
        let store = Arc::new(store_with(backend.clone(), 1024 * 1024));
        let id = ChunkID::from_data(b"shared");

        let first = {
            let store = store.clone();
            tokio::spawn(async move {
                store.put_blob(BlobType::Data, id, b"shared").await?;
                store.flush().await
            })
        };
        backend.entered.notified().await;

        // Second writer finds the claim of the pack being uploaded.
        let stored = store.put_blob(BlobType::Data, id, b"shared").await.unwrap();
        assert!(!stored.is_new);
        assert!(!stored.indexed);

        let second = {
            let store = store.clone();
            tokio::spawn(async move { store.flush_pending(&HashSet::from([id])).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!second.is_finished(), "must wait for the other writer's upload");

        backend.release.notify_one();
        assert!(first.await.unwrap().is_err());
        let err = second.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Backend(_)), "unexpected: {err}");
        assert!(!store.has_blob(&id).await);
    }

    #[tokio::test]
    async fn test_flush_pending_succeeds_once_indexed() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(backend.clone(), 1024 * 1024);
        let id = ChunkID::from_data(b"tree bytes");
        let stored = store.put_blob(BlobType::Tree, id, b"tree bytes").await.unwrap();
        assert!(!stored.indexed);

        store.flush_pending(&HashSet::from([id])).await.unwrap();
        assert!(store.has_blob(&id).await);
        assert!(store.put_blob(BlobType::Tree, id, b"tree bytes").await.unwrap().indexed);
    }
}
