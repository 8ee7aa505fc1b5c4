use crate::backend::{Backend, object_basename};
use crate::crypto::Encryptor;
use crate::pack::PackEntry;
use crate::{ChunkID, ChunkMetadata, Error, PackID, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

const INDEX_AAD: &[u8] = b"snapvault-index";

/// In-memory master index: every blob known to be durable in some pack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    pub chunks: HashMap<ChunkID, ChunkMetadata>,
    pub packs: HashMap<PackID, PackInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackInfo {
    pub id: PackID,
    pub size: u64,
    pub chunk_count: u32,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(&mut self, metadata: ChunkMetadata) {
        self.chunks.insert(metadata.id, metadata);
    }

    pub fn add_pack(&mut self, info: PackInfo) {
        self.packs.insert(info.id.clone(), info);
    }

    pub fn has_chunk(&self, id: &ChunkID) -> bool {
        self.chunks.contains_key(id)
    }

    pub fn get_chunk(&self, id: &ChunkID) -> Option<&ChunkMetadata> {
        self.chunks.get(id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn add_index_file(&mut self, file: &IndexFile) {
        for pack in &file.packs {
            for entry in &pack.blobs {
                self.add_chunk(entry.metadata(&pack.id));
            }
            self.add_pack(PackInfo {
                id: pack.id.clone(),
                size: pack.size,
                chunk_count: pack.blobs.len() as u32,
            });
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.packs.clear();
    }
}

/// Persisted form, one object per sealed pack under `index/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFile {
    pub packs: Vec<IndexedPack>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedPack {
    pub id: PackID,
    pub size: u64,
    pub blobs: Vec<PackEntry>,
}

impl IndexFile {
    pub fn for_pack(id: PackID, size: u64, blobs: Vec<PackEntry>) -> Self {
        Self {
            packs: vec![IndexedPack { id, size, blobs }],
        }
    }

    pub fn seal(&self, encryptor: &Encryptor) -> Result<Bytes> {
        let json = serde_json::to_vec(self)?;
        Ok(Bytes::from(encryptor.seal(&json, INDEX_AAD)?))
    }

    pub fn open(data: &[u8], encryptor: &Encryptor, object: &str) -> Result<Self> {
        let json = encryptor
            .open(data, INDEX_AAD)
            .map_err(|_| Error::integrity(object, "index failed authentication"))?;
        serde_json::from_slice(&json)
            .map_err(|e| Error::integrity(object, format!("malformed index: {}", e)))
    }
}

pub fn index_object_name(pack_id: &str) -> String {
    format!("index/{}", pack_id)
}

/// Reads every index object. Listing failures are fatal; per-object failures
/// are returned alongside the object name so callers can decide.
pub async fn load_index_files(
    backend: &dyn Backend,
    encryptor: &Encryptor,
) -> Result<Vec<(String, Result<IndexFile>)>> {
    let names = backend.list("index").await?;
    let mut files = Vec::with_capacity(names.len());
    for name in names {
        let file = match backend.read(&name).await {
            Ok(data) => IndexFile::open(&data, encryptor, &name),
            Err(e) => Err(e),
        };
        debug!(object = object_basename(&name), ok = file.is_ok(), "Loaded index object");
        files.push((name, file));
    }
    Ok(files)
}

/// Builds the master index, failing on the first unreadable index object.
pub async fn load_index(backend: &dyn Backend, encryptor: &Encryptor) -> Result<Index> {
    let mut index = Index::new();
    for (_, file) in load_index_files(backend, encryptor).await? {
        index.add_index_file(&file?);
    }
    Ok(index)
}
