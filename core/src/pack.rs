use crate::crypto::{Encryptor, SEAL_OVERHEAD};
use crate::types::{BlobType, ChunkID, ChunkMetadata, PackID};
use crate::{Error, Result};
use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};

const HEADER_AAD: &[u8] = b"snapvault-pack-header";
const HEADER_LEN_SIZE: usize = 4;

/// Pack layout:
///
/// ```text
/// [sealed blob 0][sealed blob 1]...[sealed header][u32 LE sealed header length]
/// ```
///
/// Each blob is zlib-compressed then sealed with its content hash as
/// associated data, so a blob can be read and verified from its byte range alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackHeader {
    pub pack_id: PackID,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub entries: Vec<PackEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackEntry {
    pub id: ChunkID,
    pub blob_type: BlobType,
    pub offset: u64,
    pub length: u32,
    pub uncompressed_length: u32,
}

impl PackEntry {
    pub fn metadata(&self, pack_id: &PackID) -> ChunkMetadata {
        ChunkMetadata {
            id: self.id,
            blob_type: self.blob_type,
            pack_id: pack_id.clone(),
            offset: self.offset,
            length: self.length,
            uncompressed_length: self.uncompressed_length,
        }
    }
}

pub fn new_pack_id() -> PackID {
    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

pub fn pack_object_name(pack_id: &str) -> String {
    format!("data/{}", pack_id)
}

pub fn encode_blob(encryptor: &Encryptor, id: &ChunkID, plaintext: &[u8]) -> Result<Vec<u8>> {
    let compressed = compress_data(plaintext)?;
    encryptor.seal(&compressed, id.as_bytes())
}

/// Opens a sealed blob and checks that its plaintext hashes to `id`.
pub fn decode_blob(encryptor: &Encryptor, id: &ChunkID, sealed: &[u8], object: &str) -> Result<Vec<u8>> {
    let compressed = encryptor
        .open(sealed, id.as_bytes())
        .map_err(|_| Error::integrity(object, format!("blob {} failed authentication", id.short_string())))?;
    let plaintext = decompress_data(&compressed)
        .map_err(|e| Error::integrity(object, format!("blob {} does not decompress: {}", id.short_string(), e)))?;
    if ChunkID::from_data(&plaintext) != *id {
        return Err(Error::integrity(
            object,
            format!("blob {} content hash mismatch", id.short_string()),
        ));
    }
    Ok(plaintext)
}

fn compress_data(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress_data(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut result = Vec::new();
    decoder.read_to_end(&mut result)?;
    Ok(result)
}

/// Parses and authenticates the trailing header of a complete pack.
pub fn read_header(encryptor: &Encryptor, pack_id: &PackID, pack: &[u8]) -> Result<PackHeader> {
    let object = pack_object_name(pack_id);
    if pack.len() < HEADER_LEN_SIZE + SEAL_OVERHEAD {
        return Err(Error::integrity(&object, "pack too short"));
    }

    let (body, len_bytes) = pack.split_at(pack.len() - HEADER_LEN_SIZE);
    let mut len_buf = [0u8; HEADER_LEN_SIZE];
    len_buf.copy_from_slice(len_bytes);
    let header_len = u32::from_le_bytes(len_buf) as usize;
    if header_len > body.len() {
        return Err(Error::integrity(&object, "header length out of range"));
    }

    let sealed_header = &body[body.len() - header_len..];
    let header_data = encryptor
        .open(sealed_header, HEADER_AAD)
        .map_err(|_| Error::integrity(&object, "pack header failed authentication"))?;
    let header: PackHeader = bincode::deserialize(&header_data)
        .map_err(|e| Error::integrity(&object, format!("malformed pack header: {}", e)))?;

    if header.pack_id != *pack_id {
        return Err(Error::integrity(
            &object,
            format!("header names pack {}", header.pack_id),
        ));
    }
    let data_len = (body.len() - header_len) as u64;
    if let Some(entry) = header
        .entries
        .iter()
        .find(|e| e.offset + e.length as u64 > data_len)
    {
        return Err(Error::integrity(
            &object,
            format!("entry {} extends beyond pack data", entry.id.short_string()),
        ));
    }
    Ok(header)
}

/// An open pack accumulating sealed blobs in memory.
#[derive(Debug)]
pub struct PackBuilder {
    pack_id: PackID,
    created_at: chrono::DateTime<chrono::Utc>,
    entries: Vec<PackEntry>,
    data: Vec<u8>,
}

impl PackBuilder {
    pub fn new(pack_id: PackID) -> Self {
        Self {
            pack_id,
            created_at: chrono::Utc::now(),
            entries: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn pack_id(&self) -> &PackID {
        &self.pack_id
    }

    pub fn add_blob(
        &mut self,
        id: ChunkID,
        blob_type: BlobType,
        sealed: &[u8],
        uncompressed_length: u32,
    ) -> ChunkMetadata {
        let entry = PackEntry {
            id,
            blob_type,
            offset: self.data.len() as u64,
            length: sealed.len() as u32,
            uncompressed_length,
        };
        self.data.extend_from_slice(sealed);
        let metadata = entry.metadata(&self.pack_id);
        self.entries.push(entry);
        metadata
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self, max_size: u64) -> bool {
        self.data.len() as u64 >= max_size
    }

    /// Appends the sealed header and returns the complete pack bytes.
    pub fn finish(self, encryptor: &Encryptor) -> Result<(PackHeader, Bytes)> {
        let header = PackHeader {
            pack_id: self.pack_id,
            created_at: self.created_at,
            entries: self.entries,
        };
        let header_data =
            bincode::serialize(&header).map_err(|e| Error::Other(e.to_string()))?;
        let sealed_header = encryptor.seal(&header_data, HEADER_AAD)?;

        let mut pack = self.data;
        pack.reserve(sealed_header.len() + HEADER_LEN_SIZE);
        pack.extend_from_slice(&sealed_header);
        pack.extend_from_slice(&(sealed_header.len() as u32).to_le_bytes());
        Ok((header, Bytes::from(pack)))
    }
}

/// Owns the open pack and the claims on blobs that are packed but not yet
/// indexed. Guarded by the blob store's single writer lock.
#[derive(Debug)]
pub struct PackManager {
    current_pack: Option<PackBuilder>,
    max_pack_size: u64,
    claims: HashMap<ChunkID, ChunkMetadata>,
}

impl PackManager {
    pub fn new(max_pack_size: u64) -> Self {
        Self {
            current_pack: None,
            max_pack_size,
            claims: HashMap::new(),
        }
    }

    pub fn claimed(&self, id: &ChunkID) -> Option<&ChunkMetadata> {
        self.claims.get(id)
    }

    /// True while `pack_id` is the pack still accepting blobs.
    pub fn is_open(&self, pack_id: &PackID) -> bool {
        self.current_pack.as_ref().is_some_and(|p| p.pack_id == *pack_id)
    }

    /// Appends a blob and claims its hash. Returns the location and, if the
    /// pack reached the size threshold, the pack to seal.
    pub fn add_blob(
        &mut self,
        id: ChunkID,
        blob_type: BlobType,
        sealed: &[u8],
        uncompressed_length: u32,
    ) -> (ChunkMetadata, Option<PackBuilder>) {
        let pack = self
            .current_pack
            .get_or_insert_with(|| PackBuilder::new(new_pack_id()));
        let metadata = pack.add_blob(id, blob_type, sealed, uncompressed_length);
        self.claims.insert(id, metadata.clone());

        let full = if pack.is_full(self.max_pack_size) {
            self.current_pack.take()
        } else {
            None
        };
        (metadata, full)
    }

    pub fn finish_current_pack(&mut self) -> Option<PackBuilder> {
        match self.current_pack.take() {
            Some(pack) if !pack.is_empty() => Some(pack),
            _ => None,
        }
    }

    /// Drops the claims of a pack once it is indexed or its upload failed.
    pub fn release(&mut self, pack_id: &PackID) {
        self.claims.retain(|_, meta| meta.pack_id != *pack_id);
    }

    pub fn reset(&mut self) {
        self.current_pack = None;
        self.claims.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;

    fn encryptor() -> Encryptor {
        Encryptor::new(MasterKey::generate().as_bytes()).unwrap()
    }

    #[test]
    fn test_pack_roundtrip() {
        let enc = encryptor();
        let mut builder = PackBuilder::new(new_pack_id());
        let pack_id = builder.pack_id().clone();

        let blobs: [&[u8]; 3] = [b"first blob", b"second blob", b""];
        let mut locations = Vec::new();
        for blob in &blobs {
            let id = ChunkID::from_data(blob);
            let sealed = encode_blob(&enc, &id, blob).unwrap();
            locations.push(builder.add_blob(id, BlobType::Data, &sealed, blob.len() as u32));
        }

        let (_, pack) = builder.finish(&enc).unwrap();
        let header = read_header(&enc, &pack_id, &pack).unwrap();
        assert_eq!(header.entries.len(), 3);

        for (blob, meta) in blobs.iter().zip(&locations) {
            let start = meta.offset as usize;
            let sealed = &pack[start..start + meta.length as usize];
            let plain = decode_blob(&enc, &meta.id, sealed, "data/test").unwrap();
            assert_eq!(&plain[..], *blob);
        }
    }

    #[test]
    fn test_flipped_bit_is_integrity_error() {
        let enc = encryptor();
        let id = ChunkID::from_data(b"hello");
        let mut sealed = encode_blob(&enc, &id, b"hello").unwrap();
        sealed[14] ^= 0x01;

        let err = decode_blob(&enc, &id, &sealed, "data/x").unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[test]
    fn test_blob_bound_to_its_hash() {
        let enc = encryptor();
        let id = ChunkID::from_data(b"hello");
        let sealed = encode_blob(&enc, &id, b"hello").unwrap();

        let other = ChunkID::from_data(b"world");
        assert!(decode_blob(&enc, &other, &sealed, "data/x").is_err());
    }

    #[test]
    fn test_header_rejects_wrong_pack_name() {
        let enc = encryptor();
        let mut builder = PackBuilder::new(new_pack_id());
        let id = ChunkID::from_data(b"x");
        let sealed = encode_blob(&enc, &id, b"x").unwrap();
        builder.add_blob(id, BlobType::Data, &sealed, 1);
        let (_, pack) = builder.finish(&enc).unwrap();

        let err = read_header(&enc, &new_pack_id(), &pack).unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert!(read_header(&enc, &new_pack_id(), &pack[..3]).is_err());
    }

    #[test]
    fn test_manager_seals_at_threshold_and_releases_claims() {
        let enc = encryptor();
        let mut manager = PackManager::new(16);

        let a = ChunkID::from_data(b"a");
        let sealed = encode_blob(&enc, &a, &[7u8; 200]).unwrap();
        let (meta, full) = manager.add_blob(a, BlobType::Data, &sealed, 200);

        let full = full.expect("pack over threshold is handed out for sealing");
        assert_eq!(full.pack_id(), &meta.pack_id);
        assert!(manager.claimed(&a).is_some());
        assert!(manager.finish_current_pack().is_none());

        manager.release(&meta.pack_id);
        assert!(manager.claimed(&a).is_none());
    }
}
