use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Content hash of a blob (file chunk or serialized tree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkID(blake3::Hash);

impl ChunkID {
    pub fn new(hash: blake3::Hash) -> Self {
        Self(hash)
    }

    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<blake3::Hash> for ChunkID {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash)
    }
}

impl FromStr for ChunkID {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(blake3::Hash::from(array)))
    }
}

impl Serialize for ChunkID {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkID {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ChunkID::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ChunkID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub type SnapshotID = String;
pub type PackID = String;

pub const REPO_FORMAT_VERSION: u32 = 1;

/// Persisted, encrypted repository configuration. Fixed at `init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: String,
    pub chunker: ChunkerParams,
    pub pack_size: u64,
}

impl RepoConfig {
    pub fn new(chunker: ChunkerParams, pack_size: u64) -> Self {
        Self {
            version: REPO_FORMAT_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            chunker,
            pack_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerParams {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl ChunkerParams {
    pub fn with_average(avg_size: u32) -> Self {
        Self {
            min_size: avg_size / 4,
            avg_size,
            max_size: avg_size.saturating_mul(4),
        }
    }
}

impl Default for ChunkerParams {
    fn default() -> Self {
        Self::with_average(1024 * 1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    pub memory: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

impl KdfParams {
    /// Fresh random salt with explicit Argon2id cost parameters.
    pub fn with_cost(memory: u32, iterations: u32, parallelism: u32) -> Self {
        use rand::RngCore;
        let mut salt = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);

        Self {
            algorithm: "argon2id".to_string(),
            iterations,
            memory,
            parallelism,
            salt,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::with_cost(65536, 1, 4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    Data,
    Tree,
}

/// Where a blob lives: the authoritative dedup record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub id: ChunkID,
    pub blob_type: BlobType,
    pub pack_id: PackID,
    pub offset: u64,
    pub length: u32,
    pub uncompressed_length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub node_type: NodeType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtree_id: Option<ChunkID>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ChunkID>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Directory,
    Symlink,
}

impl TreeNode {
    pub fn is_file(&self) -> bool {
        matches!(self.node_type, NodeType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.node_type, NodeType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.node_type, NodeType::Symlink)
    }
}
