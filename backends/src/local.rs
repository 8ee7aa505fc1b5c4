use async_trait::async_trait;
use bytes::Bytes;
use snapvault_core::backend::{Backend, BackendType};
use snapvault_core::{Error, Result};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

const TEMP_PREFIX: &str = ".tmp-";
const LAYOUT_DIRS: [&str; 4] = ["data", "index", "keys", "snapshots"];

/// Repository stored in a local directory. Writes go to a temp file that is
/// fsynced and renamed into place, so a reported write survives a crash.
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        for dir in LAYOUT_DIRS {
            fs::create_dir_all(self.base_path.join(dir))
                .await
                .map_err(|e| Error::Backend(format!("Failed to create {}: {}", dir, e)))?;
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| Error::Backend(format!("Failed to stat {}: {}", path, e)))
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(path))
            .await
            .map_err(|e| Error::Backend(format!("Failed to read {}: {}", path, e)))?;
        Ok(Bytes::from(data))
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let read_err = |e: std::io::Error| Error::Backend(format!("Failed to read {}: {}", path, e));
        let mut file = fs::File::open(self.full_path(path)).await.map_err(read_err)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(read_err)?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await.map_err(read_err)?;
        Ok(Bytes::from(buf))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let write_err = |e: std::io::Error| Error::Backend(format!("Failed to write {}: {}", path, e));
        let full_path = self.full_path(path);
        let parent = full_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_path.clone());
        fs::create_dir_all(&parent).await.map_err(write_err)?;

        let temp_path = parent.join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4().simple()));
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &full_path).await?;
            sync_dir(&parent).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(write_err(e));
        }
        debug!(object = path, bytes = data.len(), "Wrote object");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Backend(format!("Failed to delete {}: {}", path, e))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut entries = match fs::read_dir(&full_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Backend(format!("Failed to list {}: {}", prefix, e))),
        };

        let mut results = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Backend(format!("Failed to list {}: {}", prefix, e)))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                results.push(format!("{}/{}", prefix, name));
            }
        }
        results.sort();
        Ok(results)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    fn location(&self) -> String {
        self.base_path.display().to_string()
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
