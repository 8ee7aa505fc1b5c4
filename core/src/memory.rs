use crate::backend::{Backend, BackendType};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-process backend. Thread-safe via Mutex; keeps a write log so callers
/// can observe how many physical writes an operation caused.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Bytes>>,
    write_log: Mutex<Vec<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes issued for names under `prefix/`.
    pub fn write_count(&self, prefix: &str) -> usize {
        let dir = format!("{}/", prefix);
        let log = self.write_log.lock().unwrap_or_else(|e| e.into_inner());
        log.iter().filter(|name| name.starts_with(&dir)).count()
    }

    /// Sum of object sizes under `prefix/`.
    pub fn total_size(&self, prefix: &str) -> u64 {
        let dir = format!("{}/", prefix);
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .iter()
            .filter(|(name, _)| name.starts_with(&dir))
            .map(|(_, data)| data.len() as u64)
            .sum()
    }

    /// Flips one bit of a stored object in place.
    pub fn flip_bit(&self, name: &str, offset: usize) -> Result<()> {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let data = objects
            .get_mut(name)
            .ok_or_else(|| Error::Backend(format!("Failed to read {}: not found", name)))?;
        if offset >= data.len() {
            return Err(Error::Backend(format!("Offset {} beyond end of {}", offset, name)));
        }
        let mut bytes = data.to_vec();
        bytes[offset] ^= 0x01;
        *data = Bytes::from(bytes);
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects.contains_key(path))
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("Failed to read {}: not found", path)))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), data);
        self.write_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(path.to_string());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = format!("{}/", prefix);
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .keys()
            .filter(|name| name.starts_with(&dir) && !name[dir.len()..].contains('/'))
            .cloned()
            .collect())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_is_one_level_deep() {
        let backend = MemoryBackend::new();
        backend.write("data/a", Bytes::from_static(b"1")).await.unwrap();
        backend.write("data/b", Bytes::from_static(b"22")).await.unwrap();
        backend.write("data/sub/c", Bytes::from_static(b"3")).await.unwrap();
        backend.write("database", Bytes::from_static(b"4")).await.unwrap();

        let names = backend.list("data").await.unwrap();
        assert_eq!(names, vec!["data/a".to_string(), "data/b".to_string()]);
        assert_eq!(backend.write_count("data"), 3);
        assert_eq!(backend.total_size("data"), 4);
    }

    #[tokio::test]
    async fn test_flip_bit() {
        let backend = MemoryBackend::new();
        backend.write("data/a", Bytes::from_static(&[0u8, 0u8])).await.unwrap();
        backend.flip_bit("data/a", 1).unwrap();

        assert_eq!(&backend.read("data/a").await.unwrap()[..], &[0u8, 1u8]);
        assert!(backend.flip_bit("data/a", 2).is_err());
        assert!(backend.read("data/missing").await.is_err());
    }
}
