use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, RwLock};

use crate::error::{Error, Result};

pub const CHUNK_SIZE: usize = 10_000;

pub type ChunkReceiver = mpsc::Receiver<Result<Vec<u8>>>;

/// Per-node key/value store for owned and replicated keys.
#[tonic::async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Stores `data` under `key`, replacing any previous value.
    async fn save(&self, key: u64, data: &[u8]) -> Result<()>;

    /// Fails with [`Error::NotFound`] when the key is absent.
    async fn read(&self, key: u64) -> Result<Vec<u8>>;

    /// Removing an absent key is not an error.
    async fn delete(&self, key: u64) -> Result<()>;

    /// Streams the value in chunks of at most [`CHUNK_SIZE`] bytes.
    async fn read_chunks(&self, key: u64) -> Result<ChunkReceiver> {
        let data = self.read(key).await?;
        let chunks: Vec<Vec<u8>> = if data.is_empty() {
            vec![Vec::new()]
        } else {
            data.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect()
        };
        let (tx, rx) = mpsc::channel(chunks.len());
        for chunk in chunks {
            // capacity equals the chunk count, so this never waits
            if tx.send(Ok(chunk)).await.is_err() {
                break;
            }
        }
        Ok(rx)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    store: RwLock<HashMap<u64, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

#[tonic::async_trait]
impl Storage for MemoryStore {
    async fn save(&self, key: u64, data: &[u8]) -> Result<()> {
        let mut store = self.store.write().await;
        store.insert(key, data.to_vec());
        Ok(())
    }

    async fn read(&self, key: u64) -> Result<Vec<u8>> {
        let store = self.store.read().await;
        store.get(&key).cloned().ok_or(Error::NotFound(key))
    }

    async fn delete(&self, key: u64) -> Result<()> {
        let mut store = self.store.write().await;
        store.remove(&key);
        Ok(())
    }
}

/// One file per key under a root directory.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(DiskStore { root })
    }

    fn path(&self, key: u64) -> PathBuf {
        self.root.join(key.to_string())
    }
}

fn not_found(key: u64) -> impl FnOnce(std::io::Error) -> Error {
    move |err| match err.kind() {
        ErrorKind::NotFound => Error::NotFound(key),
        _ => Error::Io(err),
    }
}

#[tonic::async_trait]
impl Storage for DiskStore {
    async fn save(&self, key: u64, data: &[u8]) -> Result<()> {
        // write aside and rename so readers never see a torn value
        let tmp = self.root.join(format!(".{}.{}.tmp", key, rand::random::<u32>()));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, self.path(key)).await?;
        Ok(())
    }

    async fn read(&self, key: u64) -> Result<Vec<u8>> {
        tokio::fs::read(self.path(key)).await.map_err(not_found(key))
    }

    async fn delete(&self, key: u64) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn read_chunks(&self, key: u64) -> Result<ChunkReceiver> {
        let mut file = tokio::fs::File::open(self.path(key))
            .await
            .map_err(not_found(key))?;
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            let mut sent_any = false;
            loop {
                let mut chunk = vec![0u8; CHUNK_SIZE];
                let read = match read_full(&mut file, &mut chunk).await {
                    Ok(read) => read,
                    Err(err) => {
                        let _ = tx.send(Err(err.into())).await;
                        return;
                    }
                };
                if read == 0 && sent_any {
                    return;
                }
                chunk.truncate(read);
                sent_any = true;
                // the reader went away
                if tx.send(Ok(chunk)).await.is_err() || read < CHUNK_SIZE {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: ChunkReceiver) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk.unwrap());
        }
        chunks
    }

    #[tokio::test]
    async fn memory_store_last_write_wins() {
        let store = MemoryStore::new();
        store.save(7, b"one").await.unwrap();
        store.save(7, b"two").await.unwrap();
        assert_eq!(store.read(7).await.unwrap(), b"two");

        store.delete(7).await.unwrap();
        assert!(matches!(store.read(7).await, Err(Error::NotFound(7))));
        store.delete(7).await.unwrap();
    }

    #[tokio::test]
    async fn memory_store_chunks_large_values() {
        let store = MemoryStore::new();
        let value = vec![3u8; CHUNK_SIZE * 2 + 5];
        store.save(1, &value).await.unwrap();

        let chunks = collect(store.read_chunks(1).await.unwrap()).await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), value);
        assert!(matches!(store.read_chunks(2).await, Err(Error::NotFound(2))));
    }

    #[tokio::test]
    async fn disk_store_overwrites_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();

        store.save(42, b"first value").await.unwrap();
        store.save(42, b"second").await.unwrap();
        assert_eq!(store.read(42).await.unwrap(), b"second");

        store.delete(42).await.unwrap();
        assert!(matches!(store.read(42).await, Err(Error::NotFound(42))));
        store.delete(42).await.unwrap();
    }

    #[tokio::test]
    async fn disk_store_streams_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let value: Vec<u8> = (0..(CHUNK_SIZE * 2) as u32).map(|i| i as u8).collect();
        store.save(9, &value).await.unwrap();

        let chunks = collect(store.read_chunks(9).await.unwrap()).await;
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_SIZE));
        assert_eq!(chunks.concat(), value);

        store.save(10, b"").await.unwrap();
        let chunks = collect(store.read_chunks(10).await.unwrap()).await;
        assert_eq!(chunks, vec![Vec::<u8>::new()]);

        assert!(matches!(store.read_chunks(11).await, Err(Error::NotFound(11))));
    }
}
