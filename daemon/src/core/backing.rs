use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use tokio::task::spawn_blocking;

use crate::config::SECTOR_SHIFT;

// The local backing device behind a replicated volume. Submissions are
// asynchronous; the engine treats completion as the endio event.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    async fn read(&self, sector: u64, size: u32) -> io::Result<Bytes>;

    async fn write(&self, sector: u64, data: Bytes) -> io::Result<()>;

    // Durability point; a barrier ack must not be sent before this
    async fn flush(&self) -> io::Result<()>;

    fn capacity_bytes(&self) -> u64;

    // Consulted by the congested-remote read balancing policy
    fn is_congested(&self) -> bool {
        false
    }
}

// Flat file (or raw device node) backing store. Positioned IO runs on
// the blocking pool; the file itself is pre-sized at attach time.
pub struct FileBacking {
    file: Arc<std::fs::File>,
    capacity: u64,
}

impl FileBacking {
    pub fn open<P: AsRef<Path>>(path: P, capacity: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        if file.metadata()?.len() < capacity {
            file.set_len(capacity)?;
        }
        debug!(
            "opened backing file {} ({} bytes)",
            path.as_ref().display(),
            capacity
        );
        Ok(Self {
            file: Arc::new(file),
            capacity,
        })
    }
}

#[async_trait]
impl BackingStore for FileBacking {
    async fn read(&self, sector: u64, size: u32) -> io::Result<Bytes> {
        let file = Arc::clone(&self.file);
        let offset = sector << SECTOR_SHIFT;
        spawn_blocking(move || {
            let mut buffer = vec![0u8; size as usize];
            file.read_exact_at(&mut buffer, offset)?;
            Ok(Bytes::from(buffer))
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    async fn write(&self, sector: u64, data: Bytes) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        let offset = sector << SECTOR_SHIFT;
        spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    async fn flush(&self) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        spawn_blocking(move || file.sync_data())
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }
}

// Memory-backed store with switchable fault injection, for tests
#[derive(Default)]
pub struct MemBacking {
    blocks: Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    congested: AtomicBool,
}

impl MemBacking {
    pub fn new(capacity: u64) -> Self {
        Self {
            blocks: Mutex::new(vec![0u8; capacity as usize]),
            ..Default::default()
        }
    }

    pub fn set_fail_reads(&self, value: bool) {
        self.fail_reads.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, value: bool) {
        self.fail_writes.store(value, Ordering::SeqCst);
    }

    pub fn set_congested(&self, value: bool) {
        self.congested.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackingStore for MemBacking {
    async fn read(&self, sector: u64, size: u32) -> io::Result<Bytes> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read fault"));
        }
        let blocks = self.blocks.lock().expect("backing lock poisoned");
        let offset = (sector << SECTOR_SHIFT) as usize;
        let end = offset + size as usize;
        if end > blocks.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "beyond device"));
        }
        Ok(Bytes::copy_from_slice(&blocks[offset..end]))
    }

    async fn write(&self, sector: u64, data: Bytes) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write fault"));
        }
        let mut blocks = self.blocks.lock().expect("backing lock poisoned");
        let offset = (sector << SECTOR_SHIFT) as usize;
        let end = offset + data.len();
        if end > blocks.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "beyond device"));
        }
        blocks[offset..end].copy_from_slice(&data);
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn capacity_bytes(&self) -> u64 {
        self.blocks.lock().expect("backing lock poisoned").len() as u64
    }

    fn is_congested(&self) -> bool {
        self.congested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_backing_round_trip() {
        let store = MemBacking::new(1 << 20);
        let data = Bytes::from(vec![0xAB; 4096]);
        store.write(8, data.clone()).await.unwrap();
        let back = store.read(8, 4096).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_mem_backing_fault_injection() {
        let store = MemBacking::new(1 << 20);
        store.set_fail_writes(true);
        assert!(store.write(0, Bytes::from(vec![0u8; 512])).await.is_err());
        store.set_fail_writes(false);
        store.write(0, Bytes::from(vec![1u8; 512])).await.unwrap();
    }

    #[tokio::test]
    async fn test_mem_backing_bounds() {
        let store = MemBacking::new(4096);
        assert!(store.read(8, 4096).await.is_err());
    }

    #[tokio::test]
    async fn test_file_backing_round_trip() {
        let dir = tempdir::TempDir::new("vblock-backing").unwrap();
        let path = dir.path().join("vol0.img");
        let store = FileBacking::open(&path, 1 << 20).unwrap();
        assert_eq!(store.capacity_bytes(), 1 << 20);

        let data = Bytes::from(vec![0x5A; 8192]);
        store.write(16, data.clone()).await.unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.read(16, 8192).await.unwrap(), data);
    }
}
