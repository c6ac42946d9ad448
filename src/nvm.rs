//! Byte-level durable storage
//!
//! `NonVolatileStorage` is implemented by the board's flash or EEPROM
//! driver. `MemoryStorage` is a RAM-backed medium with flash semantics and
//! fault injection, used by the bench binary and the tests.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StorageError;

/// Value of an erased byte.
pub const ERASED_BYTE: u8 = 0xFF;

pub trait NonVolatileStorage: Send {
    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), StorageError>;

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Erases the sector that starts at `address`.
    fn erase_sector(&mut self, address: u32) -> Result<(), StorageError>;

    fn capacity(&self) -> u32;

    fn sector_size(&self) -> u32;

    /// Blocks until previous writes are durable.
    fn commit(&mut self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStorageStats {
    pub bytes_written: u64,
    pub writes: u32,
    pub erases: u32,
    pub commits: u32,
}

struct Medium {
    bytes: Vec<u8>,
    sector_size: u32,
    /// Bytes that may still be written before simulated power loss.
    write_budget: Option<usize>,
    fail_commits: bool,
    stats: MemoryStorageStats,
}

/// RAM-backed storage. Clones are handles to the same medium.
#[derive(Clone)]
pub struct MemoryStorage {
    medium: Arc<Mutex<Medium>>,
}

impl MemoryStorage {
    pub fn new(capacity: u32, sector_size: u32) -> Self {
        MemoryStorage {
            medium: Arc::new(Mutex::new(Medium {
                bytes: vec![ERASED_BYTE; capacity as usize],
                sector_size,
                write_budget: None,
                fail_commits: false,
                stats: MemoryStorageStats::default(),
            })),
        }
    }

    /// Lets `bytes` more bytes reach the medium, then fails every write as
    /// if power was lost part way through.
    pub fn fail_after_bytes(&self, bytes: usize) {
        if let Ok(mut m) = self.medium.lock() {
            m.write_budget = Some(bytes);
        }
    }

    pub fn fail_commits(&self, fail: bool) {
        if let Ok(mut m) = self.medium.lock() {
            m.fail_commits = fail;
        }
    }

    /// Clears injected faults, keeping the contents.
    pub fn restore_power(&self) {
        if let Ok(mut m) = self.medium.lock() {
            m.write_budget = None;
            m.fail_commits = false;
        }
    }

    pub fn stats(&self) -> MemoryStorageStats {
        self.medium
            .lock()
            .map(|m| m.stats)
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Medium>, StorageError> {
        self.medium
            .lock()
            .map_err(|_| StorageError::Device("storage medium lock poisoned".into()))
    }
}

fn check_bounds(address: u32, len: usize, capacity: u32) -> Result<usize, StorageError> {
    let end = address as u64 + len as u64;
    if end > capacity as u64 {
        Err(StorageError::OutOfBounds {
            address,
            len,
            capacity,
        })
    } else {
        Ok(address as usize)
    }
}

impl NonVolatileStorage for MemoryStorage {
    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), StorageError> {
        let m = self.lock()?;
        let start = check_bounds(address, buffer.len(), m.bytes.len() as u32)?;
        buffer.copy_from_slice(&m.bytes[start..start + buffer.len()]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), StorageError> {
        let mut m = self.lock()?;
        let start = check_bounds(address, data.len(), m.bytes.len() as u32)?;

        let allowed = m.write_budget.map_or(data.len(), |b| b.min(data.len()));
        // flash can only clear bits
        for (dst, src) in m.bytes[start..start + allowed].iter_mut().zip(data) {
            *dst &= *src;
        }
        m.stats.bytes_written += allowed as u64;
        m.stats.writes += 1;

        if let Some(budget) = m.write_budget.as_mut() {
            *budget -= allowed;
            if allowed < data.len() {
                return Err(StorageError::Device("simulated power loss".into()));
            }
        }
        Ok(())
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), StorageError> {
        let mut m = self.lock()?;
        let sector_size = m.sector_size;
        if address % sector_size != 0 {
            return Err(StorageError::Device(format!(
                "erase address {:#010x} is not sector aligned",
                address
            )));
        }
        let start = check_bounds(address, sector_size as usize, m.bytes.len() as u32)?;
        if m.write_budget == Some(0) {
            return Err(StorageError::Device("simulated power loss".into()));
        }
        m.bytes[start..start + sector_size as usize].fill(ERASED_BYTE);
        m.stats.erases += 1;
        Ok(())
    }

    fn capacity(&self) -> u32 {
        self.medium
            .lock()
            .map(|m| m.bytes.len() as u32)
            .unwrap_or(0)
    }

    fn sector_size(&self) -> u32 {
        self.medium.lock().map(|m| m.sector_size).unwrap_or(0)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let mut m = self.lock()?;
        if m.fail_commits || m.write_budget == Some(0) {
            return Err(StorageError::Device("commit failed".into()));
        }
        m.stats.commits += 1;
        Ok(())
    }
}
