//! Persistent trim store
//!
//! Two record slots, each owning one sector. A flush always rewrites the
//! slot that does not hold the newest record, so the last complete record
//! survives an interrupted flush.
//!
//! Record layout, little endian:
//!
//! | offset | size | field           |
//! |--------|------|-----------------|
//! | 0      | 4    | magic           |
//! | 4      | 2    | layout version  |
//! | 6      | 2    | reserved        |
//! | 8      | 4    | sequence        |
//! | 12     | 4    | payload length  |
//! | 16     | 4    | CRC-32          |
//! | 20     | n    | JSON trim table |
//!
//! The CRC covers the sequence and the payload. The header is written after
//! the payload, so a record whose header is intact is complete.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::StorageError;
use crate::ms_timer::elapsed_ms;
use crate::nvm::NonVolatileStorage;
use crate::trim_table::TrimTable;
use crate::tuning::{TRIM_RECORD_MAGIC, TRIM_RECORD_VERSION, TRIM_SLOT_ADDRESSES};

pub const RECORD_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordHeader {
    sequence: u32,
    payload_len: u32,
    crc: u32,
}

impl RecordHeader {
    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN);
        buf.write_u32::<LittleEndian>(TRIM_RECORD_MAGIC)?;
        buf.write_u16::<LittleEndian>(TRIM_RECORD_VERSION)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.sequence)?;
        buf.write_u32::<LittleEndian>(self.payload_len)?;
        buf.write_u32::<LittleEndian>(self.crc)?;
        Ok(buf)
    }

    /// `None` for an erased slot or a foreign layout.
    fn decode(bytes: &[u8]) -> Result<Option<Self>, StorageError> {
        let mut rdr = Cursor::new(bytes);
        if rdr.read_u32::<LittleEndian>()? != TRIM_RECORD_MAGIC {
            return Ok(None);
        }
        if rdr.read_u16::<LittleEndian>()? != TRIM_RECORD_VERSION {
            return Ok(None);
        }
        let _reserved = rdr.read_u16::<LittleEndian>()?;
        Ok(Some(RecordHeader {
            sequence: rdr.read_u32::<LittleEndian>()?,
            payload_len: rdr.read_u32::<LittleEndian>()?,
            crc: rdr.read_u32::<LittleEndian>()?,
        }))
    }
}

fn record_crc(sequence: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&sequence.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Wear and failure bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageHealth {
    pub flushes: u32,
    pub failures: u32,
    pub consecutive_failures: u32,
    pub bytes_written: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlushOutcome {
    pub version: u32,
    pub result: Result<(), String>,
    pub health: StorageHealth,
}

pub struct TrimStore<S> {
    storage: S,
    /// Slot holding the newest valid record.
    active_slot: Option<usize>,
    sequence: u32,
    last_flushed: Option<TrimTable>,
    health: StorageHealth,
}

impl<S> TrimStore<S>
where
    S: NonVolatileStorage,
{
    pub fn new(storage: S) -> Result<Self, StorageError> {
        let slot_size = storage.sector_size();
        for address in TRIM_SLOT_ADDRESSES.iter() {
            if slot_size == 0 || address % slot_size != 0 {
                return Err(StorageError::Device(format!(
                    "slot {:#010x} is not sector aligned",
                    address
                )));
            }
            if *address as u64 + slot_size as u64 > storage.capacity() as u64 {
                return Err(StorageError::OutOfBounds {
                    address: *address,
                    len: slot_size as usize,
                    capacity: storage.capacity(),
                });
            }
        }

        Ok(TrimStore {
            storage,
            active_slot: None,
            sequence: 0,
            last_flushed: None,
            health: StorageHealth::default(),
        })
    }

    pub fn health(&self) -> &StorageHealth {
        &self.health
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Newest valid record, or the default table when no slot holds one.
    pub fn load(&mut self) -> TrimTable {
        let mut newest: Option<(usize, u32, TrimTable)> = None;

        for slot in 0..TRIM_SLOT_ADDRESSES.len() {
            match self.read_slot(slot) {
                Ok(Some((sequence, table))) => {
                    let newer = newest
                        .as_ref()
                        .map_or(true, |(_, best, _)| sequence_newer(sequence, *best));
                    if newer {
                        newest = Some((slot, sequence, table));
                    }
                }
                Ok(None) => debug!(slot, "trim slot holds no valid record"),
                Err(e) => warn!(slot, error = %e, "trim slot unreadable"),
            }
        }

        match newest {
            Some((slot, sequence, table)) => {
                info!(slot, sequence, version = table.version, "trim table loaded");
                self.active_slot = Some(slot);
                self.sequence = sequence;
                self.last_flushed = Some(table);
                table
            }
            None => {
                info!("no stored trim table, starting from defaults");
                self.active_slot = None;
                self.sequence = 0;
                self.last_flushed = None;
                TrimTable::new()
            }
        }
    }

    fn read_slot(&mut self, slot: usize) -> Result<Option<(u32, TrimTable)>, StorageError> {
        let address = TRIM_SLOT_ADDRESSES[slot];
        let mut header_bytes = [0u8; RECORD_HEADER_LEN];
        self.storage.read(address, &mut header_bytes)?;

        let header = match RecordHeader::decode(&header_bytes)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let max_payload = self.storage.sector_size() as usize - RECORD_HEADER_LEN;
        if header.payload_len as usize > max_payload {
            return Ok(None);
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        self.storage
            .read(address + RECORD_HEADER_LEN as u32, &mut payload)?;
        if record_crc(header.sequence, &payload) != header.crc {
            return Ok(None);
        }

        match serde_json::from_slice::<TrimTable>(&payload) {
            Ok(table) => Ok(Some((header.sequence, table))),
            Err(e) => {
                warn!(slot, error = %e, "trim record passed CRC but does not decode");
                Ok(None)
            }
        }
    }

    /// Writes `table` to the inactive slot. All or nothing: on error the
    /// previous record stays authoritative.
    pub fn flush(&mut self, table: &TrimTable) -> Result<(), StorageError> {
        if self.last_flushed.as_ref() == Some(table) {
            debug!(version = table.version, "trim table unchanged, flush skipped");
            return Ok(());
        }

        match self.write_record(table) {
            Ok(bytes) => {
                self.health.flushes += 1;
                self.health.consecutive_failures = 0;
                self.health.bytes_written += bytes as u64;
                self.last_flushed = Some(*table);
                info!(
                    version = table.version,
                    sequence = self.sequence,
                    bytes,
                    "trim table flushed"
                );
                Ok(())
            }
            Err(e) => {
                self.health.failures += 1;
                self.health.consecutive_failures += 1;
                self.health.last_error = Some(e.to_string());
                warn!(version = table.version, error = %e, "trim table flush failed");
                Err(e)
            }
        }
    }

    fn write_record(&mut self, table: &TrimTable) -> Result<usize, StorageError> {
        let payload = serde_json::to_vec(table)?;
        let slot_size = self.storage.sector_size();
        if payload.len() + RECORD_HEADER_LEN > slot_size as usize {
            return Err(StorageError::RecordTooLarge {
                len: payload.len() + RECORD_HEADER_LEN,
                slot_size,
            });
        }

        let slot = match self.active_slot {
            Some(active) => (active + 1) % TRIM_SLOT_ADDRESSES.len(),
            None => 0,
        };
        let address = TRIM_SLOT_ADDRESSES[slot];
        let sequence = self.sequence.wrapping_add(1);
        let header = RecordHeader {
            sequence,
            payload_len: payload.len() as u32,
            crc: record_crc(sequence, &payload),
        }
        .encode()?;

        self.storage.erase_sector(address)?;
        self.storage
            .write(address + RECORD_HEADER_LEN as u32, &payload)?;
        self.storage.write(address, &header)?;
        self.storage.commit()?;

        self.active_slot = Some(slot);
        self.sequence = sequence;
        Ok(header.len() + payload.len())
    }
}

/// Sequence comparison that survives wrap.
fn sequence_newer(candidate: u32, current: u32) -> bool {
    let diff = candidate.wrapping_sub(current);
    diff != 0 && diff < u32::MAX / 2
}

/// Decides when learned trims are handed to the store. Does no I/O.
pub struct FlushPolicy {
    config: StoreConfig,
    dirty_since: Option<u32>,
    accumulated_delta: f32,
    latest_version: u32,
    persisted_version: Option<u32>,
    in_flight: Option<InFlight>,
    retry: Option<Retry>,
    backoff_ms: u32,
    shutdown_requested: bool,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    version: u32,
    submitted_ms: u32,
    delta: f32,
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    failed_ms: u32,
    delay_ms: u32,
}

impl FlushPolicy {
    pub fn new(config: StoreConfig, persisted_version: u32) -> Self {
        let backoff_ms = config.retry_base_ms;
        FlushPolicy {
            config,
            dirty_since: None,
            accumulated_delta: 0.0,
            latest_version: persisted_version,
            persisted_version: Some(persisted_version),
            in_flight: None,
            retry: None,
            backoff_ms,
            shutdown_requested: false,
        }
    }

    pub fn reconfigure(&mut self, config: StoreConfig) {
        self.backoff_ms = num::clamp(self.backoff_ms, config.retry_base_ms, config.retry_max_ms);
        self.config = config;
    }

    /// Records a table mutation. `delta` is the absolute trim change.
    pub fn note_change(&mut self, version: u32, delta: f32, now_ms: u32) {
        if version == self.latest_version {
            return;
        }
        self.latest_version = version;
        self.accumulated_delta += delta.abs();
        if self.dirty_since.is_none() {
            self.dirty_since = Some(now_ms);
        }
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending_version(&self) -> Option<u32> {
        if self.is_dirty() {
            Some(self.latest_version)
        } else {
            None
        }
    }

    pub fn persisted_version(&self) -> Option<u32> {
        self.persisted_version
    }

    pub fn should_flush(&self, now_ms: u32) -> bool {
        let dirty_since = match self.dirty_since {
            Some(t) => t,
            None => return false,
        };
        if self.in_flight.is_some() {
            return false;
        }
        if let Some(retry) = self.retry {
            if elapsed_ms(now_ms, retry.failed_ms) < retry.delay_ms {
                return false;
            }
            // a failed flush is retried whatever the thresholds say
            return true;
        }

        self.shutdown_requested
            || elapsed_ms(now_ms, dirty_since) >= self.config.max_dirty_ms
            || self.accumulated_delta >= self.config.max_accumulated_delta
    }

    pub fn on_submitted(&mut self, version: u32, now_ms: u32) {
        self.in_flight = Some(InFlight {
            version,
            submitted_ms: now_ms,
            delta: self.accumulated_delta,
        });
    }

    pub fn on_success(&mut self, version: u32) {
        let in_flight = match self.in_flight.take() {
            Some(f) if f.version == version => f,
            other => {
                self.in_flight = other;
                return;
            }
        };
        self.persisted_version = Some(version);
        self.retry = None;
        self.backoff_ms = self.config.retry_base_ms;
        self.accumulated_delta = (self.accumulated_delta - in_flight.delta).max(0.0);

        if self.latest_version == version {
            self.dirty_since = None;
            self.accumulated_delta = 0.0;
        } else {
            // changes arrived while the flush was in flight
            self.dirty_since = Some(in_flight.submitted_ms);
        }
    }

    pub fn on_failure(&mut self, version: u32, now_ms: u32) {
        match self.in_flight {
            Some(f) if f.version == version => self.in_flight = None,
            _ => return,
        }
        self.retry = Some(Retry {
            failed_ms: now_ms,
            delay_ms: self.backoff_ms,
        });
        debug!(retry_in_ms = self.backoff_ms, "trim flush scheduled for retry");
        self.backoff_ms = self
            .backoff_ms
            .saturating_mul(2)
            .min(self.config.retry_max_ms);
    }

    /// Delay before the next retry, while one is scheduled.
    pub fn retry_delay_ms(&self) -> Option<u32> {
        self.retry.map(|r| r.delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::MemoryStorage;
    use crate::trim_table::OperatingBucket;

    fn table(version: u32, trim: f32) -> TrimTable {
        let mut t = TrimTable::new();
        t.version = version;
        t[OperatingBucket::from_index(9).unwrap()].trim = trim;
        t
    }

    fn store() -> (TrimStore<MemoryStorage>, MemoryStorage) {
        let medium = MemoryStorage::new(0x2000, 0x1000);
        (TrimStore::new(medium.clone()).unwrap(), medium)
    }

    #[test]
    fn empty_storage_loads_default() {
        let (mut s, _) = store();
        assert_eq!(s.load(), TrimTable::new());
    }

    #[test]
    fn flush_then_reload() {
        let (mut s, medium) = store();
        s.flush(&table(3, 0.1)).unwrap();
        s.flush(&table(4, 0.12)).unwrap();

        let mut reloaded = TrimStore::new(medium).unwrap();
        assert_eq!(reloaded.load(), table(4, 0.12));
        assert_eq!(s.health().flushes, 2);
    }

    #[test]
    fn flush_alternates_slots() {
        let (mut s, medium) = store();
        s.flush(&table(1, 0.01)).unwrap();
        s.flush(&table(2, 0.02)).unwrap();
        s.flush(&table(3, 0.03)).unwrap();
        assert_eq!(medium.stats().erases, 3);
        assert_eq!(s.active_slot, Some(0));
    }

    #[test]
    fn identical_flush_is_skipped() {
        let (mut s, medium) = store();
        s.flush(&table(1, 0.05)).unwrap();
        let writes = medium.stats().writes;
        s.flush(&table(1, 0.05)).unwrap();
        assert_eq!(medium.stats().writes, writes);
    }

    #[test]
    fn interrupted_flush_keeps_previous_record() {
        let (mut s, medium) = store();
        s.flush(&table(5, 0.2)).unwrap();

        // enough for the payload, not the header
        medium.fail_after_bytes(100);
        assert!(s.flush(&table(6, -0.2)).is_err());
        assert_eq!(s.health().failures, 1);
        assert!(s.health().last_error.is_some());

        medium.restore_power();
        let mut reloaded = TrimStore::new(medium).unwrap();
        assert_eq!(reloaded.load(), table(5, 0.2));
    }

    #[test]
    fn corrupt_payload_rejected() {
        let (mut s, mut medium) = store();
        s.flush(&table(1, 0.1)).unwrap();
        // clear bits inside the payload
        medium
            .write(TRIM_SLOT_ADDRESSES[0] + RECORD_HEADER_LEN as u32 + 4, &[0x00])
            .unwrap();
        let mut reloaded = TrimStore::new(medium).unwrap();
        assert_eq!(reloaded.load(), TrimTable::new());
    }

    #[test]
    fn misaligned_layout_rejected() {
        assert!(TrimStore::new(MemoryStorage::new(0x2000, 0x3000)).is_err());
        assert!(TrimStore::new(MemoryStorage::new(0x1000, 0x1000)).is_err());
    }

    #[test]
    fn sequence_wraps() {
        assert!(sequence_newer(0, u32::MAX));
        assert!(sequence_newer(5, 4));
        assert!(!sequence_newer(4, 5));
        assert!(!sequence_newer(4, 4));
    }

    fn policy() -> FlushPolicy {
        FlushPolicy::new(StoreConfig::default(), 0)
    }

    #[test]
    fn policy_waits_for_thresholds() {
        let config = StoreConfig::default();
        let mut p = policy();
        assert!(!p.should_flush(0));
        p.note_change(1, 0.001, 100);
        assert!(!p.should_flush(200));
        assert!(p.should_flush(100 + config.max_dirty_ms));
    }

    #[test]
    fn policy_flushes_on_accumulated_delta() {
        let mut p = policy();
        let mut version = 0;
        while !p.should_flush(10) {
            version += 1;
            p.note_change(version, 0.001, 10);
            assert!(version < 1000);
        }
        assert!(version >= 50);
    }

    #[test]
    fn policy_flushes_on_shutdown() {
        let mut p = policy();
        p.request_shutdown();
        assert!(!p.should_flush(0));
        p.note_change(1, 0.0001, 0);
        assert!(p.should_flush(1));
    }

    #[test]
    fn success_clears_dirty() {
        let mut p = policy();
        p.note_change(1, 1.0, 0);
        assert!(p.should_flush(0));
        p.on_submitted(1, 0);
        assert!(!p.should_flush(0));
        p.on_success(1);
        assert!(!p.is_dirty());
        assert_eq!(p.persisted_version(), Some(1));
    }

    #[test]
    fn change_during_flight_stays_pending() {
        let mut p = policy();
        p.note_change(1, 1.0, 0);
        p.on_submitted(1, 0);
        p.note_change(2, 0.001, 5);
        p.on_success(1);
        assert!(p.is_dirty());
        assert_eq!(p.pending_version(), Some(2));
    }

    #[test]
    fn failure_backs_off_exponentially() {
        let config = StoreConfig::default();
        let mut p = policy();
        p.note_change(1, 1.0, 0);

        p.on_submitted(1, 0);
        p.on_failure(1, 0);
        assert_eq!(p.retry_delay_ms(), Some(config.retry_base_ms));
        assert!(!p.should_flush(config.retry_base_ms - 1));
        assert!(p.should_flush(config.retry_base_ms));

        p.on_submitted(1, config.retry_base_ms);
        p.on_failure(1, config.retry_base_ms);
        assert_eq!(p.retry_delay_ms(), Some(2 * config.retry_base_ms));
        assert!(p.is_dirty());

        for _ in 0..20 {
            p.on_submitted(1, 0);
            p.on_failure(1, 0);
        }
        assert_eq!(p.retry_delay_ms(), Some(config.retry_max_ms));
    }
}
