//! Persistent Parameter Storage
//!
//! [`PersistentStore`] is the durable key/value interface the registry mirrors
//! every parameter into. Two implementations:
//!
//! - [`MemoryStore`] - RAM only, for host tests and devices without flash
//! - [`FlashStore`] - write-through flash persistence with CRC validation and
//!   rotation over redundant blocks
//!
//! # Flash Block Format
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ Magic: [u8; 4] = b"FLKV"                      │  Offset: 0
//! ├───────────────────────────────────────────────┤
//! │ Version: u32 = 1                              │  Offset: 4
//! ├───────────────────────────────────────────────┤
//! │ Sequence: u32 (higher is newer)               │  Offset: 8
//! ├───────────────────────────────────────────────┤
//! │ Entry Count: u32                              │  Offset: 12
//! ├───────────────────────────────────────────────┤
//! │ Entries: [(name, type, value)]                │  Offset: 16
//! │   name: [u8; 32] (null-padded)               │
//! │   type: u8 (0=String, 1=Bool, 2=Int,          │
//! │             3=Float, 4=Double)                │
//! │   value: Variable size based on type          │
//! ├───────────────────────────────────────────────┤
//! │ CRC32: u32                                    │  Offset: block_size - 4
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Each save writes the whole table to the block after the current one. A save
//! interrupted by power loss leaves a block with a bad CRC, and the next
//! [`FlashStore::open`] falls back to the previous generation.

use super::value::{ParamKind, ParamString, ParamValue};
use crate::platform::{FlashInterface, PlatformError};
use crate::{log_info, log_warn};
use core::fmt;
use heapless::index_map::FnvIndexMap;
use heapless::String;

/// Maximum parameter name length
pub const PARAM_NAME_LEN: usize = 32;

/// Maximum number of parameters
pub const MAX_PARAMS: usize = 32;

/// Parameter name / store key
pub type ParamName = String<PARAM_NAME_LEN>;

/// Parameter block base address (Flash offset)
const PARAM_BLOCK_BASE: u32 = 0x040000;

/// Parameter block size (4 KB per block)
const PARAM_BLOCK_SIZE: usize = 4096;

/// Number of rotating parameter blocks
const PARAM_BLOCK_COUNT: u32 = 4;

/// Magic number for parameter blocks
const PARAM_MAGIC: [u8; 4] = *b"FLKV";

/// Parameter format version
const PARAM_VERSION: u32 = 1;

const HEADER_LEN: usize = 16;
const CRC_LEN: usize = 4;

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Persistent store errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    /// Underlying flash operation failed
    Platform(PlatformError),
    /// No room for another key, or the table no longer fits a block
    Full,
    /// Key longer than [`PARAM_NAME_LEN`]
    KeyTooLong,
    /// Store refused the write
    WriteRejected,
}

impl From<PlatformError> for StoreError {
    fn from(error: PlatformError) -> Self {
        StoreError::Platform(error)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Platform(e) => write!(f, "{}", e),
            StoreError::Full => write!(f, "store full"),
            StoreError::KeyTooLong => write!(f, "key too long"),
            StoreError::WriteRejected => write!(f, "write rejected"),
        }
    }
}

/// Durable key/value storage for parameter values
///
/// One key per parameter name; the stored value carries its own type tag.
pub trait PersistentStore {
    /// Load the value stored under `key`
    fn load(&self, key: &str) -> Option<ParamValue>;

    /// Store `value` under `key`
    ///
    /// Must be all-or-nothing: on error the previous value stays in place.
    fn save(&mut self, key: &str, value: &ParamValue) -> Result<(), StoreError>;

    /// Drop every key for which `keep` returns false
    ///
    /// Returns how many keys were removed. All-or-nothing like `save`.
    fn retain(&mut self, keep: &dyn Fn(&str) -> bool) -> Result<usize, StoreError>;

    /// Whether anything is stored under `key`
    fn contains(&self, key: &str) -> bool {
        self.load(key).is_some()
    }
}

fn retained(
    entries: &FnvIndexMap<ParamName, ParamValue, MAX_PARAMS>,
    keep: &dyn Fn(&str) -> bool,
) -> FnvIndexMap<ParamName, ParamValue, MAX_PARAMS> {
    let mut next = FnvIndexMap::new();
    for (name, value) in entries.iter().filter(|(name, _)| keep(name.as_str())) {
        // Cannot overflow: a subset of a map with the same capacity
        let _ = next.insert(name.clone(), value.clone());
    }
    next
}

fn key_of(name: &str) -> Result<ParamName, StoreError> {
    ParamName::try_from(name).map_err(|_| StoreError::KeyTooLong)
}

/// RAM-only store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: FnvIndexMap<ParamName, ParamValue, MAX_PARAMS>,
    writes: u32,
    #[cfg(any(test, feature = "mock"))]
    fail_saves: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves
    pub fn write_count(&self) -> u32 {
        self.writes
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Make every save fail until cleared
    #[cfg(any(test, feature = "mock"))]
    pub fn set_fail_saves(&mut self, fail: bool) {
        self.fail_saves = fail;
    }
}

impl PersistentStore for MemoryStore {
    fn load(&self, key: &str) -> Option<ParamValue> {
        let key = key_of(key).ok()?;
        self.entries.get(&key).cloned()
    }

    fn save(&mut self, key: &str, value: &ParamValue) -> Result<(), StoreError> {
        #[cfg(any(test, feature = "mock"))]
        if self.fail_saves {
            return Err(StoreError::WriteRejected);
        }

        self.entries
            .insert(key_of(key)?, value.clone())
            .map_err(|_| StoreError::Full)?;
        self.writes = self.writes.saturating_add(1);
        Ok(())
    }

    fn retain(&mut self, keep: &dyn Fn(&str) -> bool) -> Result<usize, StoreError> {
        #[cfg(any(test, feature = "mock"))]
        if self.fail_saves {
            return Err(StoreError::WriteRejected);
        }

        let next = retained(&self.entries, keep);
        let removed = self.entries.len() - next.len();
        self.entries = next;
        Ok(removed)
    }
}

/// Flash-backed store with write-through saves
pub struct FlashStore<F: FlashInterface> {
    flash: F,
    entries: FnvIndexMap<ParamName, ParamValue, MAX_PARAMS>,
    sequence: u32,
    active_block: Option<u32>,
}

impl<F: FlashInterface> FlashStore<F> {
    /// Open the store, loading the newest valid parameter block
    ///
    /// Starts empty when no valid block exists (fresh or fully corrupted flash).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Platform` if flash cannot be read at all.
    pub fn open(mut flash: F) -> Result<Self, StoreError> {
        let mut newest: Option<(u32, u32, FnvIndexMap<ParamName, ParamValue, MAX_PARAMS>)> = None;

        for block_id in 0..PARAM_BLOCK_COUNT {
            let mut buf = [0u8; PARAM_BLOCK_SIZE];
            flash.read(block_address(block_id), &mut buf)?;

            let Some((sequence, entries)) = decode_block(&buf) else {
                continue;
            };
            if newest.as_ref().is_none_or(|(seq, _, _)| sequence > *seq) {
                newest = Some((sequence, block_id, entries));
            }
        }

        match newest {
            Some((sequence, block_id, entries)) => {
                log_info!(
                    "Loaded {} parameters from block {} (seq {})",
                    entries.len(),
                    block_id,
                    sequence
                );
                Ok(Self {
                    flash,
                    entries,
                    sequence,
                    active_block: Some(block_id),
                })
            }
            None => {
                log_warn!("No valid parameter blocks found, starting empty");
                Ok(Self {
                    flash,
                    entries: FnvIndexMap::new(),
                    sequence: 0,
                    active_block: None,
                })
            }
        }
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Generation counter of the last committed block
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Release the flash device (e.g. to reopen it after a simulated reboot)
    pub fn into_flash(self) -> F {
        self.flash
    }

    fn write_block(
        &mut self,
        block_id: u32,
        sequence: u32,
        entries: &FnvIndexMap<ParamName, ParamValue, MAX_PARAMS>,
    ) -> Result<(), StoreError> {
        let mut buf = [0xFFu8; PARAM_BLOCK_SIZE];
        encode_block(&mut buf, sequence, entries)?;

        let address = block_address(block_id);
        self.flash.erase(address, PARAM_BLOCK_SIZE as u32)?;
        self.flash.write(address, &buf)?;
        Ok(())
    }
}

impl<F: FlashInterface> PersistentStore for FlashStore<F> {
    fn load(&self, key: &str) -> Option<ParamValue> {
        let key = key_of(key).ok()?;
        self.entries.get(&key).cloned()
    }

    fn save(&mut self, key: &str, value: &ParamValue) -> Result<(), StoreError> {
        let key = key_of(key)?;
        if self.entries.get(&key) == Some(value) {
            return Ok(());
        }

        let mut next = self.entries.clone();
        next.insert(key, value.clone()).map_err(|_| StoreError::Full)?;
        self.commit(next)
    }

    fn retain(&mut self, keep: &dyn Fn(&str) -> bool) -> Result<usize, StoreError> {
        let next = retained(&self.entries, keep);
        let removed = self.entries.len() - next.len();
        if removed > 0 {
            self.commit(next)?;
            log_info!("Dropped {} stale parameters from flash", removed);
        }
        Ok(removed)
    }
}

impl<F: FlashInterface> FlashStore<F> {
    /// Write `next` as the newest generation, then adopt it
    fn commit(
        &mut self,
        next: FnvIndexMap<ParamName, ParamValue, MAX_PARAMS>,
    ) -> Result<(), StoreError> {
        let block_id = match self.active_block {
            Some(active) => (active + 1) % PARAM_BLOCK_COUNT,
            None => 0,
        };
        let sequence = self.sequence.wrapping_add(1);
        self.write_block(block_id, sequence, &next)?;

        self.entries = next;
        self.sequence = sequence;
        self.active_block = Some(block_id);
        Ok(())
    }
}

fn block_address(block_id: u32) -> u32 {
    PARAM_BLOCK_BASE + block_id * PARAM_BLOCK_SIZE as u32
}

fn encode_block(
    buf: &mut [u8; PARAM_BLOCK_SIZE],
    sequence: u32,
    entries: &FnvIndexMap<ParamName, ParamValue, MAX_PARAMS>,
) -> Result<(), StoreError> {
    buf[0..4].copy_from_slice(&PARAM_MAGIC);
    buf[4..8].copy_from_slice(&PARAM_VERSION.to_le_bytes());
    buf[8..12].copy_from_slice(&sequence.to_le_bytes());
    buf[12..16].copy_from_slice(&(entries.len() as u32).to_le_bytes());

    let limit = PARAM_BLOCK_SIZE - CRC_LEN;
    let mut offset = HEADER_LEN;

    for (name, value) in entries {
        let mut value_buf = [0u8; 1 + super::value::MAX_STRING_LEN];
        let value_len = encode_value(value, &mut value_buf);

        if offset + PARAM_NAME_LEN + 1 + value_len > limit {
            return Err(StoreError::Full);
        }

        buf[offset..offset + PARAM_NAME_LEN].fill(0);
        buf[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        offset += PARAM_NAME_LEN;

        buf[offset] = value.kind().type_id();
        offset += 1;

        buf[offset..offset + value_len].copy_from_slice(&value_buf[..value_len]);
        offset += value_len;
    }

    let crc = CRC.checksum(&buf[..limit]);
    buf[limit..].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

fn encode_value(value: &ParamValue, out: &mut [u8]) -> usize {
    match value {
        ParamValue::Str(s) => {
            out[0] = s.len() as u8;
            out[1..1 + s.len()].copy_from_slice(s.as_bytes());
            1 + s.len()
        }
        ParamValue::Bool(b) => {
            out[0] = u8::from(*b);
            1
        }
        ParamValue::Int(i) => {
            out[..4].copy_from_slice(&i.to_le_bytes());
            4
        }
        ParamValue::Float(f) => {
            out[..4].copy_from_slice(&f.to_le_bytes());
            4
        }
        ParamValue::Double(d) => {
            out[..8].copy_from_slice(&d.to_le_bytes());
            8
        }
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn take<'a>(buf: &'a [u8], offset: &mut usize, len: usize) -> Option<&'a [u8]> {
    let bytes = buf.get(*offset..*offset + len)?;
    *offset += len;
    Some(bytes)
}

fn decode_value(kind: ParamKind, buf: &[u8], offset: &mut usize) -> Option<ParamValue> {
    let value = match kind {
        ParamKind::Str => {
            let len = take(buf, offset, 1)?[0] as usize;
            let text = core::str::from_utf8(take(buf, offset, len)?).ok()?;
            ParamValue::Str(ParamString::try_from(text).ok()?)
        }
        ParamKind::Bool => ParamValue::Bool(take(buf, offset, 1)?[0] != 0),
        ParamKind::Int => ParamValue::Int(i32::from_le_bytes(take(buf, offset, 4)?.try_into().ok()?)),
        ParamKind::Float => {
            ParamValue::Float(f32::from_le_bytes(take(buf, offset, 4)?.try_into().ok()?))
        }
        ParamKind::Double => {
            ParamValue::Double(f64::from_le_bytes(take(buf, offset, 8)?.try_into().ok()?))
        }
    };
    Some(value)
}

/// Validate and parse one block; `None` if it is blank, foreign or corrupt
fn decode_block(
    buf: &[u8; PARAM_BLOCK_SIZE],
) -> Option<(u32, FnvIndexMap<ParamName, ParamValue, MAX_PARAMS>)> {
    if buf[0..4] != PARAM_MAGIC || read_u32(buf, 4) != PARAM_VERSION {
        return None;
    }

    let limit = PARAM_BLOCK_SIZE - CRC_LEN;
    if read_u32(buf, limit) != CRC.checksum(&buf[..limit]) {
        return None;
    }

    let sequence = read_u32(buf, 8);
    let count = read_u32(buf, 12) as usize;
    if count > MAX_PARAMS {
        return None;
    }

    let body = &buf[..limit];
    let mut entries = FnvIndexMap::new();
    let mut offset = HEADER_LEN;

    for _ in 0..count {
        let name_bytes = take(body, &mut offset, PARAM_NAME_LEN)?;
        let name_len = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PARAM_NAME_LEN);
        let name = ParamName::try_from(core::str::from_utf8(&name_bytes[..name_len]).ok()?).ok()?;

        let kind = ParamKind::from_type_id(take(body, &mut offset, 1)?[0])?;
        let value = decode_value(kind, body, &mut offset)?;
        entries.insert(name, value).ok()?;
    }

    Some((sequence, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockFlash;

    fn text(s: &str) -> ParamValue {
        ParamValue::Str(ParamString::try_from(s).unwrap())
    }

    #[test]
    fn test_memory_store_save_load() {
        let mut store = MemoryStore::new();
        assert!(!store.contains("threshold"));

        store.save("threshold", &ParamValue::Int(42)).unwrap();
        assert_eq!(store.load("threshold"), Some(ParamValue::Int(42)));
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_memory_store_rejects_long_key() {
        let mut store = MemoryStore::new();
        let long = "k".repeat(PARAM_NAME_LEN + 1);
        assert_eq!(
            store.save(&long, &ParamValue::Bool(true)),
            Err(StoreError::KeyTooLong)
        );
    }

    #[test]
    fn test_memory_store_fail_saves_keeps_old_value() {
        let mut store = MemoryStore::new();
        store.save("a", &ParamValue::Int(1)).unwrap();
        store.set_fail_saves(true);

        assert_eq!(store.save("a", &ParamValue::Int(2)), Err(StoreError::WriteRejected));
        assert_eq!(store.load("a"), Some(ParamValue::Int(1)));
    }

    #[test]
    fn test_memory_store_full() {
        let mut store = MemoryStore::new();
        for i in 0..MAX_PARAMS {
            store.save(&std::format!("p{}", i), &ParamValue::Int(0)).unwrap();
        }
        assert_eq!(store.save("extra", &ParamValue::Int(0)), Err(StoreError::Full));
    }

    #[test]
    fn test_flash_store_empty_flash() {
        let store = FlashStore::open(MockFlash::new()).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.sequence(), 0);
    }

    #[test]
    fn test_flash_store_persists_all_kinds_across_reopen() {
        let mut store = FlashStore::open(MockFlash::new()).unwrap();
        store.save("count", &ParamValue::Int(-12)).unwrap();
        store.save("gain", &ParamValue::Float(0.25)).unwrap();
        store.save("ratio", &ParamValue::Double(1.0e-9)).unwrap();
        store.save("enabled", &ParamValue::Bool(true)).unwrap();
        store.save("label", &text("tank 3")).unwrap();

        let store = FlashStore::open(store.into_flash()).unwrap();
        assert_eq!(store.len(), 5);
        assert_eq!(store.load("count"), Some(ParamValue::Int(-12)));
        assert_eq!(store.load("gain"), Some(ParamValue::Float(0.25)));
        assert_eq!(store.load("ratio"), Some(ParamValue::Double(1.0e-9)));
        assert_eq!(store.load("enabled"), Some(ParamValue::Bool(true)));
        assert_eq!(store.load("label"), Some(text("tank 3")));
    }

    #[test]
    fn test_flash_store_rotates_blocks() {
        let mut store = FlashStore::open(MockFlash::new()).unwrap();
        for i in 0..5 {
            store.save("count", &ParamValue::Int(i)).unwrap();
        }

        assert_eq!(store.sequence(), 5);
        // Five saves over four blocks: block 0 written twice
        assert_eq!(store.flash().get_erase_count(block_address(0)), 2);
        assert_eq!(store.flash().get_erase_count(block_address(3)), 1);

        let store = FlashStore::open(store.into_flash()).unwrap();
        assert_eq!(store.load("count"), Some(ParamValue::Int(4)));
    }

    #[test]
    fn test_flash_store_skips_unchanged_value() {
        let mut store = FlashStore::open(MockFlash::new()).unwrap();
        store.save("count", &ParamValue::Int(1)).unwrap();
        store.save("count", &ParamValue::Int(1)).unwrap();
        assert_eq!(store.sequence(), 1);
    }

    #[test]
    fn test_flash_store_power_loss_keeps_previous_generation() {
        let mut store = FlashStore::open(MockFlash::new()).unwrap();
        store.save("count", &ParamValue::Int(1)).unwrap();

        store.flash_mut().simulate_power_loss();
        // The torn write is not detected until the block is read back
        store.save("count", &ParamValue::Int(2)).unwrap();

        let store = FlashStore::open(store.into_flash()).unwrap();
        assert_eq!(store.load("count"), Some(ParamValue::Int(1)));
    }

    #[test]
    fn test_flash_store_corrupted_block_ignored() {
        let mut store = FlashStore::open(MockFlash::new()).unwrap();
        store.save("count", &ParamValue::Int(1)).unwrap();
        store.save("count", &ParamValue::Int(2)).unwrap();

        let mut flash = store.into_flash();
        flash.inject_corruption(block_address(1) + 20, 8);

        let store = FlashStore::open(flash).unwrap();
        assert_eq!(store.load("count"), Some(ParamValue::Int(1)));
    }

    #[test]
    fn test_flash_store_write_failure_leaves_state() {
        let mut store = FlashStore::open(MockFlash::new()).unwrap();
        store.save("count", &ParamValue::Int(1)).unwrap();
        store.flash_mut().set_fail_writes(true);

        let result = store.save("count", &ParamValue::Int(2));
        assert!(matches!(result, Err(StoreError::Platform(_))));
        assert_eq!(store.load("count"), Some(ParamValue::Int(1)));
        assert_eq!(store.sequence(), 1);
    }

    #[test]
    fn test_flash_store_retain_survives_reopen() {
        let mut store = FlashStore::open(MockFlash::new()).unwrap();
        store.save("old_gain", &ParamValue::Float(1.0)).unwrap();
        store.save("count", &ParamValue::Int(3)).unwrap();
        let sequence = store.sequence();

        assert_eq!(store.retain(&|key| key == "count"), Ok(1));
        assert_eq!(store.sequence(), sequence + 1);
        assert_eq!(store.retain(&|key| key == "count"), Ok(0));
        assert_eq!(store.sequence(), sequence + 1);

        let store = FlashStore::open(store.into_flash()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(!store.contains("old_gain"));
        assert_eq!(store.load("count"), Some(ParamValue::Int(3)));
    }

    #[test]
    fn test_memory_store_retain() {
        let mut store = MemoryStore::new();
        store.save("a", &ParamValue::Int(1)).unwrap();
        store.save("b", &ParamValue::Int(2)).unwrap();

        assert_eq!(store.retain(&|key| key != "a"), Ok(1));
        assert_eq!(store.len(), 1);
        assert!(store.contains("b"));
    }

    #[test]
    fn test_flash_store_full_after_max_params() {
        let mut store = FlashStore::open(MockFlash::new()).unwrap();
        let long = "s".repeat(super::super::value::MAX_STRING_LEN);
        let mut result = Ok(());
        for i in 0..=MAX_PARAMS {
            result = store.save(&std::format!("name_padding_to_full_len_{:02}", i), &text(&long));
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(StoreError::Full));
    }
}
