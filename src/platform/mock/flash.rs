//! Mock Flash implementation for testing
//!
//! Provides in-memory Flash simulation for host tests of the parameter store.

use crate::platform::{error::FlashError, traits::FlashInterface, Result};
use alloc::vec;
use alloc::vec::Vec;

/// Flash block size (4 KB)
const BLOCK_SIZE: u32 = 4096;

/// Flash capacity (1 MB is plenty for the parameter region)
const FLASH_CAPACITY: u32 = 1024 * 1024;

/// Protected firmware region (first 256 KB)
const FIRMWARE_SIZE: u32 = 0x40000;

/// Mock Flash implementation
///
/// Simulates NOR Flash in memory. Supports:
/// - Read/write/erase with 1→0 write semantics
/// - Corruption injection
/// - Erase count tracking
/// - Power-loss simulation (next write lands only half its bytes)
/// - Hard write failures
#[derive(Debug)]
pub struct MockFlash {
    storage: Vec<u8>,
    erase_counts: Vec<u32>,
    power_loss: bool,
    fail_writes: bool,
}

impl MockFlash {
    /// Create a new, fully erased mock Flash
    pub fn new() -> Self {
        Self {
            storage: vec![0xFF; FLASH_CAPACITY as usize],
            erase_counts: vec![0; (FLASH_CAPACITY / BLOCK_SIZE) as usize],
            power_loss: false,
            fail_writes: false,
        }
    }

    /// Copy out Flash contents for test verification
    pub fn get_contents(&self, address: u32, len: usize) -> Vec<u8> {
        self.storage[address as usize..(address as usize + len)].to_vec()
    }

    /// Overwrite `len` bytes at `address` with a corrupt pattern
    pub fn inject_corruption(&mut self, address: u32, len: usize) {
        for byte in &mut self.storage[address as usize..address as usize + len] {
            *byte = 0xAA;
        }
    }

    /// Number of times the block containing `address` has been erased
    pub fn get_erase_count(&self, address: u32) -> u32 {
        self.erase_counts[(address / BLOCK_SIZE) as usize]
    }

    /// Total erase count across all blocks
    pub fn get_total_erase_count(&self) -> u32 {
        self.erase_counts.iter().sum()
    }

    /// Make the next write only partially complete
    pub fn simulate_power_loss(&mut self) {
        self.power_loss = true;
    }

    /// Make every write and erase fail until cleared
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    fn is_writable(&self, address: u32) -> bool {
        (FIRMWARE_SIZE..FLASH_CAPACITY).contains(&address)
    }
}

impl Default for MockFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashInterface for MockFlash {
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        if address as usize + buf.len() > FLASH_CAPACITY as usize {
            return Err(FlashError::InvalidAddress.into());
        }

        buf.copy_from_slice(&self.storage[address as usize..address as usize + buf.len()]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if !self.is_writable(address) || address as usize + data.len() > FLASH_CAPACITY as usize {
            return Err(FlashError::InvalidAddress.into());
        }
        if self.fail_writes {
            return Err(FlashError::WriteFailed.into());
        }

        let write_len = if self.power_loss {
            self.power_loss = false;
            data.len() / 2
        } else {
            data.len()
        };

        // NOR Flash can only clear bits
        let start = address as usize;
        for (cell, byte) in self.storage[start..start + write_len].iter_mut().zip(data) {
            *cell &= *byte;
        }

        Ok(())
    }

    fn erase(&mut self, address: u32, size: u32) -> Result<()> {
        if !self.is_writable(address)
            || !address.is_multiple_of(BLOCK_SIZE)
            || !size.is_multiple_of(BLOCK_SIZE)
            || address + size > FLASH_CAPACITY
        {
            return Err(FlashError::InvalidAddress.into());
        }
        if self.fail_writes {
            return Err(FlashError::EraseFailed.into());
        }

        for byte in &mut self.storage[address as usize..(address + size) as usize] {
            *byte = 0xFF;
        }

        let start_block = (address / BLOCK_SIZE) as usize;
        for count in &mut self.erase_counts[start_block..start_block + (size / BLOCK_SIZE) as usize]
        {
            *count += 1;
        }

        Ok(())
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn capacity(&self) -> u32 {
        FLASH_CAPACITY
    }
}
