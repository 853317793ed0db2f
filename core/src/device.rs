// Sector-granular block device abstraction consumed by the drivers

use serde::{Deserialize, Serialize};

use crate::{FsError, FsResult};

/// Whether a device accepts writes. Checked once at mount; a driver never
/// issues `write_sectors` against a `ReadOnly` device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceAccess {
    ReadOnly,
    ReadWrite,
}

/// A block source: fixed-size sectors, addressed from zero.
///
/// `read_sectors` returns exactly `count * sector_size()` bytes or fails;
/// `write_sectors` takes a buffer whose length is a multiple of the sector
/// size. Requests outside `0..num_sectors()` fail with
/// `FsError::CorruptFilesystem`.
pub trait BlockDevice {
    fn sector_size(&self) -> u32;
    fn num_sectors(&self) -> u32;
    fn access(&self) -> DeviceAccess;

    fn read_sectors(&mut self, start: u32, count: u32) -> FsResult<Vec<u8>>;
    fn write_sectors(&mut self, start: u32, data: &[u8]) -> FsResult<()>;

    /// Push buffered writes down to the backing store.
    fn flush(&mut self) -> FsResult<()> {
        Ok(())
    }
}

pub fn check_bounds(start: u32, sectors: u32, num_sectors: u32) -> FsResult<()> {
    let end = start as u64 + sectors as u64;
    if end > num_sectors as u64 {
        return Err(FsError::CorruptFilesystem(format!(
            "sector range {}..{} outside volume of {} sectors",
            start, end, num_sectors
        )));
    }
    Ok(())
}

/// Memory-backed device used by tests and by callers that already hold a
/// full image in memory.
pub struct MemDevice {
    sector_size: u32,
    access: DeviceAccess,
    data: Vec<u8>,
}

impl MemDevice {
    /// A zero-filled read-write device.
    pub fn new(sector_size: u32, num_sectors: u32) -> Self {
        Self {
            sector_size,
            access: DeviceAccess::ReadWrite,
            data: vec![0; sector_size as usize * num_sectors as usize],
        }
    }

    /// Wrap an existing image. The image length must be a whole number of
    /// sectors.
    pub fn from_bytes(sector_size: u32, data: Vec<u8>, access: DeviceAccess) -> FsResult<Self> {
        if sector_size == 0 || data.len() % sector_size as usize != 0 {
            return Err(FsError::InvalidArgument(format!(
                "image of {} bytes is not a multiple of the {}-byte sector size",
                data.len(),
                sector_size
            )));
        }
        Ok(Self {
            sector_size,
            access,
            data,
        })
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn num_sectors(&self) -> u32 {
        (self.data.len() / self.sector_size as usize) as u32
    }

    fn access(&self) -> DeviceAccess {
        self.access
    }

    fn read_sectors(&mut self, start: u32, count: u32) -> FsResult<Vec<u8>> {
        check_bounds(start, count, self.num_sectors())?;
        let from = start as usize * self.sector_size as usize;
        let to = from + count as usize * self.sector_size as usize;
        Ok(self.data[from..to].to_vec())
    }

    fn write_sectors(&mut self, start: u32, data: &[u8]) -> FsResult<()> {
        if self.access == DeviceAccess::ReadOnly {
            return Err(FsError::ReadOnly);
        }
        if data.len() % self.sector_size as usize != 0 {
            return Err(FsError::InvalidArgument(format!(
                "write of {} bytes is not sector-aligned",
                data.len()
            )));
        }
        let sectors = (data.len() / self.sector_size as usize) as u32;
        check_bounds(start, sectors, self.num_sectors())?;
        let from = start as usize * self.sector_size as usize;
        self.data[from..from + data.len()].copy_from_slice(data);
        Ok(())
    }
}
