// Composable block-device adapters: image files, MBR partition windows,
// request chunking, and a copy-on-write overlay for dry-run writes.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use fathom_core::device::check_bounds;
use fathom_core::{BlockDevice, DeviceAccess, FsError, FsResult};
use log::{debug, info};

pub const MBR_PARTITION_TABLE_OFFSET: usize = 0x01BE;
pub const MBR_PARTITION_ENTRY_SIZE: usize = 0x10;

/// A filesystem image in a regular file, exposed with a declared sector
/// size.
pub struct FileDevice {
    file: File,
    sector_size: u32,
    num_sectors: u32,
    access: DeviceAccess,
}

impl FileDevice {
    pub fn new(file: File, sector_size: u32, access: DeviceAccess) -> FsResult<Self> {
        let len = file.metadata()?.len();
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(FsError::InvalidArgument(format!(
                "sector size {} is not a power of two",
                sector_size
            )));
        }
        let num_sectors = (len / sector_size as u64) as u32;
        info!(
            "image device: {} bytes, {} sectors of {}",
            len, num_sectors, sector_size
        );
        Ok(Self {
            file,
            sector_size,
            num_sectors,
            access,
        })
    }
}

impl BlockDevice for FileDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    fn access(&self) -> DeviceAccess {
        self.access
    }

    fn read_sectors(&mut self, start: u32, count: u32) -> FsResult<Vec<u8>> {
        check_bounds(start, count, self.num_sectors)?;
        self.file
            .seek(SeekFrom::Start(start as u64 * self.sector_size as u64))?;
        let mut buf = vec![0u8; count as usize * self.sector_size as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_sectors(&mut self, start: u32, data: &[u8]) -> FsResult<()> {
        if self.access == DeviceAccess::ReadOnly {
            return Err(FsError::ReadOnly);
        }
        let sectors = (data.len() / self.sector_size as usize) as u32;
        check_bounds(start, sectors, self.num_sectors)?;
        self.file
            .seek(SeekFrom::Start(start as u64 * self.sector_size as u64))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> FsResult<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// A window over an inner device, shifted by a partition's start sector.
pub struct PartitionDevice<D: BlockDevice> {
    inner: D,
    start: u32,
    len: u32,
}

impl<D: BlockDevice> PartitionDevice<D> {
    pub fn new(inner: D, start: u32, len: u32) -> FsResult<Self> {
        check_bounds(start, len, inner.num_sectors())?;
        Ok(Self { inner, start, len })
    }

    /// Window onto MBR partition `index` (0..=3). The entry's 4-byte
    /// start LBA and sector count live at `0x1BE + 0x10 * index`.
    pub fn from_mbr(mut inner: D, index: usize) -> FsResult<Self> {
        if index > 3 {
            return Err(FsError::InvalidArgument(format!(
                "MBR holds four partitions, asked for {}",
                index
            )));
        }
        let sector0 = inner.read_sectors(0, 1)?;
        if sector0.len() < 512 || sector0[510] != 0x55 || sector0[511] != 0xAA {
            return Err(FsError::InvalidArgument(
                "sector 0 carries no MBR signature".to_string(),
            ));
        }
        let base = MBR_PARTITION_TABLE_OFFSET + MBR_PARTITION_ENTRY_SIZE * index;
        let entry = &sector0[base..base + MBR_PARTITION_ENTRY_SIZE];
        let partition_type = entry[4];
        let start = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]);
        let len = u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]);
        if partition_type == 0 || len == 0 {
            return Err(FsError::InvalidArgument(format!(
                "MBR partition {} is empty",
                index
            )));
        }
        debug!(
            "partition {}: type 0x{:02X}, {} sectors at {}",
            index, partition_type, len, start
        );
        Self::new(inner, start, len)
    }
}

impl<D: BlockDevice> BlockDevice for PartitionDevice<D> {
    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn num_sectors(&self) -> u32 {
        self.len
    }

    fn access(&self) -> DeviceAccess {
        self.inner.access()
    }

    fn read_sectors(&mut self, start: u32, count: u32) -> FsResult<Vec<u8>> {
        check_bounds(start, count, self.len)?;
        self.inner.read_sectors(self.start + start, count)
    }

    fn write_sectors(&mut self, start: u32, data: &[u8]) -> FsResult<()> {
        let sectors = (data.len() / self.sector_size() as usize) as u32;
        check_bounds(start, sectors, self.len)?;
        self.inner.write_sectors(self.start + start, data)
    }

    fn flush(&mut self) -> FsResult<()> {
        self.inner.flush()
    }
}

/// Splits oversized requests into bounded bursts for backends with a
/// transfer-size ceiling.
pub struct ChunkingDevice<D: BlockDevice> {
    inner: D,
    max_sectors: u32,
}

impl<D: BlockDevice> ChunkingDevice<D> {
    pub fn new(inner: D, max_sectors: u32) -> FsResult<Self> {
        if max_sectors == 0 {
            return Err(FsError::InvalidArgument(
                "chunk size of zero sectors".to_string(),
            ));
        }
        Ok(Self { inner, max_sectors })
    }
}

impl<D: BlockDevice> BlockDevice for ChunkingDevice<D> {
    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn num_sectors(&self) -> u32 {
        self.inner.num_sectors()
    }

    fn access(&self) -> DeviceAccess {
        self.inner.access()
    }

    fn read_sectors(&mut self, start: u32, count: u32) -> FsResult<Vec<u8>> {
        let mut out = Vec::with_capacity(count as usize * self.sector_size() as usize);
        let mut done = 0;
        while done < count {
            let burst = (count - done).min(self.max_sectors);
            out.extend_from_slice(&self.inner.read_sectors(start + done, burst)?);
            done += burst;
        }
        Ok(out)
    }

    fn write_sectors(&mut self, start: u32, data: &[u8]) -> FsResult<()> {
        let sector_size = self.sector_size() as usize;
        let count = (data.len() / sector_size) as u32;
        let mut done = 0;
        while done < count {
            let burst = (count - done).min(self.max_sectors);
            let from = done as usize * sector_size;
            let to = from + burst as usize * sector_size;
            self.inner.write_sectors(start + done, &data[from..to])?;
            done += burst;
        }
        Ok(())
    }

    fn flush(&mut self) -> FsResult<()> {
        self.inner.flush()
    }
}

/// Copy-on-write overlay: writes land in per-sector deltas, reads apply
/// them atop the base. Nothing is ever written through, which makes any
/// base usable for dry-run mutation.
pub struct OverlayDevice<D: BlockDevice> {
    base: D,
    deltas: HashMap<u32, Vec<u8>>,
}

impl<D: BlockDevice> OverlayDevice<D> {
    pub fn new(base: D) -> Self {
        Self {
            base,
            deltas: HashMap::new(),
        }
    }

    /// Sectors diverging from the base.
    pub fn delta_sectors(&self) -> usize {
        self.deltas.len()
    }

    pub fn into_base(self) -> D {
        self.base
    }
}

impl<D: BlockDevice> BlockDevice for OverlayDevice<D> {
    fn sector_size(&self) -> u32 {
        self.base.sector_size()
    }

    fn num_sectors(&self) -> u32 {
        self.base.num_sectors()
    }

    fn access(&self) -> DeviceAccess {
        DeviceAccess::ReadWrite
    }

    fn read_sectors(&mut self, start: u32, count: u32) -> FsResult<Vec<u8>> {
        let sector_size = self.sector_size() as usize;
        let mut data = self.base.read_sectors(start, count)?;
        for i in 0..count {
            if let Some(delta) = self.deltas.get(&(start + i)) {
                let from = i as usize * sector_size;
                data[from..from + sector_size].copy_from_slice(delta);
            }
        }
        Ok(data)
    }

    fn write_sectors(&mut self, start: u32, data: &[u8]) -> FsResult<()> {
        let sector_size = self.sector_size() as usize;
        let sectors = (data.len() / sector_size) as u32;
        check_bounds(start, sectors, self.num_sectors())?;
        for i in 0..sectors {
            let from = i as usize * sector_size;
            self.deltas
                .insert(start + i, data[from..from + sector_size].to_vec());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_core::MemDevice;

    fn mbr_image(start: u32, len: u32) -> MemDevice {
        let mut dev = MemDevice::new(512, start + len);
        let mut sector0 = vec![0u8; 512];
        let base = MBR_PARTITION_TABLE_OFFSET;
        sector0[base + 4] = 0x06; // FAT16
        sector0[base + 8..base + 12].copy_from_slice(&start.to_le_bytes());
        sector0[base + 12..base + 16].copy_from_slice(&len.to_le_bytes());
        sector0[510] = 0x55;
        sector0[511] = 0xAA;
        dev.write_sectors(0, &sector0).unwrap();
        dev
    }

    #[test]
    fn partition_window_shifts_addresses() {
        let mut base = mbr_image(4, 8);
        base.write_sectors(4, &[0xEE; 512]).unwrap();
        let mut part = PartitionDevice::from_mbr(base, 0).unwrap();
        assert_eq!(part.num_sectors(), 8);
        assert_eq!(part.read_sectors(0, 1).unwrap(), vec![0xEE; 512]);
        assert!(part.read_sectors(8, 1).is_err());
    }

    #[test]
    fn empty_partition_slot_is_rejected() {
        let base = mbr_image(4, 8);
        assert!(matches!(
            PartitionDevice::from_mbr(base, 1),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn chunking_preserves_data() {
        let mut inner = MemDevice::new(512, 16);
        let payload: Vec<u8> = (0..512 * 7).map(|i| i as u8).collect();
        inner.write_sectors(3, &payload).unwrap();
        let mut chunked = ChunkingDevice::new(inner, 2).unwrap();
        assert_eq!(chunked.read_sectors(3, 7).unwrap(), payload);
        chunked.write_sectors(9, &payload[..512 * 3]).unwrap();
        assert_eq!(chunked.read_sectors(9, 3).unwrap(), &payload[..512 * 3]);
    }

    #[test]
    fn overlay_keeps_the_base_pristine() {
        let base = MemDevice::new(512, 4);
        let mut overlay = OverlayDevice::new(base);
        overlay.write_sectors(1, &[0x42; 512]).unwrap();
        assert_eq!(overlay.read_sectors(1, 1).unwrap(), vec![0x42; 512]);
        assert_eq!(overlay.delta_sectors(), 1);
        let base = overlay.into_base();
        assert_eq!(base.as_bytes()[512..1024], vec![0u8; 512][..]);
    }

    #[test]
    fn overlay_merges_deltas_into_multi_sector_reads() {
        let mut base = MemDevice::new(512, 4);
        base.write_sectors(0, &[1u8; 2048]).unwrap();
        let mut overlay = OverlayDevice::new(base);
        overlay.write_sectors(2, &[9; 512]).unwrap();
        let all = overlay.read_sectors(0, 4).unwrap();
        assert_eq!(&all[..1024], &[1u8; 1024][..]);
        assert_eq!(&all[1024..1536], &[9u8; 512][..]);
        assert_eq!(&all[1536..], &[1u8; 512][..]);
    }
}
