// Boot sector, FAT32 extension, and FS Information sector decoding

use fathom_core::{FsError, FsResult};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::codec::{self, Value};

/// FAT flavor; decides entry width, EOC range and root directory shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// Lowest value of the eight-value end-of-chain range.
    pub fn eoc_min(self) -> u32 {
        match self {
            FatType::Fat12 => 0xFF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// The end-of-chain sentinel this driver writes.
    pub fn eoc(self) -> u32 {
        match self {
            FatType::Fat12 => 0xFFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    pub fn is_eoc(self, value: u32) -> bool {
        value >= self.eoc_min() && value <= self.eoc()
    }

    pub fn entry_bits(self) -> u32 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        }
    }
}

// DOS 3.31 BIOS Parameter Block, jump instruction skipped.
const BPB_FMT: &str = "<3x8sHBHBHHBHHHLL";
// FAT32 extension at boot-sector offset 0x24.
const FAT32_EXT_FMT: &str = "<LHHLHH12x";
// Extended boot info: offset 0x24 on FAT12/16, 0x40 on FAT32.
const EXT_INFO_FMT: &str = "<BxBL11s8s";
// FS Information sector (FAT32 only).
const FS_INFO_FMT: &str = "<4s480x4sLL12x4s";

pub const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;
pub const FAT32_EXT_OFFSET: usize = 0x24;
pub const FAT16_EXT_INFO_OFFSET: usize = 0x24;
pub const FAT32_EXT_INFO_OFFSET: usize = 0x40;

const FS_INFO_LEAD_SIG: &[u8; 4] = b"RRaA";
const FS_INFO_STRUCT_SIG: &[u8; 4] = b"rrAa";
const FS_INFO_TRAIL_SIG: &[u8; 4] = b"\x00\x00\x55\xaa";

/// The FAT32-only fields at offset 0x24.
#[derive(Debug, Clone)]
pub struct Fat32Extension {
    pub sectors_per_fat_32: u32,
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub backup_boot_sector: u16,
}

/// Extended boot info: drive number, signature, serial, label, type tag.
#[derive(Debug, Clone)]
pub struct ExtendedBootInfo {
    pub drive_number: u8,
    pub ext_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

/// Decoded boot sector.
#[derive(Debug, Clone)]
pub struct BootSector {
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub max_root_entries: u16,
    pub total_sectors_16: u16,
    pub media_descriptor: u8,
    pub sectors_per_fat_16: u16,
    pub sectors_per_track: u16,
    pub head_count: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub fat32: Option<Fat32Extension>,
    pub ext: ExtendedBootInfo,
}

fn bytes_11(value: &Value) -> FsResult<[u8; 11]> {
    let mut out = [0u8; 11];
    out.copy_from_slice(value.as_bytes()?);
    Ok(out)
}

fn bytes_8(value: &Value) -> FsResult<[u8; 8]> {
    let mut out = [0u8; 8];
    out.copy_from_slice(value.as_bytes()?);
    Ok(out)
}

impl BootSector {
    /// Decode sector 0. Non-fatal anomalies (missing 0x55AA signature,
    /// unknown extended signature) are logged and tolerated.
    pub fn parse(sector: &[u8]) -> FsResult<Self> {
        if sector.len() < 512 {
            return Err(FsError::CorruptFilesystem(format!(
                "boot sector of {} bytes is too short",
                sector.len()
            )));
        }
        if sector[BOOT_SIGNATURE_OFFSET] != 0x55 || sector[BOOT_SIGNATURE_OFFSET + 1] != 0xAA {
            warn!("boot sector lacks the 0x55AA signature, continuing");
        }

        let bpb = codec::unpack(BPB_FMT, sector)?;
        let oem_name = bytes_8(&bpb[0])?;
        let bytes_per_sector = bpb[1].as_uint()? as u16;
        let sectors_per_cluster = bpb[2].as_uint()? as u8;
        let reserved_sectors = bpb[3].as_uint()? as u16;
        let fat_count = bpb[4].as_uint()? as u8;
        let max_root_entries = bpb[5].as_uint()? as u16;
        let total_sectors_16 = bpb[6].as_uint()? as u16;
        let media_descriptor = bpb[7].as_uint()? as u8;
        let sectors_per_fat_16 = bpb[8].as_uint()? as u16;
        let sectors_per_track = bpb[9].as_uint()? as u16;
        let head_count = bpb[10].as_uint()? as u16;
        let hidden_sectors = bpb[11].as_uint()? as u32;
        let total_sectors_32 = bpb[12].as_uint()? as u32;

        let (fat32, ext_offset) = if sectors_per_fat_16 == 0 {
            let v = codec::unpack_at(FAT32_EXT_FMT, sector, FAT32_EXT_OFFSET)?.0;
            let ext = Fat32Extension {
                sectors_per_fat_32: v[0].as_uint()? as u32,
                ext_flags: v[1].as_uint()? as u16,
                fs_version: v[2].as_uint()? as u16,
                root_cluster: v[3].as_uint()? as u32,
                fs_info_sector: v[4].as_uint()? as u16,
                backup_boot_sector: v[5].as_uint()? as u16,
            };
            (Some(ext), FAT32_EXT_INFO_OFFSET)
        } else {
            (None, FAT16_EXT_INFO_OFFSET)
        };

        let v = codec::unpack_at(EXT_INFO_FMT, sector, ext_offset)?.0;
        let mut ext = ExtendedBootInfo {
            drive_number: v[0].as_uint()? as u8,
            ext_signature: v[1].as_uint()? as u8,
            volume_id: v[2].as_uint()? as u32,
            volume_label: bytes_11(&v[3])?,
            fs_type: bytes_8(&v[4])?,
        };
        match ext.ext_signature {
            0x29 => {}
            0x28 => {
                // The short 0x28 form carries no label or type fields.
                ext.volume_label = *b"NO NAME    ";
                ext.fs_type = *b"FAT16   ";
            }
            other => {
                warn!(
                    "unknown extended boot signature 0x{:02X}, label and type may be garbage",
                    other
                );
            }
        }

        Ok(Self {
            oem_name,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            max_root_entries,
            total_sectors_16,
            media_descriptor,
            sectors_per_fat_16,
            sectors_per_track,
            head_count,
            hidden_sectors,
            total_sectors_32,
            fat32,
            ext,
        })
    }

    /// The 16-bit count wins when nonzero.
    pub fn total_sectors(&self) -> u32 {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as u32
        } else {
            self.total_sectors_32
        }
    }

    pub fn sectors_per_fat(&self) -> u32 {
        if self.sectors_per_fat_16 != 0 {
            self.sectors_per_fat_16 as u32
        } else {
            self.fat32
                .as_ref()
                .map(|f| f.sectors_per_fat_32)
                .unwrap_or(0)
        }
    }

    /// FAT32 when the 16-bit FAT size field is zero, else FAT16; a caller
    /// may override the provisional FAT16 down to FAT12.
    pub fn resolve_fat_type(&self, requested: Option<FatType>) -> FsResult<FatType> {
        let provisional = if self.fat32.is_some() {
            FatType::Fat32
        } else {
            FatType::Fat16
        };
        match requested {
            None => Ok(provisional),
            Some(t) if t == provisional => Ok(provisional),
            Some(FatType::Fat12) if provisional == FatType::Fat16 => Ok(FatType::Fat12),
            Some(other) => Err(FsError::InvalidArgument(format!(
                "requested {:?} on a volume that reads as {:?}",
                other, provisional
            ))),
        }
    }
}

/// FAT32 free-space hints from the FS Information sector. `0xFFFFFFFF`
/// means unknown.
#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    pub free_cluster_count: u32,
    pub next_free_cluster: u32,
}

impl FsInfo {
    pub const UNKNOWN: u32 = 0xFFFF_FFFF;

    /// A signature mismatch degrades both hints rather than failing.
    pub fn parse(sector: &[u8]) -> FsResult<Self> {
        let v = codec::unpack(FS_INFO_FMT, sector)?;
        let lead = v[0].as_bytes()?;
        let structure = v[1].as_bytes()?;
        let trail = v[4].as_bytes()?;
        if lead != FS_INFO_LEAD_SIG || structure != FS_INFO_STRUCT_SIG || trail != FS_INFO_TRAIL_SIG
        {
            warn!("FS Information sector signatures do not match, ignoring its hints");
            return Ok(Self {
                free_cluster_count: Self::UNKNOWN,
                next_free_cluster: Self::UNKNOWN,
            });
        }
        Ok(Self {
            free_cluster_count: v[2].as_uint()? as u32,
            next_free_cluster: v[3].as_uint()? as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_fat16_sector() -> Vec<u8> {
        let mut s = vec![0u8; 512];
        s[0] = 0xEB;
        s[1] = 0x3C;
        s[2] = 0x90;
        s[3..11].copy_from_slice(b"FATHOM  ");
        s[11..13].copy_from_slice(&512u16.to_le_bytes());
        s[13] = 1; // sectors per cluster
        s[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved
        s[16] = 2; // FATs
        s[17..19].copy_from_slice(&512u16.to_le_bytes()); // root entries
        s[19..21].copy_from_slice(&20480u16.to_le_bytes()); // total sectors
        s[21] = 0xF8;
        s[22..24].copy_from_slice(&16u16.to_le_bytes()); // sectors per FAT
        s[0x26] = 0x29;
        s[0x27..0x2B].copy_from_slice(&0xCAFE1234u32.to_le_bytes());
        s[0x2B..0x36].copy_from_slice(b"TESTVOLUME ");
        s[0x36..0x3E].copy_from_slice(b"FAT16   ");
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    #[test]
    fn parses_fat16_boot_sector() {
        let boot = BootSector::parse(&minimal_fat16_sector()).unwrap();
        assert_eq!(boot.bytes_per_sector, 512);
        assert_eq!(boot.fat_count, 2);
        assert_eq!(boot.max_root_entries, 512);
        assert_eq!(boot.sectors_per_fat(), 16);
        assert_eq!(boot.total_sectors(), 20480);
        assert!(boot.fat32.is_none());
        assert_eq!(&boot.ext.volume_label, b"TESTVOLUME ");
        assert_eq!(boot.ext.volume_id, 0xCAFE1234);
    }

    #[test]
    fn short_extended_signature_synthesizes_label() {
        let mut sector = minimal_fat16_sector();
        sector[0x26] = 0x28;
        let boot = BootSector::parse(&sector).unwrap();
        assert_eq!(&boot.ext.volume_label, b"NO NAME    ");
        assert_eq!(&boot.ext.fs_type, b"FAT16   ");
    }

    #[test]
    fn fat12_override_only_applies_to_fat16_volumes() {
        let boot = BootSector::parse(&minimal_fat16_sector()).unwrap();
        assert_eq!(
            boot.resolve_fat_type(Some(FatType::Fat12)).unwrap(),
            FatType::Fat12
        );
        assert!(boot.resolve_fat_type(Some(FatType::Fat32)).is_err());
        assert_eq!(boot.resolve_fat_type(None).unwrap(), FatType::Fat16);
    }

    #[test]
    fn bad_fs_info_degrades_hints() {
        let sector = vec![0u8; 512];
        let info = FsInfo::parse(&sector).unwrap();
        assert_eq!(info.free_cluster_count, FsInfo::UNKNOWN);
        assert_eq!(info.next_free_cluster, FsInfo::UNKNOWN);
    }

    #[test]
    fn good_fs_info_reads_hints() {
        let mut sector = vec![0u8; 512];
        sector[0..4].copy_from_slice(b"RRaA");
        sector[484..488].copy_from_slice(b"rrAa");
        sector[488..492].copy_from_slice(&1234u32.to_le_bytes());
        sector[492..496].copy_from_slice(&5u32.to_le_bytes());
        sector[508..512].copy_from_slice(b"\x00\x00\x55\xaa");
        let info = FsInfo::parse(&sector).unwrap();
        assert_eq!(info.free_cluster_count, 1234);
        assert_eq!(info.next_free_cluster, 5);
    }
}
