// Directory entries and the lazily materialized directory cache.

use chrono::{Datelike, Local, Timelike};
use fathom_core::{FsError, FsResult};

use crate::codec::{self, Value};
use crate::names;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_LABEL: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LFN: u8 = 0x0F;

pub const DIR_ENTRY_SIZE: usize = 32;
pub const ENTRY_END: u8 = 0x00;
pub const ENTRY_DELETED: u8 = 0xE5;

// 11-byte name, attributes, reserved, 5-byte creation stamp, access
// date, high cluster, mtime, low cluster, size.
const DIR_ENTRY_FMT: &str = "<11sBBBHHHHHHHL";

/// One 32-byte directory record, decoded field for field so re-encoding
/// reproduces the on-disk bytes exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryRecord {
    pub name: [u8; 11],
    pub attributes: u8,
    pub nt_reserved: u8,
    pub creation_time_tenths: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub last_access_date: u16,
    pub first_cluster_high: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub first_cluster_low: u16,
    pub file_size: u32,
    /// Long-filename slots that preceded this record on disk. Their
    /// content is not retained; the count lets deletion account for them.
    pub lfn_count: u32,
}

impl DirEntryRecord {
    pub fn decode(buf: &[u8]) -> FsResult<Self> {
        let v = codec::unpack(DIR_ENTRY_FMT, buf)?;
        let mut name = [0u8; 11];
        name.copy_from_slice(v[0].as_bytes()?);
        Ok(Self {
            name,
            attributes: v[1].as_uint()? as u8,
            nt_reserved: v[2].as_uint()? as u8,
            creation_time_tenths: v[3].as_uint()? as u8,
            creation_time: v[4].as_uint()? as u16,
            creation_date: v[5].as_uint()? as u16,
            last_access_date: v[6].as_uint()? as u16,
            first_cluster_high: v[7].as_uint()? as u16,
            write_time: v[8].as_uint()? as u16,
            write_date: v[9].as_uint()? as u16,
            first_cluster_low: v[10].as_uint()? as u16,
            file_size: v[11].as_uint()? as u32,
            lfn_count: 0,
        })
    }

    pub fn encode(&self) -> FsResult<Vec<u8>> {
        codec::pack(
            DIR_ENTRY_FMT,
            &[
                Value::Bytes(self.name.to_vec()),
                Value::Uint(self.attributes as u64),
                Value::Uint(self.nt_reserved as u64),
                Value::Uint(self.creation_time_tenths as u64),
                Value::Uint(self.creation_time as u64),
                Value::Uint(self.creation_date as u64),
                Value::Uint(self.last_access_date as u64),
                Value::Uint(self.first_cluster_high as u64),
                Value::Uint(self.write_time as u64),
                Value::Uint(self.write_date as u64),
                Value::Uint(self.first_cluster_low as u64),
                Value::Uint(self.file_size as u64),
            ],
        )
    }

    pub fn first_cluster(&self) -> u32 {
        (self.first_cluster_high as u32) << 16 | self.first_cluster_low as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster_low = (cluster & 0xFFFF) as u16;
        self.first_cluster_high = (cluster >> 16) as u16;
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes & ATTR_VOLUME_LABEL != 0
    }

    pub fn is_lfn(&self) -> bool {
        self.attributes == ATTR_LFN
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == ENTRY_DELETED
    }

    pub fn is_dot_entry(&self) -> bool {
        self.name[0] == b'.'
    }

    pub fn normal_name(&self) -> String {
        names::normal_name_of(&self.name)
    }

    /// Fresh file record with wall-clock stamps.
    pub fn new_file(name: [u8; 11], first_cluster: u32, size: u32) -> Self {
        let mut record = Self {
            name,
            attributes: ATTR_ARCHIVE,
            nt_reserved: 0,
            creation_time_tenths: 0,
            creation_time: 0,
            creation_date: 0,
            last_access_date: 0,
            first_cluster_high: 0,
            write_time: 0,
            write_date: 0,
            first_cluster_low: 0,
            file_size: size,
            lfn_count: 0,
        };
        record.set_first_cluster(first_cluster);
        record.stamp_created_now();
        record
    }

    /// Fresh directory record; size stays zero for directories.
    pub fn new_directory(name: [u8; 11], first_cluster: u32) -> Self {
        let mut record = Self::new_file(name, first_cluster, 0);
        record.attributes = ATTR_DIRECTORY;
        record
    }

    fn stamp_created_now(&mut self) {
        let (date, time) = encode_fat_datetime(&Local::now());
        self.creation_date = date;
        self.creation_time = time;
        self.write_date = date;
        self.write_time = time;
        self.last_access_date = date;
    }

    pub fn touch_write_now(&mut self) {
        let (date, time) = encode_fat_datetime(&Local::now());
        self.write_date = date;
        self.write_time = time;
        self.last_access_date = date;
    }
}

/// Pack a wall-clock moment into the FAT date/time fields.
fn encode_fat_datetime(dt: &chrono::DateTime<Local>) -> (u16, u16) {
    let year = dt.year().clamp(1980, 2107) as u16;
    let date = (year - 1980) << 9 | (dt.month() as u16) << 5 | dt.day() as u16;
    let time = (dt.hour() as u16) << 11 | (dt.minute() as u16) << 5 | (dt.second() as u16) / 2;
    (date, time)
}

/// Walk a directory body 32 bytes at a time. A 0x00 name byte ends the
/// directory; LFN slots are tallied into the next real record's
/// `lfn_count`. Deleted entries are skipped unless `include_deleted`.
pub fn parse_dir_entries(data: &[u8], include_deleted: bool) -> FsResult<Vec<DirEntryRecord>> {
    let mut entries = Vec::new();
    let mut pending_lfns = 0u32;
    for raw in data.chunks_exact(DIR_ENTRY_SIZE) {
        if raw[0] == ENTRY_END {
            break;
        }
        if raw[0] == ENTRY_DELETED {
            pending_lfns = 0;
            if include_deleted {
                let mut record = DirEntryRecord::decode(raw)?;
                record.lfn_count = 0;
                entries.push(record);
            }
            continue;
        }
        let mut record = DirEntryRecord::decode(raw)?;
        if record.is_lfn() {
            pending_lfns += 1;
            continue;
        }
        record.lfn_count = pending_lfns;
        pending_lfns = 0;
        entries.push(record);
    }
    Ok(entries)
}

/// Index of a cached directory in the volume's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirId(pub(crate) usize);

impl DirId {
    pub const ROOT: DirId = DirId(0);
}

/// Where a directory's body lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStart {
    /// The FAT12/16 root region: fixed location and size, no chain.
    FixedRoot,
    /// An ordinary cluster chain.
    Cluster(u32),
}

/// A directory's child: either a plain 32-byte record or a nested cached
/// directory (whose own record lives on its node).
#[derive(Debug, Clone)]
pub enum DirChild {
    File(DirEntryRecord),
    Dir(DirId),
}

/// One cached directory. `children` is `None` until materialized.
#[derive(Debug, Clone)]
pub struct DirNode {
    pub start: DirStart,
    /// The record describing this directory in its parent; `None` for
    /// the root.
    pub record: Option<DirEntryRecord>,
    pub parent: Option<DirId>,
    pub children: Option<Vec<DirChild>>,
}

/// Arena of cached directories; ids are indices, the root is id 0. Nodes
/// are never removed, so ids stay valid for the volume's lifetime.
pub struct DirArena {
    nodes: Vec<DirNode>,
}

impl DirArena {
    pub fn new(root_start: DirStart) -> Self {
        Self {
            nodes: vec![DirNode {
                start: root_start,
                record: None,
                parent: None,
                children: None,
            }],
        }
    }

    pub fn insert(&mut self, node: DirNode) -> DirId {
        self.nodes.push(node);
        DirId(self.nodes.len() - 1)
    }

    pub fn node(&self, id: DirId) -> FsResult<&DirNode> {
        self.nodes.get(id.0).ok_or_else(|| {
            FsError::InvalidState(format!("directory id {} outside the arena", id.0))
        })
    }

    pub fn node_mut(&mut self, id: DirId) -> FsResult<&mut DirNode> {
        self.nodes.get_mut(id.0).ok_or_else(|| {
            FsError::InvalidState(format!("directory id {} outside the arena", id.0))
        })
    }
}
