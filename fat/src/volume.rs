// Mounted FAT volume: geometry, the shared FAT buffer, the directory
// cache, the allocator, and the two-phase flush.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use fathom_core::{BlockDevice, DeviceAccess, FsError, FsResult};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::alloc::Allocator;
use crate::boot::{BootSector, FatType, FsInfo};
use crate::chain::{Chain, LinkStore};
use crate::dir::{self, DirArena, DirChild, DirId, DirNode, DirStart};
use crate::names;
use crate::table::{FatBuffer, FREE_CLUSTER};

/// Mount-time knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountOptions {
    /// Force the FAT flavor; the only meaningful override is `Fat12` on
    /// a volume that reads as FAT16 (FAT12 is not self-describing).
    pub fat_type: Option<FatType>,
    /// Mount even when the redundant FAT copies disagree; copy 0 wins.
    pub bypass_coherency_check: bool,
}

/// Identity captured at mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub label: String,
    pub fs_type: String,
    pub volume_id: u32,
    pub fat_type: FatType,
    /// FAT32 FS-Information hints; `0xFFFFFFFF` when absent or degraded.
    pub free_cluster_hint: u32,
    pub next_free_hint: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VolumeStats {
    pub total_clusters: u32,
    pub free_clusters: u32,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Immutable layout derived from the boot sector.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub sector_size: u32,
    pub sectors_per_cluster: u32,
    pub cluster_size: u32,
    pub reserved_sectors: u32,
    pub fat_count: u32,
    pub sectors_per_fat: u32,
    pub total_sectors: u32,
    pub max_root_entries: u32,
    pub root_region_start: u32,
    pub root_region_sectors: u32,
    pub data_region_start: u32,
    pub cluster_count: u32,
    pub fat_type: FatType,
    pub root_cluster: u32,
}

impl Geometry {
    pub fn root_region_bytes(&self) -> usize {
        self.root_region_sectors as usize * self.sector_size as usize
    }
}

/// A path-walk result: either a file entry inside its parent, or a
/// cached directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Located {
    File { dir: DirId, index: usize },
    Dir(DirId),
}

/// A mounted volume. Single-threaded: the embedder serializes calls.
pub struct FatVolume<D: BlockDevice> {
    pub(crate) device: D,
    pub(crate) geom: Geometry,
    pub(crate) info: VolumeInfo,
    pub(crate) fat: FatBuffer,
    pub(crate) alloc: Allocator,
    pub(crate) dirs: DirArena,
    pub(crate) altered_dirs: BTreeSet<DirId>,
    pub(crate) read_only: bool,
}

fn cluster_sector(geom: &Geometry, cluster: u32) -> FsResult<u32> {
    if cluster < 2 || cluster - 2 >= geom.cluster_count {
        return Err(FsError::CorruptFilesystem(format!(
            "cluster {} outside 2..{}",
            cluster,
            geom.cluster_count + 2
        )));
    }
    Ok(geom.data_region_start + (cluster - 2) * geom.sectors_per_cluster)
}

fn read_cluster<D: BlockDevice>(
    device: &mut D,
    geom: &Geometry,
    cluster: u32,
) -> FsResult<Vec<u8>> {
    let sector = cluster_sector(geom, cluster)?;
    device.read_sectors(sector, geom.sectors_per_cluster)
}

/// Write one cluster; short buffers are zero-padded to a whole cluster.
fn write_cluster<D: BlockDevice>(
    device: &mut D,
    geom: &Geometry,
    cluster: u32,
    data: &[u8],
) -> FsResult<()> {
    let sector = cluster_sector(geom, cluster)?;
    if data.len() > geom.cluster_size as usize {
        return Err(FsError::InvalidState(format!(
            "{} bytes exceed the {}-byte cluster",
            data.len(),
            geom.cluster_size
        )));
    }
    if data.len() == geom.cluster_size as usize {
        device.write_sectors(sector, data)
    } else {
        let mut padded = data.to_vec();
        padded.resize(geom.cluster_size as usize, 0);
        device.write_sectors(sector, &padded)
    }
}

/// Link store over the data region: one link per cluster. Growth goes
/// through the allocator when one is attached.
pub(crate) struct ClusterStore<'a, D: BlockDevice> {
    device: &'a mut D,
    geom: &'a Geometry,
    fat: &'a mut FatBuffer,
    alloc: Option<&'a mut Allocator>,
}

impl<D: BlockDevice> LinkStore for ClusterStore<'_, D> {
    fn link_size(&self) -> usize {
        self.geom.cluster_size as usize
    }

    fn read_link(&mut self, index: u32) -> FsResult<Vec<u8>> {
        read_cluster(self.device, self.geom, index)
    }

    fn write_link(&mut self, index: u32, data: &[u8]) -> FsResult<()> {
        write_cluster(self.device, self.geom, index, data)
    }

    fn allocate(&mut self, last: Option<u32>, bytes_needed: usize) -> FsResult<Vec<u32>> {
        match self.alloc.as_deref_mut() {
            Some(alloc) => alloc.allocate(
                self.fat,
                last,
                bytes_needed,
                self.geom.cluster_size as usize,
            ),
            None => Ok(Vec::new()),
        }
    }
}

/// Single-link store over the FAT12/16 fixed root region. Reads return
/// zeros so slots past the serialized entries come back zeroed; it never
/// grows.
pub(crate) struct FixedRootStore<'a, D: BlockDevice> {
    device: &'a mut D,
    geom: &'a Geometry,
}

impl<D: BlockDevice> LinkStore for FixedRootStore<'_, D> {
    fn link_size(&self) -> usize {
        self.geom.root_region_bytes()
    }

    fn read_link(&mut self, _index: u32) -> FsResult<Vec<u8>> {
        Ok(vec![0; self.geom.root_region_bytes()])
    }

    fn write_link(&mut self, _index: u32, data: &[u8]) -> FsResult<()> {
        if data.len() != self.geom.root_region_bytes() {
            return Err(FsError::InvalidState(format!(
                "fixed root write of {} bytes, region is {}",
                data.len(),
                self.geom.root_region_bytes()
            )));
        }
        self.device
            .write_sectors(self.geom.root_region_start, data)
    }

    fn allocate(&mut self, _last: Option<u32>, _bytes_needed: usize) -> FsResult<Vec<u32>> {
        Ok(Vec::new())
    }
}

enum PreparedBody {
    FixedRoot(Vec<u8>),
    Clusters { links: Vec<u32>, bytes: Vec<u8> },
}

impl<D: BlockDevice> FatVolume<D> {
    /// Parse the boot sector, load and verify the FAT copies, materialize
    /// the root directory, and build the allocator.
    pub fn mount(mut device: D, options: MountOptions) -> FsResult<Self> {
        let sector_size = device.sector_size();
        let sector0 = device.read_sectors(0, 1)?;
        let boot = BootSector::parse(&sector0)?;
        let fat_type = boot.resolve_fat_type(options.fat_type)?;

        if boot.bytes_per_sector as u32 != sector_size {
            return Err(FsError::CorruptFilesystem(format!(
                "boot sector claims {}-byte sectors, device has {}",
                boot.bytes_per_sector, sector_size
            )));
        }
        if boot.bytes_per_sector == 0 || boot.bytes_per_sector % 128 != 0 {
            return Err(FsError::CorruptFilesystem(format!(
                "sector size {} is not a multiple of 128",
                boot.bytes_per_sector
            )));
        }
        if !boot.sectors_per_cluster.is_power_of_two() {
            return Err(FsError::CorruptFilesystem(format!(
                "sectors per cluster {} is not a power of two",
                boot.sectors_per_cluster
            )));
        }
        if boot.fat_count == 0 || boot.sectors_per_fat() == 0 {
            return Err(FsError::CorruptFilesystem(
                "boot sector describes no FAT".to_string(),
            ));
        }

        let (free_cluster_hint, next_free_hint) = if let Some(ext) = &boot.fat32 {
            let fs_info_sector = ext.fs_info_sector as u32;
            if fs_info_sector != 0 && fs_info_sector < device.num_sectors() {
                let raw = device.read_sectors(fs_info_sector, 1)?;
                let fs_info = FsInfo::parse(&raw)?;
                (fs_info.free_cluster_count, fs_info.next_free_cluster)
            } else {
                (FsInfo::UNKNOWN, FsInfo::UNKNOWN)
            }
        } else {
            (FsInfo::UNKNOWN, FsInfo::UNKNOWN)
        };

        let sectors_per_cluster = boot.sectors_per_cluster as u32;
        let reserved_sectors = boot.reserved_sectors as u32;
        let fat_count = boot.fat_count as u32;
        let sectors_per_fat = boot.sectors_per_fat();
        let total_sectors = boot.total_sectors();
        let max_root_entries = boot.max_root_entries as u32;
        let root_region_start = reserved_sectors + fat_count * sectors_per_fat;
        let root_region_sectors = if fat_type == FatType::Fat32 {
            0
        } else {
            (max_root_entries * dir::DIR_ENTRY_SIZE as u32).div_ceil(sector_size)
        };
        let data_region_start = root_region_start + root_region_sectors;
        if total_sectors <= data_region_start {
            return Err(FsError::CorruptFilesystem(format!(
                "data region at sector {} exceeds the {}-sector volume",
                data_region_start, total_sectors
            )));
        }
        let cluster_count =
            ((total_sectors - data_region_start) / sectors_per_cluster).min(0x0FFF_FFF7);
        let root_cluster = boot
            .fat32
            .as_ref()
            .map(|f| f.root_cluster)
            .unwrap_or(0);

        let geom = Geometry {
            sector_size,
            sectors_per_cluster,
            cluster_size: sectors_per_cluster * sector_size,
            reserved_sectors,
            fat_count,
            sectors_per_fat,
            total_sectors,
            max_root_entries,
            root_region_start,
            root_region_sectors,
            data_region_start,
            cluster_count,
            fat_type,
            root_cluster,
        };

        info!(
            "mounting {:?}: {} sectors of {} bytes, {} clusters of {} bytes, {} FAT copies",
            fat_type, total_sectors, sector_size, cluster_count, geom.cluster_size, fat_count
        );

        let fat_data = device.read_sectors(reserved_sectors, sectors_per_fat)?;
        for copy in 1..fat_count {
            if options.bypass_coherency_check {
                warn!("skipping FAT coherency check, copy 0 wins");
                break;
            }
            let other =
                device.read_sectors(reserved_sectors + copy * sectors_per_fat, sectors_per_fat)?;
            if other != fat_data {
                return Err(FsError::CorruptFilesystem(format!(
                    "FAT copy {} disagrees with copy 0",
                    copy
                )));
            }
        }

        let fat_capacity = (match fat_type {
            FatType::Fat12 => (fat_data.len() / 3) * 2,
            FatType::Fat16 => fat_data.len() / 2,
            FatType::Fat32 => fat_data.len() / 4,
        }) as u32;
        let entry_count = (cluster_count + 2).min(fat_capacity);
        let fat = FatBuffer::new(fat_type, sector_size, entry_count, fat_data);
        let alloc = Allocator::from_table(&fat)?;

        let root_start = if fat_type == FatType::Fat32 {
            DirStart::Cluster(root_cluster)
        } else {
            DirStart::FixedRoot
        };

        let info = VolumeInfo {
            label: String::from_utf8_lossy(&boot.ext.volume_label)
                .trim_end()
                .to_string(),
            fs_type: String::from_utf8_lossy(&boot.ext.fs_type)
                .trim_end()
                .to_string(),
            volume_id: boot.ext.volume_id,
            fat_type,
            free_cluster_hint,
            next_free_hint,
        };

        let mut volume = Self {
            read_only: device.access() == DeviceAccess::ReadOnly,
            device,
            geom,
            info,
            fat,
            alloc,
            dirs: DirArena::new(root_start),
            altered_dirs: BTreeSet::new(),
        };
        volume.load_children(DirId::ROOT)?;
        Ok(volume)
    }

    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geom
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Surrender the underlying device (pending mutations are lost).
    pub fn into_device(self) -> D {
        self.device
    }

    pub fn stats(&self) -> VolumeStats {
        let free = self.alloc.free_clusters();
        VolumeStats {
            total_clusters: self.geom.cluster_count,
            free_clusters: free,
            total_bytes: self.geom.cluster_count as u64 * self.geom.cluster_size as u64,
            free_bytes: free as u64 * self.geom.cluster_size as u64,
        }
    }

    pub(crate) fn cluster_store(&mut self, allocating: bool) -> ClusterStore<'_, D> {
        ClusterStore {
            device: &mut self.device,
            geom: &self.geom,
            fat: &mut self.fat,
            alloc: if allocating { Some(&mut self.alloc) } else { None },
        }
    }

    /// Build the body chain of a file rooted at `first_cluster`, capped
    /// at `limit` bytes when given.
    pub(crate) fn body_chain(&self, first_cluster: u32, limit: Option<u64>) -> FsResult<Chain> {
        let links = self.fat.cluster_chain(first_cluster)?;
        Ok(Chain::new(links, self.geom.cluster_size as usize, limit))
    }

    /// Materialize a directory's children on first touch.
    pub(crate) fn load_children(&mut self, id: DirId) -> FsResult<()> {
        if self.dirs.node(id)?.children.is_some() {
            return Ok(());
        }
        let start = self.dirs.node(id)?.start;
        let bytes = match start {
            DirStart::FixedRoot => self
                .device
                .read_sectors(self.geom.root_region_start, self.geom.root_region_sectors)?,
            DirStart::Cluster(first) => {
                let mut buf = Vec::new();
                for link in self.fat.cluster_chain(first)? {
                    buf.extend_from_slice(&read_cluster(&mut self.device, &self.geom, link)?);
                }
                buf
            }
        };
        let records = dir::parse_dir_entries(&bytes, false)?;
        debug!("materialized directory {:?}: {} entries", id, records.len());
        let mut children = Vec::with_capacity(records.len());
        for record in records {
            if record.is_directory() && !record.is_dot_entry() && !record.is_volume_label() {
                let child = self.dirs.insert(DirNode {
                    start: DirStart::Cluster(record.first_cluster()),
                    record: Some(record),
                    parent: Some(id),
                    children: None,
                });
                children.push(DirChild::Dir(child));
            } else {
                children.push(DirChild::File(record));
            }
        }
        self.dirs.node_mut(id)?.children = Some(children);
        Ok(())
    }

    /// Case-insensitive 8.3 lookup of `name` among the children of `id`.
    pub(crate) fn find_entry(&mut self, id: DirId, name: &str) -> FsResult<Option<Located>> {
        self.load_children(id)?;
        let children = self
            .dirs
            .node(id)?
            .children
            .as_ref()
            .ok_or_else(|| FsError::InvalidState("children vanished after load".to_string()))?;
        for (index, child) in children.iter().enumerate() {
            match child {
                DirChild::Dir(child_id) => {
                    let record = self.dirs.node(*child_id)?.record.as_ref().ok_or_else(|| {
                        FsError::InvalidState("cached subdirectory without a record".to_string())
                    })?;
                    if names::matches_short_name(name, &record.name) {
                        return Ok(Some(Located::Dir(*child_id)));
                    }
                }
                DirChild::File(record) => {
                    if record.is_volume_label()
                        || record.is_directory()
                        || record.is_dot_entry()
                        || record.is_lfn()
                    {
                        continue;
                    }
                    if names::matches_short_name(name, &record.name) {
                        return Ok(Some(Located::File { dir: id, index }));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Walk `path` from the root, returning every step (root included).
    /// `None` when any component is missing or a non-terminal component
    /// is not a directory.
    pub fn traverse_entries(&mut self, path: &str) -> FsResult<Option<Vec<Located>>> {
        let mut steps = vec![Located::Dir(DirId::ROOT)];
        for segment in names::split_path(path) {
            let here = match steps.last() {
                Some(Located::Dir(id)) => *id,
                _ => return Ok(None),
            };
            match self.find_entry(here, segment)? {
                Some(found) => steps.push(found),
                None => return Ok(None),
            }
        }
        Ok(Some(steps))
    }

    /// Walk `path` and return only the tail.
    pub fn traverse(&mut self, path: &str) -> FsResult<Option<Located>> {
        Ok(self
            .traverse_entries(path)?
            .and_then(|steps| steps.last().copied()))
    }

    /// Record that a directory's in-memory children diverge from disk.
    pub(crate) fn mark_altered(&mut self, id: DirId) {
        self.altered_dirs.insert(id);
    }

    /// Re-point the chain starting at `old_start` to exactly `new`:
    /// clusters leaving the chain are freed, entering ones are claimed,
    /// and the FAT links are rewritten.
    pub(crate) fn redefine_cluster_chain(
        &mut self,
        old_start: u32,
        new: &[u32],
    ) -> FsResult<()> {
        let old = self.fat.cluster_chain(old_start)?;
        let new_set: HashSet<u32> = new.iter().copied().collect();
        let old_set: HashSet<u32> = old.iter().copied().collect();
        let freed: Vec<u32> = old.iter().copied().filter(|c| !new_set.contains(c)).collect();
        let taken: Vec<u32> = new.iter().copied().filter(|c| !old_set.contains(c)).collect();
        for &cluster in &freed {
            self.fat.set_entry(cluster, FREE_CLUSTER)?;
        }
        self.alloc.add_cluster_list_to_freelist(&freed);
        self.alloc.mark_used(&taken);
        for window in new.windows(2) {
            self.fat.set_entry(window[0], window[1])?;
        }
        if let Some(&tail) = new.last() {
            self.fat.set_entry(tail, self.geom.fat_type.eoc())?;
        }
        Ok(())
    }

    /// Free an entire chain (no-op for a zero start).
    pub(crate) fn free_chain(&mut self, start: u32) -> FsResult<()> {
        let chain = self.fat.cluster_chain(start)?;
        for &cluster in &chain {
            self.fat.set_entry(cluster, FREE_CLUSTER)?;
        }
        self.alloc.add_chain_to_freelist(&chain);
        Ok(())
    }

    /// Serialize a directory and settle its chain size. Returns the body
    /// and, when the directory just gained its first cluster, the parent
    /// whose serialization went stale.
    fn prepare_dir_body(&mut self, id: DirId) -> FsResult<(PreparedBody, Option<DirId>)> {
        self.load_children(id)?;
        let node = self.dirs.node(id)?;
        let start = node.start;
        let children = node
            .children
            .as_ref()
            .ok_or_else(|| FsError::InvalidState("flushing an unloaded directory".to_string()))?;
        let mut bytes = Vec::with_capacity(children.len() * dir::DIR_ENTRY_SIZE);
        for child in children {
            let record = match child {
                DirChild::File(record) => record,
                DirChild::Dir(child_id) => self
                    .dirs
                    .node(*child_id)?
                    .record
                    .as_ref()
                    .ok_or_else(|| {
                        FsError::InvalidState("cached subdirectory without a record".to_string())
                    })?,
            };
            bytes.extend_from_slice(&record.encode()?);
        }

        match start {
            DirStart::FixedRoot => {
                let capacity = self.geom.root_region_bytes();
                if bytes.len() > capacity {
                    return Err(FsError::NoSpace);
                }
                bytes.resize(capacity, 0);
                Ok((PreparedBody::FixedRoot(bytes), None))
            }
            DirStart::Cluster(first) => {
                let cluster_size = self.geom.cluster_size as usize;
                let mut links = self.fat.cluster_chain(first)?;
                let needed = bytes.len().div_ceil(cluster_size).max(1);
                let mut stale_parent = None;
                if links.len() < needed {
                    let grown = self.alloc.allocate(
                        &mut self.fat,
                        links.last().copied(),
                        (needed - links.len()) * cluster_size,
                        cluster_size,
                    )?;
                    let was_empty = links.is_empty();
                    links.extend(grown);
                    if was_empty {
                        let node = self.dirs.node_mut(id)?;
                        node.start = DirStart::Cluster(links[0]);
                        if let Some(record) = node.record.as_mut() {
                            record.set_first_cluster(links[0]);
                        }
                        stale_parent = node.parent;
                    }
                } else if links.len() > needed {
                    links.truncate(needed);
                    self.redefine_cluster_chain(first, &links)?;
                }
                bytes.resize(links.len() * cluster_size, 0);
                Ok((PreparedBody::Clusters { links, bytes }, stale_parent))
            }
        }
    }

    /// Make the in-memory mutations durable.
    ///
    /// Directory chains are sized first so every FAT mutation (explicit
    /// writes, growth, trimming) lands in the FAT pass; then the dirty
    /// FAT sectors go to every redundant copy; then the directory bodies
    /// are written. A crash between the passes leaks clusters but never
    /// leaves a directory pointing at unclaimed ones.
    pub fn flush(&mut self) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }

        let mut prepared: BTreeMap<DirId, PreparedBody> = BTreeMap::new();
        loop {
            let todo: Vec<DirId> = self
                .altered_dirs
                .iter()
                .copied()
                .filter(|id| !prepared.contains_key(id))
                .collect();
            if todo.is_empty() {
                break;
            }
            for id in todo {
                let (body, stale_parent) = self.prepare_dir_body(id)?;
                prepared.insert(id, body);
                if let Some(parent) = stale_parent {
                    self.altered_dirs.insert(parent);
                    prepared.remove(&parent);
                }
            }
        }

        if self.fat.altered() {
            let sectors: Vec<u32> = self.fat.altered_sectors().iter().copied().collect();
            debug!(
                "flushing {} FAT sectors to {} copies",
                sectors.len(),
                self.geom.fat_count
            );
            for copy in 0..self.geom.fat_count {
                let base = self.geom.reserved_sectors + copy * self.geom.sectors_per_fat;
                for &sector in &sectors {
                    let bytes = self.fat.sector_bytes(sector);
                    self.device.write_sectors(base + sector, &bytes)?;
                }
            }
            self.fat.clear_altered();
        }

        for (id, body) in prepared {
            debug!("rewriting directory {:?}", id);
            match body {
                PreparedBody::FixedRoot(bytes) => {
                    let mut store = FixedRootStore {
                        device: &mut self.device,
                        geom: &self.geom,
                    };
                    let link_size = store.link_size();
                    let mut chain = Chain::new(vec![0], link_size, None);
                    chain.write(&mut store, &bytes)?;
                    chain.flush(&mut store)?;
                }
                PreparedBody::Clusters { links, bytes } => {
                    let mut store = ClusterStore {
                        device: &mut self.device,
                        geom: &self.geom,
                        fat: &mut self.fat,
                        alloc: None,
                    };
                    let link_size = store.link_size();
                    let mut chain = Chain::new(links, link_size, None);
                    chain.write(&mut store, &bytes)?;
                    chain.flush(&mut store)?;
                }
            }
        }
        self.altered_dirs.clear();

        self.device.flush()
    }
}
