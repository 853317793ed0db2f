// Path-oriented operations over a mounted volume, plus the file handle.

use std::io::SeekFrom;

use fathom_core::{BlockDevice, FsError, FsResult};
use log::{debug, info};

use crate::chain::Chain;
use crate::dir::{DirChild, DirEntryRecord, DirId, DirStart};
use crate::names;
use crate::volume::{FatVolume, Located};

const DOT_NAME: [u8; 11] = *b".          ";
const DOTDOT_NAME: [u8; 11] = *b"..         ";

impl<D: BlockDevice> FatVolume<D> {
    fn children_mut(&mut self, id: DirId) -> FsResult<&mut Vec<DirChild>> {
        self.dirs
            .node_mut(id)?
            .children
            .as_mut()
            .ok_or_else(|| FsError::InvalidState("directory children not materialized".to_string()))
    }

    fn file_record(&self, id: DirId, index: usize) -> FsResult<&DirEntryRecord> {
        let children = self
            .dirs
            .node(id)?
            .children
            .as_ref()
            .ok_or_else(|| FsError::InvalidState("directory children not materialized".to_string()))?;
        match children.get(index) {
            Some(DirChild::File(record)) => Ok(record),
            _ => Err(FsError::InvalidState(format!(
                "child {} is not a file entry",
                index
            ))),
        }
    }

    /// The fixed FAT12/16 root cannot grow; refuse inserts that would
    /// not fit. Cluster-backed directories grow at flush.
    fn ensure_insert_capacity(&mut self, id: DirId) -> FsResult<()> {
        self.load_children(id)?;
        let node = self.dirs.node(id)?;
        if node.start == DirStart::FixedRoot {
            let used = node.children.as_ref().map(|c| c.len()).unwrap_or(0);
            if used >= self.geometry().max_root_entries as usize {
                return Err(FsError::NoSpace);
            }
        }
        Ok(())
    }

    fn resolve_parent(&mut self, path: &str) -> FsResult<(DirId, String)> {
        let (parent_path, leaf) = names::split_parent(path)?;
        match self.traverse(&parent_path)? {
            Some(Located::Dir(id)) => Ok((id, leaf.to_string())),
            _ => Err(FsError::NotFound(parent_path)),
        }
    }

    /// The cluster a `..` entry should carry for a given parent.
    fn dotdot_cluster(&self, parent: DirId) -> FsResult<u32> {
        if parent == DirId::ROOT {
            return Ok(0);
        }
        match self.dirs.node(parent)?.start {
            DirStart::Cluster(c) => Ok(c),
            DirStart::FixedRoot => Ok(0),
        }
    }

    /// Open an existing file. `None` when the path does not resolve to a
    /// file; `ReadOnly` when a writable handle is asked of a read-only
    /// volume.
    pub fn open(&mut self, path: &str, writable: bool) -> FsResult<Option<File<'_, D>>> {
        if writable && self.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        debug!("open {:?} writable={}", path, writable);
        let Some(Located::File { dir, index }) = self.traverse(path)? else {
            return Ok(None);
        };
        let record = self.file_record(dir, index)?;
        let (first, size) = (record.first_cluster(), record.file_size as u64);
        let chain = self.body_chain(first, Some(size))?;
        Ok(Some(File {
            vol: self,
            dir,
            index,
            chain,
            writable,
        }))
    }

    /// Create an empty file and hand back a writable handle. `None` when
    /// the path already exists.
    pub fn create(&mut self, path: &str) -> FsResult<Option<File<'_, D>>> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        let (parent, leaf) = self.resolve_parent(path)?;
        if self.find_entry(parent, &leaf)?.is_some() {
            return Ok(None);
        }
        let short = names::validated_short_name(&leaf)?;
        self.ensure_insert_capacity(parent)?;
        info!("create {:?}", path);
        let record = DirEntryRecord::new_file(short, 0, 0);
        let children = self.children_mut(parent)?;
        children.push(DirChild::File(record));
        let index = children.len() - 1;
        self.mark_altered(parent);
        let cluster_size = self.geometry().cluster_size as usize;
        Ok(Some(File {
            vol: self,
            dir: parent,
            index,
            chain: Chain::new(Vec::new(), cluster_size, Some(0)),
            writable: true,
        }))
    }

    /// Remove a file or an empty directory, returning its clusters to
    /// the free pool.
    pub fn delete(&mut self, path: &str) -> FsResult<()> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        info!("delete {:?}", path);
        match self.traverse(path)? {
            None => Err(FsError::NotFound(path.to_string())),
            Some(Located::File { dir, index }) => {
                let first = self.file_record(dir, index)?.first_cluster();
                self.free_chain(first)?;
                self.children_mut(dir)?.remove(index);
                self.mark_altered(dir);
                Ok(())
            }
            Some(Located::Dir(id)) => {
                if id == DirId::ROOT {
                    return Err(FsError::InvalidArgument(
                        "cannot delete the root directory".to_string(),
                    ));
                }
                self.load_children(id)?;
                let node = self.dirs.node(id)?;
                let occupied = node
                    .children
                    .as_ref()
                    .map(|children| {
                        children
                            .iter()
                            .filter(|child| match child {
                                DirChild::File(r) => !r.is_dot_entry(),
                                DirChild::Dir(_) => true,
                            })
                            .count()
                    })
                    .unwrap_or(0);
                if occupied > 0 {
                    return Err(FsError::InvalidArgument(format!(
                        "directory {:?} is not empty",
                        path
                    )));
                }
                let parent = node.parent.ok_or_else(|| {
                    FsError::InvalidState("non-root directory without a parent".to_string())
                })?;
                let start = match node.start {
                    DirStart::Cluster(c) => c,
                    DirStart::FixedRoot => {
                        return Err(FsError::InvalidState(
                            "fixed root reached through a parent".to_string(),
                        ))
                    }
                };
                self.free_chain(start)?;
                let children = self.children_mut(parent)?;
                let position = children
                    .iter()
                    .position(|c| matches!(c, DirChild::Dir(d) if *d == id))
                    .ok_or_else(|| {
                        FsError::InvalidState("directory missing from its parent".to_string())
                    })?;
                children.remove(position);
                self.mark_altered(parent);
                Ok(())
            }
        }
    }

    /// Move an entry, possibly across directories. Long-filename slots
    /// are dropped; a moved directory gets its `..` entry repointed.
    pub fn rename(&mut self, path: &str, new_path: &str) -> FsResult<()> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        let source = self
            .traverse(path)?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let (new_parent, new_leaf) = self.resolve_parent(new_path)?;
        if self.find_entry(new_parent, &new_leaf)?.is_some() {
            return Err(FsError::AlreadyExists(new_path.to_string()));
        }
        let short = names::validated_short_name(&new_leaf)?;
        info!("rename {:?} -> {:?}", path, new_path);
        match source {
            Located::File { dir, index } => {
                if dir != new_parent {
                    self.ensure_insert_capacity(new_parent)?;
                }
                let mut record = match self.children_mut(dir)?.remove(index) {
                    DirChild::File(record) => record,
                    DirChild::Dir(_) => {
                        return Err(FsError::InvalidState(
                            "file entry changed shape mid-rename".to_string(),
                        ))
                    }
                };
                record.name = short;
                record.lfn_count = 0;
                self.children_mut(new_parent)?.push(DirChild::File(record));
                self.mark_altered(dir);
                self.mark_altered(new_parent);
                Ok(())
            }
            Located::Dir(id) => {
                if id == DirId::ROOT {
                    return Err(FsError::InvalidArgument(
                        "cannot rename the root directory".to_string(),
                    ));
                }
                let old_parent = self.dirs.node(id)?.parent.ok_or_else(|| {
                    FsError::InvalidState("non-root directory without a parent".to_string())
                })?;
                if old_parent != new_parent {
                    self.ensure_insert_capacity(new_parent)?;
                }
                let children = self.children_mut(old_parent)?;
                let position = children
                    .iter()
                    .position(|c| matches!(c, DirChild::Dir(d) if *d == id))
                    .ok_or_else(|| {
                        FsError::InvalidState("directory missing from its parent".to_string())
                    })?;
                children.remove(position);
                self.children_mut(new_parent)?.push(DirChild::Dir(id));
                {
                    let node = self.dirs.node_mut(id)?;
                    node.parent = Some(new_parent);
                    if let Some(record) = node.record.as_mut() {
                        record.name = short;
                        record.lfn_count = 0;
                    }
                }
                self.mark_altered(old_parent);
                self.mark_altered(new_parent);
                if old_parent != new_parent {
                    let dotdot = self.dotdot_cluster(new_parent)?;
                    self.load_children(id)?;
                    for child in self.children_mut(id)? {
                        if let DirChild::File(record) = child {
                            if record.name == DOTDOT_NAME {
                                record.set_first_cluster(dotdot);
                            }
                        }
                    }
                    self.mark_altered(id);
                }
                Ok(())
            }
        }
    }

    /// Create a directory with fresh `.` and `..` entries.
    pub fn mkdir(&mut self, path: &str) -> FsResult<()> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        let (parent, leaf) = self.resolve_parent(path)?;
        if self.find_entry(parent, &leaf)?.is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        let short = names::validated_short_name(&leaf)?;
        self.ensure_insert_capacity(parent)?;
        info!("mkdir {:?}", path);

        let cluster_size = self.geometry().cluster_size as usize;
        let first = {
            let (alloc, fat) = self.alloc_and_fat();
            let clusters = alloc.allocate(fat, None, 1, cluster_size)?;
            *clusters.first().ok_or(FsError::NoSpace)?
        };
        let dot = DirEntryRecord::new_directory(DOT_NAME, first);
        let dotdot = DirEntryRecord::new_directory(DOTDOT_NAME, self.dotdot_cluster(parent)?);
        let record = DirEntryRecord::new_directory(short, first);

        let id = self.dirs.insert(crate::dir::DirNode {
            start: DirStart::Cluster(first),
            record: Some(record),
            parent: Some(parent),
            children: Some(vec![DirChild::File(dot), DirChild::File(dotdot)]),
        });
        self.children_mut(parent)?.push(DirChild::Dir(id));
        self.mark_altered(parent);
        self.mark_altered(id);
        Ok(())
    }

    /// Names of a directory's live entries; subdirectories carry a `/`
    /// suffix. `None` when the path is not a directory.
    pub fn list_dir(&mut self, path: &str) -> FsResult<Option<Vec<String>>> {
        let Some(Located::Dir(id)) = self.traverse(path)? else {
            return Ok(None);
        };
        self.load_children(id)?;
        let children = self
            .dirs
            .node(id)?
            .children
            .as_ref()
            .ok_or_else(|| FsError::InvalidState("directory children not materialized".to_string()))?;
        let mut names = Vec::new();
        for child in children {
            match child {
                DirChild::Dir(child_id) => {
                    if let Some(record) = self.dirs.node(*child_id)?.record.as_ref() {
                        names.push(format!("{}/", record.normal_name()));
                    }
                }
                DirChild::File(record) => {
                    if record.is_dot_entry()
                        || record.is_lfn()
                        || record.is_volume_label()
                        || record.is_directory()
                    {
                        continue;
                    }
                    names.push(record.normal_name());
                }
            }
        }
        Ok(Some(names))
    }

    /// Byte size of a file, or the allocated byte length of a directory.
    pub fn get_size_of(&mut self, path: &str) -> FsResult<Option<u64>> {
        match self.traverse(path)? {
            None => Ok(None),
            Some(Located::File { dir, index }) => {
                Ok(Some(self.file_record(dir, index)?.file_size as u64))
            }
            Some(Located::Dir(id)) => match self.dirs.node(id)?.start {
                DirStart::FixedRoot => Ok(Some(self.geometry().root_region_bytes() as u64)),
                DirStart::Cluster(first) => {
                    let links = self.fat.cluster_chain(first)?;
                    Ok(Some(
                        links.len() as u64 * self.geometry().cluster_size as u64,
                    ))
                }
            },
        }
    }

    fn alloc_and_fat(&mut self) -> (&mut crate::alloc::Allocator, &mut crate::table::FatBuffer) {
        (&mut self.alloc, &mut self.fat)
    }
}

/// An open file: a chain cursor plus the identity of its directory
/// entry, which is kept in sync as writes extend the file.
pub struct File<'v, D: BlockDevice> {
    vol: &'v mut FatVolume<D>,
    dir: DirId,
    index: usize,
    chain: Chain,
    writable: bool,
}

impl<D: BlockDevice> File<'_, D> {
    /// Current byte size (pending writes included).
    pub fn size(&self) -> u64 {
        self.chain.total_length()
    }

    pub fn seek(&mut self, pos: SeekFrom) -> FsResult<u64> {
        let mut store = self.vol.cluster_store(false);
        self.chain.seek(&mut store, pos)
    }

    pub fn read(&mut self, count: usize) -> FsResult<Vec<u8>> {
        let mut store = self.vol.cluster_store(false);
        self.chain.read(&mut store, count)
    }

    pub fn read_all(&mut self) -> FsResult<Vec<u8>> {
        let mut store = self.vol.cluster_store(false);
        self.chain.read_all(&mut store)
    }

    pub fn write(&mut self, data: &[u8]) -> FsResult<()> {
        if !self.writable {
            return Err(FsError::InvalidArgument(
                "file handle was opened read-only".to_string(),
            ));
        }
        let mut store = self.vol.cluster_store(true);
        self.chain.write(&mut store, data)?;
        self.sync_record()
    }

    /// Push pending chain bytes down and publish size/first-cluster into
    /// the directory entry. Metadata still needs a volume `flush` to
    /// reach the disk.
    pub fn flush(&mut self) -> FsResult<()> {
        let mut store = self.vol.cluster_store(self.writable);
        self.chain.flush(&mut store)?;
        self.sync_record()
    }

    fn sync_record(&mut self) -> FsResult<()> {
        if !self.writable {
            return Ok(());
        }
        let first = self.chain.first_link().unwrap_or(0);
        let size = self.chain.total_length() as u32;
        let children = self.vol.children_mut(self.dir)?;
        let record = match children.get_mut(self.index) {
            Some(DirChild::File(record)) => record,
            _ => {
                return Err(FsError::InvalidState(
                    "file entry moved while a handle was open".to_string(),
                ))
            }
        };
        if record.first_cluster() != first || record.file_size != size {
            record.set_first_cluster(first);
            record.file_size = size;
            record.touch_write_now();
            self.vol.mark_altered(self.dir);
        }
        Ok(())
    }
}

impl<D: BlockDevice> Drop for File<'_, D> {
    fn drop(&mut self) {
        // Best effort; an explicit flush reports errors properly.
        let _ = self.flush();
    }
}
