// Cluster allocator: free bitmap mirroring the FAT plus a run-length
// freelist used for locality-aware allocation.

use fathom_core::{FsError, FsResult};
use log::{debug, trace};

use crate::table::{FatBuffer, FREE_CLUSTER};

/// A maximal run of free clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRun {
    pub start: u32,
    pub len: u32,
}

/// Tracks which clusters are free. `freemap[c]` is true exactly when
/// `FAT[c] == 0`; clusters 0 and 1 are reserved and never free. The
/// freelist is recomputed whenever the freemap changes.
pub struct Allocator {
    freemap: Vec<bool>,
    freelist: Vec<FreeRun>,
}

impl Allocator {
    /// Scan the FAT and build the bitmap and run list.
    pub fn from_table(fat: &FatBuffer) -> FsResult<Self> {
        let count = fat.entry_count() as usize;
        let mut freemap = vec![false; count];
        for cluster in 2..fat.entry_count() {
            freemap[cluster as usize] = fat.entry(cluster)? == FREE_CLUSTER;
        }
        let mut alloc = Self {
            freemap,
            freelist: Vec::new(),
        };
        alloc.rebuild_freelist();
        debug!(
            "allocator ready: {} free of {} clusters in {} runs",
            alloc.free_clusters(),
            count.saturating_sub(2),
            alloc.freelist.len()
        );
        Ok(alloc)
    }

    fn rebuild_freelist(&mut self) {
        self.freelist.clear();
        let mut run: Option<FreeRun> = None;
        for (cluster, &free) in self.freemap.iter().enumerate().skip(2) {
            if free {
                match &mut run {
                    Some(r) => r.len += 1,
                    None => {
                        run = Some(FreeRun {
                            start: cluster as u32,
                            len: 1,
                        })
                    }
                }
            } else if let Some(r) = run.take() {
                self.freelist.push(r);
            }
        }
        if let Some(r) = run {
            self.freelist.push(r);
        }
    }

    pub fn is_free(&self, cluster: u32) -> bool {
        self.freemap
            .get(cluster as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn free_clusters(&self) -> u32 {
        self.freelist.iter().map(|r| r.len).sum()
    }

    pub fn free_runs(&self) -> &[FreeRun] {
        &self.freelist
    }

    /// Mark clusters free again (FAT zeroing is the caller's side).
    pub fn add_cluster_list_to_freelist(&mut self, clusters: &[u32]) {
        for &cluster in clusters {
            if cluster >= 2 && (cluster as usize) < self.freemap.len() {
                self.freemap[cluster as usize] = true;
            }
        }
        self.rebuild_freelist();
    }

    /// Mark the clusters of a traversed chain free.
    pub fn add_chain_to_freelist(&mut self, chain: &[u32]) {
        self.add_cluster_list_to_freelist(chain);
    }

    /// Take clusters out of circulation without allocating them through
    /// `allocate` (used when a caller rewires chains by hand).
    pub fn mark_used(&mut self, clusters: &[u32]) {
        for &cluster in clusters {
            if (cluster as usize) < self.freemap.len() {
                self.freemap[cluster as usize] = false;
            }
        }
        self.rebuild_freelist();
    }

    /// Allocate clusters for `size_bytes`, preferring runs near `last`.
    ///
    /// Selection: among runs long enough for the whole request, the one
    /// whose start is nearest `last` (first fit without a hint); when no
    /// single run suffices, nearest runs of any length are carved until
    /// the request is covered. Returns exactly the needed cluster count
    /// or `NoSpace`; it never hands out a short allocation.
    ///
    /// The FAT is updated to link the fresh clusters, terminate the tail
    /// with the end-of-chain sentinel, and splice onto `last` when given.
    pub fn allocate(
        &mut self,
        fat: &mut FatBuffer,
        last: Option<u32>,
        size_bytes: usize,
        cluster_size: usize,
    ) -> FsResult<Vec<u32>> {
        if size_bytes == 0 {
            return Ok(Vec::new());
        }
        let runs_needed = size_bytes.div_ceil(cluster_size) as u32;
        if self.free_clusters() < runs_needed {
            return Err(FsError::NoSpace);
        }

        let mut picked = Vec::with_capacity(runs_needed as usize);
        let mut remaining = runs_needed;
        // Carve a working copy; an entry-bounds error below must leave
        // the published freelist untouched.
        let mut runs = self.freelist.clone();
        while remaining > 0 {
            let near = last.or_else(|| picked.last().copied());
            let chosen = pick_run(&runs, near, remaining).ok_or(FsError::NoSpace)?;
            let run = &mut runs[chosen];
            let take = run.len.min(remaining);
            trace!(
                "carving {} clusters at {} (wanted {} more)",
                take,
                run.start,
                remaining
            );
            for c in run.start..run.start + take {
                picked.push(c);
            }
            run.start += take;
            run.len -= take;
            remaining -= take;
            if run.len == 0 {
                runs.remove(chosen);
            }
        }

        // FAT wiring first; the bitmap and freelist only change once
        // every entry write has landed.
        for window in picked.windows(2) {
            fat.set_entry(window[0], window[1])?;
        }
        let tail = *picked.last().ok_or(FsError::NoSpace)?;
        fat.set_entry(tail, fat.fat_type().eoc())?;
        if let Some(prev) = last {
            fat.set_entry(prev, picked[0])?;
        }

        for &c in &picked {
            self.freemap[c as usize] = false;
        }
        self.freelist = runs;
        Ok(picked)
    }
}

/// Choose a run: prefer runs covering the whole remainder, nearest to
/// `near` when a hint exists; otherwise the nearest run of any length.
fn pick_run(runs: &[FreeRun], near: Option<u32>, needed: u32) -> Option<usize> {
    let distance = |run: &FreeRun| match near {
        Some(n) => (run.start as i64 - n as i64).abs(),
        None => run.start as i64,
    };
    let fitting = runs
        .iter()
        .enumerate()
        .filter(|(_, r)| r.len >= needed)
        .min_by_key(|(_, r)| distance(r))
        .map(|(i, _)| i);
    fitting.or_else(|| {
        runs.iter()
            .enumerate()
            .min_by_key(|(_, r)| distance(r))
            .map(|(i, _)| i)
    })
}
