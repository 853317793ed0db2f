// Cursor over a sequence of equal-length links with lazy write
// coalescing and allocator-driven growth.

use std::io::SeekFrom;

use fathom_core::{FsError, FsResult};

/// The capability a chain needs from its owner: link I/O plus optional
/// growth. The chain holds no back-reference; callers thread the store
/// through every operation.
pub trait LinkStore {
    fn link_size(&self) -> usize;
    fn read_link(&mut self, index: u32) -> FsResult<Vec<u8>>;
    fn write_link(&mut self, index: u32, data: &[u8]) -> FsResult<()>;

    /// Provide links for `bytes_needed` more bytes, chained after `last`.
    /// A store that cannot grow returns an empty list.
    fn allocate(&mut self, last: Option<u32>, bytes_needed: usize) -> FsResult<Vec<u32>>;
}

struct Pending {
    /// Position of the buffered link within `links`.
    slot: usize,
    buf: Vec<u8>,
    /// Marks bytes written since the buffer was opened; stale bytes are
    /// overlaid from the original link contents at flush.
    fresh: Vec<bool>,
}

/// Byte cursor over a link sequence. At most one link-sized buffer is
/// pending at any time; crossing a link boundary, seeking, or flushing
/// pushes it down to the store.
pub struct Chain {
    links: Vec<u32>,
    link_size: usize,
    pos: u64,
    total_length: u64,
    pending: Option<Pending>,
}

impl Chain {
    /// `limit` caps reads below the allocated length (a file whose size
    /// is smaller than its cluster allocation); `None` means the full
    /// allocation is addressable.
    pub fn new(links: Vec<u32>, link_size: usize, limit: Option<u64>) -> Self {
        let length = links.len() as u64 * link_size as u64;
        Self {
            links,
            link_size,
            pos: 0,
            total_length: limit.unwrap_or(length),
            pending: None,
        }
    }

    /// Sum of link lengths.
    pub fn length(&self) -> u64 {
        self.links.len() as u64 * self.link_size as u64
    }

    /// Addressable byte count; grows monotonically as writes extend the
    /// chain past it.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn first_link(&self) -> Option<u32> {
        self.links.first().copied()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn seek<S: LinkStore>(&mut self, store: &mut S, pos: SeekFrom) -> FsResult<u64> {
        self.flush(store)?;
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.total_length as i128 + d as i128,
        };
        if target < 0 || target > u64::MAX as i128 {
            return Err(FsError::InvalidArgument(format!(
                "seek to byte {} is outside the chain",
                target
            )));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    /// Read up to `count` bytes; short when the cursor nears
    /// `total_length`.
    pub fn read<S: LinkStore>(&mut self, store: &mut S, count: usize) -> FsResult<Vec<u8>> {
        self.flush(store)?;
        // A record can claim more bytes than its allocation holds; the
        // physical length caps the read alongside the byte limit.
        let bound = self.total_length.min(self.length());
        let available = bound.saturating_sub(self.pos);
        let wanted = (count as u64).min(available) as usize;
        let mut out = Vec::with_capacity(wanted);
        while out.len() < wanted {
            let slot = (self.pos / self.link_size as u64) as usize;
            let offset = (self.pos % self.link_size as u64) as usize;
            let link = self.links[slot];
            let data = store.read_link(link)?;
            if data.len() != self.link_size {
                return Err(FsError::InvalidState(format!(
                    "link {} returned {} bytes, expected {}",
                    link,
                    data.len(),
                    self.link_size
                )));
            }
            let take = (wanted - out.len()).min(self.link_size - offset);
            out.extend_from_slice(&data[offset..offset + take]);
            self.pos += take as u64;
        }
        Ok(out)
    }

    /// Read from the cursor to `total_length`.
    pub fn read_all<S: LinkStore>(&mut self, store: &mut S) -> FsResult<Vec<u8>> {
        let remaining = self.total_length.saturating_sub(self.pos);
        self.read(store, remaining as usize)
    }

    /// Buffered write. Growth past the allocated length asks the store
    /// for more links; a store that returns none fails the write with
    /// `NoSpace`.
    pub fn write<S: LinkStore>(&mut self, store: &mut S, data: &[u8]) -> FsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = self.pos + data.len() as u64;
        if end > self.length() {
            let needed = (end - self.length()) as usize;
            let last = self.links.last().copied();
            let fresh_links = store.allocate(last, needed)?;
            if fresh_links.is_empty() {
                return Err(FsError::NoSpace);
            }
            self.links.extend(fresh_links);
            if end > self.length() {
                return Err(FsError::NoSpace);
            }
        }

        let mut written = 0usize;
        while written < data.len() {
            let slot = (self.pos / self.link_size as u64) as usize;
            let offset = (self.pos % self.link_size as u64) as usize;
            if self
                .pending
                .as_ref()
                .map(|p| p.slot != slot)
                .unwrap_or(false)
            {
                self.flush(store)?;
            }
            let pending = self.pending.get_or_insert_with(|| Pending {
                slot,
                buf: vec![0; self.link_size],
                fresh: vec![false; self.link_size],
            });
            let take = (data.len() - written).min(self.link_size - offset);
            pending.buf[offset..offset + take].copy_from_slice(&data[written..written + take]);
            for flag in &mut pending.fresh[offset..offset + take] {
                *flag = true;
            }
            written += take;
            self.pos += take as u64;
        }

        if self.pos > self.total_length {
            self.total_length = self.pos;
        }
        Ok(())
    }

    /// Push the pending buffer, if any, down to the store. Bytes never
    /// written since the buffer was opened keep their original contents.
    pub fn flush<S: LinkStore>(&mut self, store: &mut S) -> FsResult<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        if pending.buf.len() != self.link_size || pending.fresh.len() != self.link_size {
            return Err(FsError::InvalidState(format!(
                "pending buffer of {} bytes does not match the {}-byte link",
                pending.buf.len(),
                self.link_size
            )));
        }
        let link = self.links[pending.slot];
        let data = if pending.fresh.iter().all(|&f| f) {
            pending.buf
        } else {
            let mut original = store.read_link(link)?;
            if original.len() != self.link_size {
                return Err(FsError::InvalidState(format!(
                    "link {} returned {} bytes, expected {}",
                    link,
                    original.len(),
                    self.link_size
                )));
            }
            for (i, &f) in pending.fresh.iter().enumerate() {
                if f {
                    original[i] = pending.buf[i];
                }
            }
            original
        };
        store.write_link(link, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Store over numbered in-memory links; allocation hands out fresh
    /// indices until a configured cap.
    struct VecStore {
        link_size: usize,
        data: Vec<Vec<u8>>,
        cap: usize,
        reads: usize,
        writes: usize,
    }

    impl VecStore {
        fn new(link_size: usize, links: usize, cap: usize) -> Self {
            Self {
                link_size,
                data: (0..links).map(|_| vec![0; link_size]).collect(),
                cap,
                reads: 0,
                writes: 0,
            }
        }
    }

    impl LinkStore for VecStore {
        fn link_size(&self) -> usize {
            self.link_size
        }

        fn read_link(&mut self, index: u32) -> FsResult<Vec<u8>> {
            self.reads += 1;
            Ok(self.data[index as usize].clone())
        }

        fn write_link(&mut self, index: u32, data: &[u8]) -> FsResult<()> {
            self.writes += 1;
            self.data[index as usize] = data.to_vec();
            Ok(())
        }

        fn allocate(&mut self, _last: Option<u32>, bytes_needed: usize) -> FsResult<Vec<u32>> {
            let wanted = bytes_needed.div_ceil(self.link_size);
            let mut out = Vec::new();
            for _ in 0..wanted {
                if self.data.len() >= self.cap {
                    break;
                }
                self.data.push(vec![0; self.link_size]);
                out.push(self.data.len() as u32 - 1);
            }
            Ok(out)
        }
    }

    #[test]
    fn reads_are_capped_by_the_byte_limit() {
        let mut store = VecStore::new(16, 2, 2);
        store.data[0] = (0u8..16).collect();
        store.data[1] = (16u8..32).collect();
        let mut chain = Chain::new(vec![0, 1], 16, Some(20));
        let all = chain.read_all(&mut store).unwrap();
        assert_eq!(all.len(), 20);
        assert_eq!(all[19], 19);
        assert_eq!(chain.read(&mut store, 4).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn cross_link_read_concatenates() {
        let mut store = VecStore::new(8, 2, 2);
        store.data[0] = vec![1; 8];
        store.data[1] = vec![2; 8];
        let mut chain = Chain::new(vec![0, 1], 8, None);
        chain.seek(&mut store, SeekFrom::Start(6)).unwrap();
        assert_eq!(chain.read(&mut store, 4).unwrap(), vec![1, 1, 2, 2]);
    }

    #[test]
    fn partial_link_write_preserves_old_bytes() {
        let mut store = VecStore::new(8, 1, 1);
        store.data[0] = vec![9; 8];
        let mut chain = Chain::new(vec![0], 8, None);
        chain.seek(&mut store, SeekFrom::Start(3)).unwrap();
        chain.write(&mut store, &[7, 7]).unwrap();
        chain.flush(&mut store).unwrap();
        assert_eq!(store.data[0], vec![9, 9, 9, 7, 7, 9, 9, 9]);
    }

    #[test]
    fn full_link_write_skips_the_read_back() {
        let mut store = VecStore::new(8, 1, 1);
        let mut chain = Chain::new(vec![0], 8, None);
        chain.write(&mut store, &[1; 8]).unwrap();
        chain.flush(&mut store).unwrap();
        assert_eq!(store.reads, 0);
        assert_eq!(store.data[0], vec![1; 8]);
    }

    #[test]
    fn boundary_crossing_flushes_the_previous_link() {
        let mut store = VecStore::new(4, 2, 2);
        let mut chain = Chain::new(vec![0, 1], 4, None);
        chain.write(&mut store, &[5; 6]).unwrap();
        // link 0 was complete and must already be on the store
        assert_eq!(store.data[0], vec![5; 4]);
        chain.flush(&mut store).unwrap();
        assert_eq!(store.data[1], vec![5, 5, 0, 0]);
    }

    #[test]
    fn writes_grow_through_the_allocator() {
        let mut store = VecStore::new(4, 0, 4);
        let mut chain = Chain::new(Vec::new(), 4, None);
        chain.write(&mut store, &[3; 10]).unwrap();
        chain.flush(&mut store).unwrap();
        assert_eq!(chain.link_count(), 3);
        assert_eq!(chain.total_length(), 10);
        chain.seek(&mut store, SeekFrom::Start(0)).unwrap();
        assert_eq!(chain.read_all(&mut store).unwrap(), vec![3; 10]);
    }

    #[test]
    fn exhausted_allocator_is_no_space() {
        let mut store = VecStore::new(4, 0, 0);
        let mut chain = Chain::new(Vec::new(), 4, None);
        assert!(matches!(
            chain.write(&mut store, &[1; 4]),
            Err(FsError::NoSpace)
        ));
    }

    #[test]
    fn total_length_grows_to_the_cursor() {
        let mut store = VecStore::new(8, 1, 1);
        let mut chain = Chain::new(vec![0], 8, Some(2));
        assert_eq!(chain.total_length(), 2);
        chain.seek(&mut store, SeekFrom::Start(2)).unwrap();
        chain.write(&mut store, &[1, 2, 3]).unwrap();
        assert_eq!(chain.total_length(), 5);
        chain.flush(&mut store).unwrap();
        chain.seek(&mut store, SeekFrom::Start(0)).unwrap();
        assert_eq!(chain.read_all(&mut store).unwrap(), vec![0, 0, 1, 2, 3]);
    }

    #[test]
    fn seek_from_end_lands_inside_the_limit() {
        let mut store = VecStore::new(8, 1, 1);
        store.data[0] = (0u8..8).collect();
        let mut chain = Chain::new(vec![0], 8, Some(6));
        chain.seek(&mut store, SeekFrom::End(-2)).unwrap();
        assert_eq!(chain.read(&mut store, 10).unwrap(), vec![4, 5]);
    }
}
