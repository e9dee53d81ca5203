use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ahash::AHashSet;
use log::warn;
use memmap2::MmapMut;

use crate::cache::CacheDirectory;
use crate::errors::HprofRetainError;
use crate::lru::BoundedLruCache;

const VALUES_PER_BLOCK: usize = 3;
const LINK_SLOT: usize = VALUES_PER_BLOCK;
pub const BLOCK_SIZE: usize = 16;
const MAX_BLOCKS: u32 = 1 << 29;
const BLOCK_CACHE_CAPACITY: usize = 10_000;
const DIRTY_FLUSH_LIMIT: usize = 10_000;
const FLUSH_CHUNK_BLOCKS: usize = 1024;

/// Disk-backed store of "lists of ints": incoming-reference indexes chained
/// through fixed 16-byte blocks of three value slots plus a next-block link.
/// Block 0 is reserved as the null list.
///
/// Recently touched blocks sit in a bounded LRU whose eviction refuses dirty
/// entries; `flush` writes the dirty set out in sorted, coalesced runs and
/// switches block storage to a file mapping for the lookups that follow.
pub struct ReferenceList {
    file: std::fs::File,
    path: PathBuf,
    blocks: u32,
    cache: BoundedLruCache<u32, [u8; BLOCK_SIZE]>,
    dirty: AHashSet<u32>,
    map: Option<MmapMut>,
}

/// Forward iteration state over one chain. The cursor owns a copy of the
/// current block, so it does not borrow the list between steps.
pub struct ReferenceCursor {
    block: [u8; BLOCK_SIZE],
    slot: usize,
    finished: bool,
}

fn read_value(block: &[u8; BLOCK_SIZE], slot: usize) -> u32 {
    let off = slot * 4;
    u32::from_le_bytes([block[off], block[off + 1], block[off + 2], block[off + 3]])
}

fn put_value(block: &mut [u8; BLOCK_SIZE], slot: usize, value: u32) {
    let off = slot * 4;
    block[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

impl ReferenceList {
    pub fn new(cache_dir: &CacheDirectory) -> Result<ReferenceList, HprofRetainError> {
        let path = cache_dir.create_temp_file("retain", ".ref")?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut list = ReferenceList {
            file,
            path,
            blocks: 0,
            cache: BoundedLruCache::new(BLOCK_CACHE_CAPACITY),
            dirty: AHashSet::new(),
            map: None,
        };
        // block 0 is the null list
        list.add_block()?;
        Ok(list)
    }

    /// Reopens a persisted data file in its flushed, mapped state.
    pub fn reopen(path: PathBuf, blocks: u32) -> Result<ReferenceList, HprofRetainError> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(blocks as u64 * BLOCK_SIZE as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(ReferenceList {
            file,
            path,
            blocks,
            cache: BoundedLruCache::new(BLOCK_CACHE_CAPACITY),
            dirty: AHashSet::new(),
            map: Some(map),
        })
    }

    /// Allocates a new block initialised with two values and returns its
    /// index.
    pub fn add_first(&mut self, first: u32, second: u32) -> Result<u32, HprofRetainError> {
        let index = self.add_block()?;
        self.write_value(index, 0, first)?;
        self.write_value(index, 1, second)?;
        Ok(index)
    }

    /// Appends `value` to the list starting at `head` and returns the new
    /// head index. A value already present in the head block is not
    /// duplicated. On overflow a fresh head block is chained in front, which
    /// inverts the group order of the chain.
    pub fn append(&mut self, head: u32, value: u32) -> Result<u32, HprofRetainError> {
        let block = self.block(head)?;
        for slot in 0..VALUES_PER_BLOCK {
            let el = read_value(&block, slot);
            if el == 0 {
                self.write_value(head, slot, value)?;
                return Ok(head);
            }
            if el == value {
                return Ok(head);
            }
        }
        let next = self.add_block()?;
        self.write_value(next, LINK_SLOT, head)?;
        self.write_value(next, 0, value)?;
        Ok(next)
    }

    /// Scans the chain for `value` and swaps it with the first slot of the
    /// head block. Installing the nearest-root (and later the dominator)
    /// pointer goes through here.
    pub fn swap_to_front(&mut self, head: u32, value: u32) -> Result<(), HprofRetainError> {
        let mut index = head;
        let mut moved = 0;
        loop {
            let block = self.block(index)?;
            for slot in 0..VALUES_PER_BLOCK {
                let el = read_value(&block, slot);
                if index == head && slot == 0 {
                    if el == value {
                        return Ok(());
                    }
                    moved = el;
                    self.write_value(index, 0, value)?;
                } else if el == 0 {
                    break;
                } else if el == value {
                    self.write_value(index, slot, moved)?;
                    return Ok(());
                }
            }
            index = read_value(&block, LINK_SLOT);
            if index == 0 {
                warn!("reference {value} not found at the end of the chain");
                return Ok(());
            }
        }
    }

    pub fn first(&mut self, head: u32) -> Result<u32, HprofRetainError> {
        let block = self.block(head)?;
        Ok(read_value(&block, 0))
    }

    pub fn cursor(&mut self, head: u32) -> Result<ReferenceCursor, HprofRetainError> {
        Ok(ReferenceCursor {
            block: self.block(head)?,
            slot: 0,
            finished: false,
        })
    }

    /// Next value in the chain, or 0 when exhausted.
    pub fn cursor_next(&mut self, cursor: &mut ReferenceCursor) -> Result<u32, HprofRetainError> {
        loop {
            if cursor.finished {
                return Ok(0);
            }
            if cursor.slot < VALUES_PER_BLOCK {
                let el = read_value(&cursor.block, cursor.slot);
                cursor.slot += 1;
                if el != 0 {
                    return Ok(el);
                }
                // a zero slot terminates the block early
            }
            let next = read_value(&cursor.block, LINK_SLOT);
            if next == 0 {
                cursor.finished = true;
                return Ok(0);
            }
            cursor.block = self.block(next)?;
            cursor.slot = 0;
        }
    }

    pub fn collect(&mut self, head: u32) -> Result<Vec<u32>, HprofRetainError> {
        let mut cursor = self.cursor(head)?;
        let mut values = Vec::new();
        loop {
            let el = self.cursor_next(&mut cursor)?;
            if el == 0 {
                return Ok(values);
            }
            values.push(el);
        }
    }

    /// Writes out every dirty block and converts block storage to a file
    /// mapping. Later writes (the dominator installs) go through the map.
    pub fn flush(&mut self) -> Result<(), HprofRetainError> {
        self.flush_dirty()?;
        self.cache.clear();
        self.file
            .set_len(self.blocks as u64 * BLOCK_SIZE as u64)?;
        self.map = Some(unsafe { MmapMut::map_mut(&self.file)? });
        Ok(())
    }

    pub fn block_count(&self) -> u32 {
        self.blocks
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync(&self) -> Result<(), HprofRetainError> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }

    pub fn delete(mut self) -> Result<(), HprofRetainError> {
        self.map = None;
        if self.path.is_file() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn add_block(&mut self) -> Result<u32, HprofRetainError> {
        if self.blocks >= MAX_BLOCKS {
            return Err(HprofRetainError::capacity(
                "reference list reached its 2^29 block ceiling",
            ));
        }
        let index = self.blocks;
        self.blocks += 1;
        let dirty = &self.dirty;
        self.cache
            .insert(index, [0u8; BLOCK_SIZE], |k| dirty.contains(k));
        self.dirty.insert(index);
        if self.dirty.len() > DIRTY_FLUSH_LIMIT {
            self.flush_dirty()?;
        }
        Ok(index)
    }

    fn block(&mut self, index: u32) -> Result<[u8; BLOCK_SIZE], HprofRetainError> {
        let offset = index as u64 * BLOCK_SIZE as u64;
        if let Some(map) = &self.map {
            if offset + BLOCK_SIZE as u64 <= map.len() as u64 {
                let mut block = [0u8; BLOCK_SIZE];
                block.copy_from_slice(&map[offset as usize..offset as usize + BLOCK_SIZE]);
                return Ok(block);
            }
        }
        if let Some(block) = self.cache.get(&index) {
            return Ok(*block);
        }
        let mut block = [0u8; BLOCK_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut block)?;
        let dirty = &self.dirty;
        self.cache.insert(index, block, |k| dirty.contains(k));
        Ok(block)
    }

    fn write_value(
        &mut self,
        index: u32,
        slot: usize,
        value: u32,
    ) -> Result<(), HprofRetainError> {
        let offset = index as u64 * BLOCK_SIZE as u64;
        if let Some(map) = &mut self.map {
            if offset + BLOCK_SIZE as u64 <= map.len() as u64 {
                let off = offset as usize + slot * 4;
                map[off..off + 4].copy_from_slice(&value.to_le_bytes());
                return Ok(());
            }
        }
        let mut block = self.block(index)?;
        put_value(&mut block, slot, value);
        let dirty = &self.dirty;
        self.cache.insert(index, block, |k| dirty.contains(k));
        self.dirty.insert(index);
        if self.dirty.len() > DIRTY_FLUSH_LIMIT {
            self.flush_dirty()?;
        }
        Ok(())
    }

    // Sorted, coalesced writeback of the dirty set.
    fn flush_dirty(&mut self) -> Result<(), HprofRetainError> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let mut indices: Vec<u32> = self.dirty.drain().collect();
        indices.sort_unstable();
        let mut chunk = vec![0u8; FLUSH_CHUNK_BLOCKS * BLOCK_SIZE];
        let mut data_len = 0usize;
        let mut chunk_offset = 0u64;
        for index in indices {
            let block = *self.cache.get(&index).ok_or_else(|| {
                HprofRetainError::malformed(format!("dirty block {index} missing from cache"))
            })?;
            let block_offset = index as u64 * BLOCK_SIZE as u64;
            if chunk_offset + data_len as u64 == block_offset
                && data_len <= chunk.len() - BLOCK_SIZE
            {
                chunk[data_len..data_len + BLOCK_SIZE].copy_from_slice(&block);
                data_len += BLOCK_SIZE;
            } else {
                self.file.seek(SeekFrom::Start(chunk_offset))?;
                self.file.write_all(&chunk[..data_len])?;
                chunk[..BLOCK_SIZE].copy_from_slice(&block);
                data_len = BLOCK_SIZE;
                chunk_offset = block_offset;
            }
        }
        self.file.seek(SeekFrom::Start(chunk_offset))?;
        self.file.write_all(&chunk[..data_len])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_list() -> (tempfile::TempDir, ReferenceList) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheDirectory::persistent(tmp.path()).unwrap();
        let list = ReferenceList::new(&cache).unwrap();
        (tmp, list)
    }

    #[test]
    fn first_block_holds_three_values() {
        let (_tmp, mut list) = new_list();
        let head = list.add_first(1, 2).unwrap();
        assert_eq!(list.first(head).unwrap(), 1);
        assert_eq!(list.append(head, 3).unwrap(), head);
        assert_eq!(list.collect(head).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn append_deduplicates_within_the_head_block() {
        let (_tmp, mut list) = new_list();
        let head = list.add_first(1, 2).unwrap();
        assert_eq!(list.append(head, 2).unwrap(), head);
        assert_eq!(list.collect(head).unwrap(), vec![1, 2]);
    }

    #[test]
    fn overflow_chains_a_new_head_in_front() {
        let (_tmp, mut list) = new_list();
        let head = list.add_first(1, 2).unwrap();
        list.append(head, 3).unwrap();
        let new_head = list.append(head, 4).unwrap();
        assert_ne!(new_head, head);
        // most recent group first, insertion order inside a group
        assert_eq!(list.collect(new_head).unwrap(), vec![4, 1, 2, 3]);
        let newer = list.append(new_head, 5).unwrap();
        assert_eq!(newer, new_head);
        assert_eq!(list.collect(new_head).unwrap(), vec![4, 5, 1, 2, 3]);
    }

    #[test]
    fn swap_to_front_installs_a_specific_first_element() {
        let (_tmp, mut list) = new_list();
        let head = list.add_first(1, 2).unwrap();
        list.append(head, 3).unwrap();
        let head = list.append(head, 4).unwrap();
        list.swap_to_front(head, 2).unwrap();
        assert_eq!(list.first(head).unwrap(), 2);
        let mut values = list.collect(head).unwrap();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3, 4]);
        // already in front: no change
        list.swap_to_front(head, 2).unwrap();
        assert_eq!(list.first(head).unwrap(), 2);
    }

    #[test]
    fn flush_then_read_through_the_mapping() {
        let (_tmp, mut list) = new_list();
        let mut heads = Vec::new();
        for i in 0..200u32 {
            let head = list.add_first(i * 10 + 1, i * 10 + 2).unwrap();
            heads.push((head, i));
        }
        list.flush().unwrap();
        for &(head, i) in &heads {
            assert_eq!(
                list.collect(head).unwrap(),
                vec![i * 10 + 1, i * 10 + 2]
            );
        }
        // writes after flush go through the mapping
        let (head, _) = heads[0];
        list.swap_to_front(head, 2).unwrap();
        assert_eq!(list.first(head).unwrap(), 2);
    }

    #[test]
    fn survives_many_blocks_past_the_cache_capacity() {
        let (_tmp, mut list) = new_list();
        // enough blocks to trip both the dirty-set flush and LRU eviction
        let mut head = list.add_first(1, 2).unwrap();
        for v in 3..=40_000u32 {
            head = list.append(head, v).unwrap();
        }
        let mut values = list.collect(head).unwrap();
        values.sort_unstable();
        assert_eq!(values, (1..=40_000).collect::<Vec<_>>());
    }
}
