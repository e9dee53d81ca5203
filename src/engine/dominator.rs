use ahash::AHashSet;
use log::debug;

use crate::errors::HprofRetainError;
use crate::heap::{HeapSource, ObjectKind};
use crate::lru::BoundedLruCache;
use crate::maps::HashIntMap;
use crate::object_table::ObjectTable;
use crate::paged::PagedIntStream;
use crate::reference_list::ReferenceList;

// Requeue children eagerly while the dirty set is small, or once it has
// stopped changing size for a few passes.
const ADDITIONAL_IDS_THRESHOLD: usize = 30;
const ADDITIONAL_IDS_THRESHOLD_DIRTYSET_SAME_SIZE: u32 = 5;
const NEAREST_ROOT_CACHE_SIZE: usize = 400_000;

/// Iterative intersection-based dominator computation over the
/// multiple-parents stream.
///
/// Only multi-parent objects need a computed dominator; everyone else's
/// immediate dominator is their single parent, already installed as the
/// nearest-root pointer. The fixed point alternates sweep direction between
/// the stream and its reversal, tracks entries whose dominator changed in a
/// dirty set to skip settled ones, and finishes with one full pass that
/// ignores the dirty heuristic.
pub struct DominatorEngine<'a, S: HeapSource> {
    source: &'a S,
    table: &'a mut ObjectTable,
    refs: &'a mut ReferenceList,
    map: HashIntMap,
    multiple_parents: PagedIntStream,
    reversed: PagedIntStream,
    reading_reversed: bool,
    dirty_set_same_size: u32,
    root_cache: BoundedLruCache<u32, u32>,
    left_chain: AHashSet<u32>,
    right_chain: AHashSet<u32>,
}

impl<'a, S: HeapSource> DominatorEngine<'a, S> {
    pub fn new(
        source: &'a S,
        table: &'a mut ObjectTable,
        refs: &'a mut ReferenceList,
        mut multiple_parents: PagedIntStream,
    ) -> Result<DominatorEngine<'a, S>, HprofRetainError> {
        let reversed = multiple_parents.reverse()?;
        let map = HashIntMap::with_capacity(multiple_parents.size() as usize);
        Ok(DominatorEngine {
            source,
            table,
            refs,
            map,
            multiple_parents,
            reversed,
            reading_reversed: false,
            dirty_set_same_size: 0,
            root_cache: BoundedLruCache::new(NEAREST_ROOT_CACHE_SIZE),
            left_chain: AHashSet::new(),
            right_chain: AHashSet::new(),
        })
    }

    /// Runs the fixed point, installs the computed dominators into the
    /// object records, and hands back the dominator map together with the
    /// multiple-parents stream (whose backing file outlives the engine).
    pub fn run(mut self) -> Result<(HashIntMap, PagedIntStream), HprofRetainError> {
        let mut changed = true;
        let mut dirty: AHashSet<u32> = AHashSet::new();
        let mut new_dirty: AHashSet<u32> = AHashSet::new();
        let mut additional: Vec<u32> = Vec::new();
        let mut passes = 0u64;
        loop {
            if self.reading_reversed {
                self.reversed.start_reading()?;
            } else {
                self.multiple_parents.start_reading()?;
            }
            let ignore_dirty = !changed;
            changed = self.compute_one_pass(ignore_dirty, &dirty, &mut new_dirty, &mut additional)?;
            passes += 1;
            std::mem::swap(&mut dirty, &mut new_dirty);
            new_dirty.clear();
            self.switch_parents();
            if !changed && ignore_dirty {
                break;
            }
        }
        debug!(
            "dominators converged after {passes} passes over {} multi-parent entries",
            self.map.len()
        );
        for (index, dom) in self.map.iter() {
            if dom != 0 {
                self.table.set_nearest_root_pointer(index, dom, self.refs)?;
            }
        }
        self.reversed.delete()?;
        Ok((self.map, self.multiple_parents))
    }

    fn read_current(&mut self) -> Result<u32, HprofRetainError> {
        if self.reading_reversed {
            self.reversed.read()
        } else {
            self.multiple_parents.read()
        }
    }

    fn switch_parents(&mut self) {
        self.reading_reversed = !self.reading_reversed;
    }

    fn compute_one_pass(
        &mut self,
        ignore_dirty: bool,
        dirty: &AHashSet<u32>,
        new_dirty: &mut AHashSet<u32>,
        additional: &mut Vec<u32>,
    ) -> Result<bool, HprofRetainError> {
        additional.clear();
        let mut additional_pos = 0;
        let mut changed = false;
        loop {
            let mut index = self.read_current()?;
            if index == 0 {
                // end of stream: drain the requeued entries, then stop
                if additional_pos >= additional.len() {
                    break;
                }
                index = additional[additional_pos];
                additional_pos += 1;
            }
            let old = self.map.get(index);
            let process = match old {
                None => true,
                Some(old_dom) => {
                    old_dom != 0
                        && (ignore_dirty || dirty.contains(&old_dom) || dirty.contains(&index))
                }
            };
            if !process {
                continue;
            }
            let mut parents = self.table.parents(index, self.refs)?;
            let mut new_idom = parents.next(self.refs)?;
            loop {
                let parent = parents.next(self.refs)?;
                if parent == 0 || new_idom == 0 {
                    break;
                }
                new_idom = self.intersect(new_idom, parent)?;
            }
            match old {
                None => {
                    self.map.put(index, new_idom)?;
                    if new_idom != 0 {
                        new_dirty.insert(new_idom);
                    }
                    changed = true;
                }
                Some(old_idom) if old_idom != new_idom => {
                    new_dirty.insert(old_idom);
                    if new_idom != 0 {
                        new_dirty.insert(new_idom);
                    }
                    self.map.put(index, new_idom)?;
                    if dirty.len() < ADDITIONAL_IDS_THRESHOLD
                        || self.dirty_set_same_size >= ADDITIONAL_IDS_THRESHOLD_DIRTYSET_SAME_SIZE
                    {
                        self.enqueue_children(index, additional)?;
                    }
                    changed = true;
                }
                _ => {}
            }
        }
        if dirty.len() != new_dirty.len() {
            self.dirty_set_same_size = 0;
        } else {
            self.dirty_set_same_size += 1;
        }
        Ok(changed)
    }

    /// Current dominator estimate: the map entry for multi-parent objects,
    /// the nearest-root pointer for everyone else.
    fn idom_of(&mut self, index: u32) -> Result<u32, HprofRetainError> {
        if let Some(dom) = self.map.get(index) {
            return Ok(dom);
        }
        if let Some(&cached) = self.root_cache.get(&index) {
            return Ok(cached);
        }
        let pointer = self.table.nearest_root_pointer(index, self.refs)?;
        self.root_cache.insert(index, pointer, |_| false);
        Ok(pointer)
    }

    fn intersect(&mut self, a: u32, b: u32) -> Result<u32, HprofRetainError> {
        if a == b {
            return Ok(a);
        }
        if a == 0 || b == 0 {
            return Ok(0);
        }
        let mut left_chain = std::mem::take(&mut self.left_chain);
        let mut right_chain = std::mem::take(&mut self.right_chain);
        left_chain.clear();
        right_chain.clear();
        let result = self.intersect_walk(a, b, &mut left_chain, &mut right_chain);
        self.left_chain = left_chain;
        self.right_chain = right_chain;
        result
    }

    // Walks upward from both nodes along the current dominator estimates,
    // keeping the visited chain of each side, until one side lands on a node
    // the other already passed. Explicit loops, no recursion.
    fn intersect_walk(
        &mut self,
        a: u32,
        b: u32,
        left_chain: &mut AHashSet<u32>,
        right_chain: &mut AHashSet<u32>,
    ) -> Result<u32, HprofRetainError> {
        let mut left = a;
        let mut right = b;
        left_chain.insert(left);
        right_chain.insert(right);
        loop {
            if left == 0 && right == 0 {
                return Ok(0);
            }
            if left != 0 {
                left = self.idom_of(left)?;
                if left != 0 {
                    if right_chain.contains(&left) {
                        return Ok(left);
                    }
                    if !left_chain.insert(left) {
                        // revisited: this side cycles without a meet
                        left = 0;
                    }
                }
            }
            if right != 0 {
                right = self.idom_of(right)?;
                if right != 0 {
                    if left_chain.contains(&right) {
                        return Ok(right);
                    }
                    if !right_chain.insert(right) {
                        right = 0;
                    }
                }
            }
        }
    }

    // A changed dominator may invalidate the estimates of the node's
    // multi-parent children; requeue them for this same pass.
    fn enqueue_children(
        &mut self,
        index: u32,
        additional: &mut Vec<u32>,
    ) -> Result<(), HprofRetainError> {
        let offset = self.table.file_offset(index);
        if offset == 0 {
            return Ok(());
        }
        let object = self.source.object_at(offset)?;
        let targets = match &object.kind {
            ObjectKind::Instance { field_refs } => field_refs.as_slice(),
            ObjectKind::ObjectArray { elements } => elements.as_slice(),
            ObjectKind::ClassObject { static_refs } => static_refs.as_slice(),
            ObjectKind::PrimitiveArray => [].as_slice(),
        };
        for &target_id in targets {
            if target_id == 0 {
                continue;
            }
            let child = self.table.index_of(target_id);
            if child == 0 {
                continue;
            }
            if let Some(dom) = self.map.get(child) {
                if dom != 0 {
                    additional.push(child);
                }
            }
        }
        Ok(())
    }
}
