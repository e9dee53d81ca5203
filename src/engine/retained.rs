use ahash::AHashSet;
use log::debug;

use crate::cache::CacheDirectory;
use crate::engine::{ProgressListener, FRONTIER_PAGE};
use crate::errors::HprofRetainError;
use crate::heap::HeapSource;
use crate::maps::HashIntMap;
use crate::object_table::{ObjectTable, FLAG_GC_ROOT, FLAG_REF_LIST, FLAG_TREE};
use crate::paged::{PagedIntStream, PagedStream};
use crate::reference_list::ReferenceList;

// Pending-counter value marking an already queued entry.
const QUEUED: u32 = u32::MAX;

/// Bottom-up propagation of retained sizes along dominator edges.
///
/// One pass over the table initialises every reachable object's retained
/// size to its shallow size and counts dominator children into per-ancestor
/// pending counters. The queue starts from the leaves stream, completed by
/// every other reachable object without dominator children, and flows upward
/// level by level: an ancestor is queued once all of its children have been
/// folded into it. Deep-path objects ride the same loop; nothing here
/// recurses.
pub struct RetainedSizeEngine<'a, S: HeapSource> {
    source: &'a S,
    table: &'a mut ObjectTable,
    refs: &'a mut ReferenceList,
    dominators: &'a HashIntMap,
    root_set: &'a AHashSet<u32>,
    progress: &'a dyn ProgressListener,
}

impl<'a, S: HeapSource> RetainedSizeEngine<'a, S> {
    pub fn new(
        source: &'a S,
        table: &'a mut ObjectTable,
        refs: &'a mut ReferenceList,
        dominators: &'a HashIntMap,
        root_set: &'a AHashSet<u32>,
        progress: &'a dyn ProgressListener,
    ) -> RetainedSizeEngine<'a, S> {
        RetainedSizeEngine {
            source,
            table,
            refs,
            dominators,
            root_set,
            progress,
        }
    }

    pub fn run(
        mut self,
        leaves: &mut PagedIntStream,
        cache_dir: &CacheDirectory,
    ) -> Result<(), HprofRetainError> {
        let count = self.table.count();
        let mut pending: Vec<u32> = vec![0; count as usize + 1];

        for index in 1..=count {
            if !self.is_reachable(index) {
                continue;
            }
            let offset = self.table.file_offset(index);
            let shallow = self.source.object_at(offset)?.shallow_size;
            self.table.set_retained_size(index, shallow);
            let dom = self.idom_of(index)?;
            if dom != 0 {
                pending[dom as usize] += 1;
            }
        }

        let mut read_frontier: PagedIntStream = PagedStream::new(FRONTIER_PAGE, cache_dir);
        let mut write_frontier: PagedIntStream = PagedStream::new(FRONTIER_PAGE, cache_dir);

        // seed with the recorded leaves, then with every other reachable
        // object that has no dominator children
        leaves.start_reading()?;
        loop {
            let index = leaves.read()?;
            if index == 0 {
                break;
            }
            if pending[index as usize] == 0 {
                write_frontier.write(index)?;
                pending[index as usize] = QUEUED;
            }
        }
        for index in 1..=count {
            if self.is_reachable(index) && pending[index as usize] == 0 {
                write_frontier.write(index)?;
                pending[index as usize] = QUEUED;
            }
        }

        let mut processed = 0u64;
        while write_frontier.has_data() {
            std::mem::swap(&mut read_frontier, &mut write_frontier);
            read_frontier.start_reading()?;
            write_frontier.reset()?;
            loop {
                let index = read_frontier.read()?;
                if index == 0 {
                    break;
                }
                processed += 1;
                self.progress.progress(processed, count as u64);
                // a finalized single-parent object hangs off its dominator
                // by its only reference chain
                if self.table.has_flag(index, FLAG_GC_ROOT)
                    && !self.table.has_flag(index, FLAG_REF_LIST)
                {
                    self.table.add_flag(index, FLAG_TREE);
                }
                let dom = self.idom_of(index)?;
                if dom == 0 {
                    continue;
                }
                let size = self.table.retained_size(index);
                let folded = self.table.retained_size(dom) + size;
                self.table.set_retained_size(dom, folded);
                let slot = &mut pending[dom as usize];
                debug_assert!(*slot != 0 && *slot != QUEUED);
                *slot -= 1;
                if *slot == 0 {
                    write_frontier.write(dom)?;
                    *slot = QUEUED;
                }
            }
        }
        read_frontier.delete()?;
        write_frontier.delete()?;
        debug!("retained sizes propagated through {processed} objects");
        Ok(())
    }

    fn is_reachable(&self, index: u32) -> bool {
        self.table.has_flag(index, FLAG_GC_ROOT) || self.root_set.contains(&index)
    }

    fn idom_of(&mut self, index: u32) -> Result<u32, HprofRetainError> {
        if let Some(dom) = self.dominators.get(index) {
            return Ok(dom);
        }
        self.table.nearest_root_pointer(index, self.refs)
    }
}
