use ahash::AHashSet;
use log::{debug, warn};

use crate::cache::CacheDirectory;
use crate::engine::{ProgressListener, DEEP_LEVEL, FRONTIER_PAGE, MULTI_PARENTS_PAGE};
use crate::errors::HprofRetainError;
use crate::heap::{ClassId, HeapSource, ObjectKind, ReferentFilter};
use crate::object_table::{ObjectTable, FLAG_DEEP, FLAG_GC_ROOT, FLAG_TREE};
use crate::paged::{PagedIntStream, PagedLongStream, PagedStream};
use crate::reference_list::ReferenceList;

/// Streams produced by the reachability pass, consumed by the dominator and
/// retained-size engines and persisted with the analysis.
pub struct NearestRootOutput {
    pub leaves: PagedIntStream,
    pub multiple_parents: PagedIntStream,
    pub deep_paths: PagedIntStream,
    pub levels: u64,
}

/// Levelised breadth-first traversal from the GC-root set.
///
/// Each level reads object file-offsets from one frontier and writes the
/// next level into the other, swapping the two streams between levels. For
/// every enumerated edge the source is recorded as an incoming reference on
/// the target; an unclaimed target is claimed by installing its nearest-root
/// pointer and queueing it. Referent edges of soft/weak/final/phantom
/// references are never followed.
pub struct NearestRootEngine<'a, S: HeapSource> {
    source: &'a S,
    table: &'a mut ObjectTable,
    refs: &'a mut ReferenceList,
    filter: &'a ReferentFilter,
    root_list: &'a [u32],
    root_set: &'a AHashSet<u32>,
    read_frontier: PagedLongStream,
    write_frontier: PagedLongStream,
    leaves: PagedIntStream,
    multiple_parents: PagedIntStream,
    deep_paths: PagedIntStream,
    processed_classes: AHashSet<ClassId>,
    level: u64,
    processed: u64,
    total: u64,
    progress: &'a dyn ProgressListener,
}

impl<'a, S: HeapSource> NearestRootEngine<'a, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &'a S,
        table: &'a mut ObjectTable,
        refs: &'a mut ReferenceList,
        filter: &'a ReferentFilter,
        root_list: &'a [u32],
        root_set: &'a AHashSet<u32>,
        cache_dir: &CacheDirectory,
        progress: &'a dyn ProgressListener,
    ) -> NearestRootEngine<'a, S> {
        let total = table.count() as u64;
        NearestRootEngine {
            source,
            table,
            refs,
            filter,
            root_list,
            root_set,
            read_frontier: PagedStream::new(FRONTIER_PAGE, cache_dir),
            write_frontier: PagedStream::new(FRONTIER_PAGE, cache_dir),
            leaves: PagedStream::new(FRONTIER_PAGE, cache_dir),
            multiple_parents: PagedStream::new(MULTI_PARENTS_PAGE, cache_dir),
            deep_paths: PagedStream::new(FRONTIER_PAGE, cache_dir),
            processed_classes: AHashSet::new(),
            level: 0,
            processed: 0,
            total,
            progress,
        }
    }

    pub fn run(mut self) -> Result<NearestRootOutput, HprofRetainError> {
        self.fill_zero_level()?;
        loop {
            self.switch_buffers()?;
            self.compute_one_level()?;
            if !self.write_frontier.has_data() {
                break;
            }
        }
        debug!(
            "gc roots computed: {} levels, {} multi-parent entries, {} leaves",
            self.level,
            self.multiple_parents.size(),
            self.leaves.size()
        );
        self.read_frontier.delete()?;
        self.write_frontier.delete()?;
        Ok(NearestRootOutput {
            leaves: self.leaves,
            multiple_parents: self.multiple_parents,
            deep_paths: self.deep_paths,
            levels: self.level,
        })
    }

    fn fill_zero_level(&mut self) -> Result<(), HprofRetainError> {
        for &root in self.root_list {
            let offset = self.table.file_offset(root);
            if offset != 0 {
                self.write_frontier.write(offset)?;
            }
        }
        Ok(())
    }

    fn switch_buffers(&mut self) -> Result<(), HprofRetainError> {
        std::mem::swap(&mut self.read_frontier, &mut self.write_frontier);
        self.read_frontier.start_reading()?;
        self.write_frontier.reset()
    }

    fn compute_one_level(&mut self) -> Result<(), HprofRetainError> {
        self.level += 1;
        loop {
            let offset = self.read_frontier.read()?;
            if offset == 0 {
                // end of level
                break;
            }
            self.processed += 1;
            self.progress.progress(self.processed, self.total);
            let object = self.source.object_at(offset)?;
            let index = self.table.index_of(object.object_id);
            if index == 0 {
                warn!("no table record for object {:#x}", object.object_id);
                continue;
            }
            let mut has_values = false;
            match object.kind {
                ObjectKind::PrimitiveArray => {
                    self.write_leaf(index, object.shallow_size)?;
                }
                ObjectKind::ObjectArray { elements } => {
                    for element in elements {
                        if self.write_connection(index, element, false, false)? {
                            has_values = true;
                        }
                    }
                    if !has_values {
                        self.write_leaf(index, object.shallow_size)?;
                    }
                }
                ObjectKind::Instance { field_refs } => {
                    let mut class_referenced = false;
                    for (slot, &target) in field_refs.iter().enumerate() {
                        // skip the soft/weak/final/phantom referent edge
                        if self.filter.skips(object.class_id, slot) {
                            continue;
                        }
                        if target == object.class_id {
                            class_referenced = true;
                        }
                        if self.write_connection(index, target, false, false)? {
                            has_values = true;
                        }
                    }
                    if self.write_class_connection(index, object.class_id, class_referenced)? {
                        has_values = true;
                    }
                    if !has_values {
                        self.write_leaf(index, object.shallow_size)?;
                    }
                }
                ObjectKind::ClassObject { static_refs } => {
                    for target in static_refs {
                        if self.write_connection(index, target, false, false)? {
                            has_values = true;
                        }
                    }
                    if !has_values {
                        self.write_leaf(index, object.shallow_size)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Publishes the instance→class edge once per class.
    fn write_class_connection(
        &mut self,
        index: u32,
        class_id: ClassId,
        already_referenced: bool,
    ) -> Result<bool, HprofRetainError> {
        if self.processed_classes.contains(&class_id) {
            return Ok(false);
        }
        self.processed_classes.insert(class_id);
        self.write_connection(index, class_id, true, already_referenced)
    }

    /// Processes one edge from the object at `index` to `target_id`. Returns
    /// true when the edge reaches an object that exists in the table (for
    /// class edges: only when the target was newly claimed), which is what
    /// keeps the source from being treated as a leaf.
    fn write_connection(
        &mut self,
        index: u32,
        target_id: u64,
        class_edge: bool,
        skip_record: bool,
    ) -> Result<bool, HprofRetainError> {
        if target_id == 0 {
            return Ok(false);
        }
        let target = self.table.index_of(target_id);
        if target == 0 {
            return Ok(false);
        }
        if !skip_record {
            let became_multi = self.table.add_reference(target, index, self.refs)?;
            if became_multi && !self.root_set.contains(&target) {
                self.multiple_parents.write(target)?;
            }
        }
        if self.root_set.contains(&target) || self.table.has_flag(target, FLAG_GC_ROOT) {
            return Ok(!class_edge);
        }
        self.write_frontier.write(self.table.file_offset(target))?;
        if self.level > DEEP_LEVEL {
            self.deep_paths.write(target)?;
            self.table.add_flag(target, FLAG_DEEP);
        }
        self.table.set_nearest_root_pointer(target, index, self.refs)?;
        Ok(true)
    }

    fn write_leaf(&mut self, index: u32, shallow_size: u64) -> Result<(), HprofRetainError> {
        self.table.add_flag(index, FLAG_TREE);
        self.table.set_retained_size(index, shallow_size);
        self.leaves.write(index)
    }
}
