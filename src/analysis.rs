use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use ahash::{AHashMap, AHashSet};
use log::debug;
use nom::bytes::complete::tag;
use nom::multi::count;
use nom::number::complete::{le_u16, le_u32, le_u64, le_u8};
use nom::sequence::pair;
use nom::IResult;

use crate::cache::CacheDirectory;
use crate::engine::dominator::DominatorEngine;
use crate::engine::nearest_root::NearestRootEngine;
use crate::engine::retained::RetainedSizeEngine;
use crate::engine::{NullProgress, ProgressListener, FRONTIER_PAGE, MULTI_PARENTS_PAGE};
use crate::errors::HprofRetainError;
use crate::heap::{ClassId, ClassKind, ClassTable, HeapSource, ObjectId, ReferentFilter};
use crate::maps::{DenseIntMap, HashIntMap};
use crate::object_table::ObjectTable;
use crate::paged::{PagedIntStream, PagedStream};
use crate::reference_list::ReferenceList;
use crate::snapshot::{parse_utf8, run};

const AUX_MAGIC: &[u8; 4] = b"HRAN";
const AUX_VERSION: u16 = 1;

/// Counters for the end-of-run summary.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisStats {
    pub object_count: u64,
    pub class_count: usize,
    pub gc_root_count: usize,
    pub multi_parent_count: u64,
    pub leaf_count: u64,
    pub deep_count: u64,
    pub reference_blocks: u32,
}

struct AnalysisInner {
    table: ObjectTable,
    refs: ReferenceList,
    root_list: Vec<u32>,
    root_set: AHashSet<u32>,
    leaves: Option<PagedIntStream>,
    multiple_parents: Option<PagedIntStream>,
    deep_paths: Option<PagedIntStream>,
    dominators: Option<HashIntMap>,
    can_contain_cache: AHashMap<ClassId, bool>,
    gc_roots_computed: bool,
    dominators_computed: bool,
    retained_computed: bool,
}

/// The analysis facade over one heap snapshot.
///
/// Owns the object table, reference list and inter-pass streams; runs the
/// three engines at most once each behind a mutex, so a first call computes
/// and every later (or concurrent) caller observes the completed state.
/// Queries trigger the passes they depend on.
pub struct HeapAnalysis<S: HeapSource> {
    source: S,
    cache: CacheDirectory,
    classes: ClassTable,
    filter: ReferentFilter,
    inner: Mutex<AnalysisInner>,
}

impl<S: HeapSource> HeapAnalysis<S> {
    /// Populates the object table from the source. The engine passes run
    /// lazily afterwards.
    pub fn build(
        source: S,
        cache: CacheDirectory,
        progress: &dyn ProgressListener,
    ) -> Result<HeapAnalysis<S>, HprofRetainError> {
        let classes = ClassTable::new(source.classes());
        let filter = ReferentFilter::discover(&classes)?;
        let mut table = ObjectTable::create(source.object_count(), source.id_size(), &cache)?;
        let refs = ReferenceList::new(&cache)?;
        let total = source.object_count();
        let mut done = 0u64;
        for entry in source.objects() {
            let (object_id, file_offset) = entry?;
            table.put(object_id, file_offset)?;
            done += 1;
            progress.progress(done, total);
        }
        let mut root_set = AHashSet::new();
        for &root_id in source.gc_roots() {
            let index = table.index_of(root_id);
            if index != 0 {
                root_set.insert(index);
            }
        }
        let mut root_list: Vec<u32> = root_set.iter().copied().collect();
        root_list.sort_unstable();
        debug!(
            "table populated: {} objects, {} gc roots, {} classes",
            table.count(),
            root_list.len(),
            classes.len()
        );
        Ok(HeapAnalysis {
            source,
            cache,
            classes,
            filter,
            inner: Mutex::new(AnalysisInner {
                table,
                refs,
                root_list,
                root_set,
                leaves: None,
                multiple_parents: None,
                deep_paths: None,
                dominators: None,
                can_contain_cache: AHashMap::new(),
                gc_roots_computed: false,
                dominators_computed: false,
                retained_computed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AnalysisInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn compute_gc_roots(&self, progress: &dyn ProgressListener) -> Result<(), HprofRetainError> {
        let mut guard = self.lock();
        self.ensure_gc_roots(&mut guard, progress)
    }

    pub fn compute_dominators(
        &self,
        progress: &dyn ProgressListener,
    ) -> Result<(), HprofRetainError> {
        let mut guard = self.lock();
        self.ensure_dominators(&mut guard, progress)
    }

    pub fn compute_retained_sizes(
        &self,
        progress: &dyn ProgressListener,
    ) -> Result<(), HprofRetainError> {
        let mut guard = self.lock();
        self.ensure_retained(&mut guard, progress)
    }

    fn ensure_gc_roots(
        &self,
        inner: &mut AnalysisInner,
        progress: &dyn ProgressListener,
    ) -> Result<(), HprofRetainError> {
        if inner.gc_roots_computed {
            return Ok(());
        }
        self.cache.set_dirty(true)?;
        let engine = NearestRootEngine::new(
            &self.source,
            &mut inner.table,
            &mut inner.refs,
            &self.filter,
            &inner.root_list,
            &inner.root_set,
            &self.cache,
            progress,
        );
        let output = engine.run()?;
        inner.refs.flush()?;
        inner.leaves = Some(output.leaves);
        inner.multiple_parents = Some(output.multiple_parents);
        inner.deep_paths = Some(output.deep_paths);
        inner.gc_roots_computed = true;
        Ok(())
    }

    fn ensure_dominators(
        &self,
        inner: &mut AnalysisInner,
        progress: &dyn ProgressListener,
    ) -> Result<(), HprofRetainError> {
        if inner.dominators_computed {
            return Ok(());
        }
        self.ensure_gc_roots(inner, progress)?;
        let stream = inner
            .multiple_parents
            .take()
            .ok_or_else(|| HprofRetainError::malformed("multiple-parents stream missing"))?;
        let engine = DominatorEngine::new(&self.source, &mut inner.table, &mut inner.refs, stream)?;
        let (map, stream) = engine.run()?;
        inner.multiple_parents = Some(stream);
        inner.dominators = Some(map);
        inner.dominators_computed = true;
        Ok(())
    }

    fn ensure_retained(
        &self,
        inner: &mut AnalysisInner,
        progress: &dyn ProgressListener,
    ) -> Result<(), HprofRetainError> {
        if inner.retained_computed {
            return Ok(());
        }
        self.ensure_dominators(inner, progress)?;
        let mut leaves = inner
            .leaves
            .take()
            .ok_or_else(|| HprofRetainError::malformed("leaves stream missing"))?;
        let dominators = inner
            .dominators
            .as_ref()
            .ok_or_else(|| HprofRetainError::malformed("dominator map missing"))?;
        let engine = RetainedSizeEngine::new(
            &self.source,
            &mut inner.table,
            &mut inner.refs,
            dominators,
            &inner.root_set,
            progress,
        );
        engine.run(&mut leaves, &self.cache)?;
        inner.leaves = Some(leaves);
        inner.retained_computed = true;
        Ok(())
    }

    fn idom_in(inner: &mut AnalysisInner, index: u32) -> Result<u32, HprofRetainError> {
        if let Some(map) = inner.dominators.as_ref() {
            if let Some(dom) = map.get(index) {
                return Ok(dom);
            }
        }
        inner.table.nearest_root_pointer(index, &mut inner.refs)
    }

    /// The GC root that keeps `object_id` alive, reached by following the
    /// nearest-root pointer chain; the null id when the object is unknown or
    /// unreachable. A root maps to itself.
    pub fn nearest_gc_root(&self, object_id: ObjectId) -> Result<ObjectId, HprofRetainError> {
        let mut guard = self.lock();
        let index = guard.table.index_of(object_id);
        if index == 0 {
            return Ok(0);
        }
        if guard.root_set.contains(&index) {
            return Ok(object_id);
        }
        self.ensure_gc_roots(&mut guard, &NullProgress)?;
        let inner = &mut *guard;
        let mut visited: AHashSet<u32> = AHashSet::new();
        let mut current = index;
        loop {
            let pointer = inner.table.nearest_root_pointer(current, &mut inner.refs)?;
            if pointer == 0 {
                return Ok(0);
            }
            if inner.root_set.contains(&pointer) {
                return Ok(inner.table.object_id(pointer));
            }
            if !visited.insert(pointer) {
                return Ok(0);
            }
            current = pointer;
        }
    }

    /// Immediate dominator of `object_id`; the null id for GC roots and
    /// unknown objects.
    pub fn immediate_dominator(&self, object_id: ObjectId) -> Result<ObjectId, HprofRetainError> {
        let mut guard = self.lock();
        let index = guard.table.index_of(object_id);
        if index == 0 || guard.root_set.contains(&index) {
            return Ok(0);
        }
        self.ensure_dominators(&mut guard, &NullProgress)?;
        let dom = Self::idom_in(&mut guard, index)?;
        Ok(guard.table.object_id(dom))
    }

    pub fn retained_size(&self, object_id: ObjectId) -> Result<u64, HprofRetainError> {
        let mut guard = self.lock();
        let index = guard.table.index_of(object_id);
        if index == 0 {
            return Ok(0);
        }
        self.ensure_retained(&mut guard, &NullProgress)?;
        Ok(guard.table.retained_size(index))
    }

    /// The `k` heaviest objects by retained size, heaviest first; ties break
    /// towards the smaller ObjectId.
    pub fn top_retainers(&self, k: usize) -> Result<Vec<ObjectId>, HprofRetainError> {
        let mut guard = self.lock();
        self.ensure_retained(&mut guard, &NullProgress)?;
        let mut heap: BinaryHeap<Reverse<RetainedEntry>> = BinaryHeap::with_capacity(k + 1);
        for index in 1..=guard.table.count() {
            let entry = RetainedEntry {
                retained: guard.table.retained_size(index),
                object_id: guard.table.object_id(index),
            };
            heap.push(Reverse(entry));
            if heap.len() > k {
                heap.pop();
            }
        }
        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(entry)| entry.object_id)
            .collect())
    }

    /// Whether any dominator ancestor of the instance is of class
    /// `class_id`. Primitive-array classes cannot retain anything; an
    /// instance class whose hierarchy holds no object field cannot retain
    /// another instance of itself.
    pub fn has_ancestor_of_class(
        &self,
        object_id: ObjectId,
        class_id: ClassId,
    ) -> Result<bool, HprofRetainError> {
        let mut guard = self.lock();
        let index = guard.table.index_of(object_id);
        if index == 0 {
            return Ok(false);
        }
        let Some(target_class) = self.classes.get(class_id) else {
            return Ok(false);
        };
        if target_class.kind == ClassKind::PrimitiveArray {
            return Ok(false);
        }
        let own_class = self
            .source
            .object_at(guard.table.file_offset(index))?
            .class_id;
        if own_class == class_id && target_class.kind == ClassKind::Instance {
            let can = *guard
                .can_contain_cache
                .entry(class_id)
                .or_insert_with(|| self.classes.can_contain_itself(class_id));
            if !can {
                return Ok(false);
            }
        }
        self.ensure_dominators(&mut guard, &NullProgress)?;
        let inner = &mut *guard;
        let mut visited: AHashSet<u32> = AHashSet::new();
        let mut idom = Self::idom_in(inner, index)?;
        while idom != 0 {
            let ancestor_class = self
                .source
                .object_at(inner.table.file_offset(idom))?
                .class_id;
            if ancestor_class == class_id {
                return Ok(true);
            }
            if !visited.insert(idom) {
                return Ok(false);
            }
            idom = Self::idom_in(inner, idom)?;
        }
        Ok(false)
    }

    pub fn stats(&self) -> AnalysisStats {
        let guard = self.lock();
        AnalysisStats {
            object_count: guard.table.count() as u64,
            class_count: self.classes.len(),
            gc_root_count: guard.root_list.len(),
            multi_parent_count: guard.multiple_parents.as_ref().map_or(0, |s| s.size()),
            leaf_count: guard.leaves.as_ref().map_or(0, |s| s.size()),
            deep_count: guard.deep_paths.as_ref().map_or(0, |s| s.size()),
            reference_blocks: guard.refs.block_count(),
        }
    }

    /// Rows for the top-retainers table: (ObjectId, class name, retained).
    pub fn top_retainer_rows(
        &self,
        k: usize,
    ) -> Result<Vec<(ObjectId, String, u64)>, HprofRetainError> {
        let ids = self.top_retainers(k)?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut rows = Vec::with_capacity(ids.len());
        for object_id in ids {
            let index = inner.table.index_of(object_id);
            let retained = inner.table.retained_size(index);
            let class_id = self
                .source
                .object_at(inner.table.file_offset(index))?
                .class_id;
            let class_name = self
                .classes
                .get(class_id)
                .map(|class| class.name.clone())
                .unwrap_or_else(|| format!("class {class_id:#x}"));
            rows.push((object_id, class_name, retained));
        }
        Ok(rows)
    }

    /// Runs any outstanding passes, serialises the analysis into the cache
    /// directory, and clears the dirty marker. A temporary cache persists
    /// nothing.
    pub fn persist(&self) -> Result<(), HprofRetainError> {
        let mut guard = self.lock();
        self.ensure_retained(&mut guard, &NullProgress)?;
        let Some(aux) = self.cache.aux_file() else {
            debug!("temporary cache directory, not persisting");
            return Ok(());
        };
        let inner = &mut *guard;
        inner.table.sync()?;
        inner.refs.sync()?;

        let mut out: Vec<u8> = Vec::new();
        out.extend_from_slice(AUX_MAGIC);
        out.extend_from_slice(&AUX_VERSION.to_le_bytes());
        out.push(inner.table.id_size() as u8);
        out.push(0);
        out.extend_from_slice(&inner.table.count().to_le_bytes());
        out.extend_from_slice(&inner.table.bucket_count().to_le_bytes());
        write_utf8(&mut out, &file_name_of(inner.table.path()));
        write_utf8(&mut out, &file_name_of(inner.refs.path()));
        out.extend_from_slice(&inner.refs.block_count().to_le_bytes());
        out.extend_from_slice(&(inner.root_list.len() as u32).to_le_bytes());
        for &root in &inner.root_list {
            out.extend_from_slice(&root.to_le_bytes());
        }
        let index_map = inner.table.index_map();
        out.extend_from_slice(&(index_map.capacity() as u32).to_le_bytes());
        out.extend_from_slice(&index_map.len().to_le_bytes());
        for (key, value) in index_map.iter() {
            out.extend_from_slice(&key.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        }
        for stream in [&mut inner.leaves, &mut inner.multiple_parents, &mut inner.deep_paths] {
            let stream = stream
                .as_mut()
                .ok_or_else(|| HprofRetainError::malformed("analysis stream missing"))?;
            write_stream(&mut out, stream)?;
        }
        // the dominator map, dumped dense-style as present (key, value) pairs
        let dominators = inner
            .dominators
            .as_ref()
            .ok_or_else(|| HprofRetainError::malformed("dominator map missing"))?;
        out.extend_from_slice(&(dominators.len() as u32).to_le_bytes());
        for (key, value) in dominators.iter() {
            out.extend_from_slice(&key.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        }
        std::fs::write(&aux, &out)?;
        self.cache.set_dirty(false)?;
        debug!("analysis persisted to {}", aux.display());
        Ok(())
    }

    /// Rehydrates a persisted analysis from the cache directory; the
    /// components are restored in the order `persist` wrote them.
    pub fn open(source: S, cache: CacheDirectory) -> Result<HeapAnalysis<S>, HprofRetainError> {
        let classes = ClassTable::new(source.classes());
        let filter = ReferentFilter::discover(&classes)?;
        let aux = cache
            .aux_file()
            .ok_or_else(|| HprofRetainError::malformed("temporary cache holds no analysis"))?;
        let data = std::fs::read(&aux)?;

        let (rest, header) = run(parse_aux_header(&data), "analysis header")?;
        if header.id_size as u32 != source.id_size() || header.count as u64 != source.object_count()
        {
            return Err(HprofRetainError::malformed(
                "cached analysis does not match the snapshot",
            ));
        }
        let (rest, roots) = run(
            count(le_u32, header.root_count as usize)(rest),
            "root table",
        )?;
        let (rest, (capacity, pair_count)) = run(pair(le_u32, le_u32)(rest), "index map header")?;
        let (rest, pairs) = run(
            count(pair(le_u32, le_u32), pair_count as usize)(rest),
            "index map",
        )?;
        let mut index_map = DenseIntMap::with_capacity(capacity as usize);
        for (key, value) in pairs {
            index_map.put(key, value);
        }
        let (rest, leaves_meta) = run(parse_stream(rest), "leaves stream")?;
        let (rest, multi_meta) = run(parse_stream(rest), "multiple-parents stream")?;
        let (rest, deep_meta) = run(parse_stream(rest), "deep-path stream")?;
        let (rest, dom_count) = run(le_u32(rest), "dominator map header")?;
        let (_, dom_pairs) = run(
            count(pair(le_u32, le_u32), dom_count as usize)(rest),
            "dominator map",
        )?;

        let table_path = cache.cache_file(&header.table_name)?;
        let table = ObjectTable::reopen(
            table_path,
            header.bucket_count,
            header.id_size as u32,
            header.count,
            index_map,
        )?;
        let refs_path = cache.cache_file(&header.refs_name)?;
        let refs = ReferenceList::reopen(refs_path, header.refs_blocks)?;
        let leaves = rehydrate_stream(leaves_meta, FRONTIER_PAGE, &cache)?;
        let multiple_parents = rehydrate_stream(multi_meta, MULTI_PARENTS_PAGE, &cache)?;
        let deep_paths = rehydrate_stream(deep_meta, FRONTIER_PAGE, &cache)?;
        let mut dominators = HashIntMap::with_capacity(dom_pairs.len());
        for (key, value) in dom_pairs {
            dominators.put(key, value)?;
        }
        let root_set: AHashSet<u32> = roots.iter().copied().collect();
        debug!("analysis reopened from {}", aux.display());
        Ok(HeapAnalysis {
            source,
            cache,
            classes,
            filter,
            inner: Mutex::new(AnalysisInner {
                table,
                refs,
                root_list: roots,
                root_set,
                leaves: Some(leaves),
                multiple_parents: Some(multiple_parents),
                deep_paths: Some(deep_paths),
                dominators: Some(dominators),
                can_contain_cache: AHashMap::new(),
                gc_roots_computed: true,
                dominators_computed: true,
                retained_computed: true,
            }),
        })
    }

    pub fn cache_directory(&self) -> &CacheDirectory {
        &self.cache
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: HeapSource> Drop for HeapAnalysis<S> {
    fn drop(&mut self) {
        if !self.cache.is_temporary() {
            return;
        }
        // temporary artifacts go with the analysis
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut paths = vec![
            inner.table.path().to_path_buf(),
            inner.refs.path().to_path_buf(),
        ];
        for stream in [&inner.leaves, &inner.multiple_parents, &inner.deep_paths]
            .into_iter()
            .flatten()
        {
            if let Some(path) = stream.backing_path() {
                paths.push(path.to_path_buf());
            }
        }
        inner.leaves = None;
        inner.multiple_parents = None;
        inner.deep_paths = None;
        for path in paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[derive(Eq, PartialEq)]
struct RetainedEntry {
    retained: u64,
    object_id: u64,
}

impl Ord for RetainedEntry {
    // larger retained size wins; ties go to the smaller ObjectId
    fn cmp(&self, other: &RetainedEntry) -> std::cmp::Ordering {
        self.retained
            .cmp(&other.retained)
            .then_with(|| other.object_id.cmp(&self.object_id))
    }
}

impl PartialOrd for RetainedEntry {
    fn partial_cmp(&self, other: &RetainedEntry) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct AuxHeader {
    id_size: u8,
    count: u32,
    bucket_count: u64,
    table_name: String,
    refs_name: String,
    refs_blocks: u32,
    root_count: u32,
}

fn parse_aux_header(input: &[u8]) -> IResult<&[u8], AuxHeader> {
    let (input, _) = tag(AUX_MAGIC)(input)?;
    let (input, version) = le_u16(input)?;
    if version != AUX_VERSION {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    let (input, id_size) = le_u8(input)?;
    let (input, _reserved) = le_u8(input)?;
    let (input, count) = le_u32(input)?;
    let (input, bucket_count) = le_u64(input)?;
    let (input, table_name) = parse_utf8(input)?;
    let (input, refs_name) = parse_utf8(input)?;
    let (input, refs_blocks) = le_u32(input)?;
    let (input, root_count) = le_u32(input)?;
    Ok((
        input,
        AuxHeader {
            id_size,
            count,
            bucket_count,
            table_name,
            refs_name,
            refs_blocks,
            root_count,
        },
    ))
}

struct PersistedStream {
    size: u64,
    backing: Option<String>,
    values: Vec<u32>,
}

fn parse_stream(input: &[u8]) -> IResult<&[u8], PersistedStream> {
    let (input, size) = le_u64(input)?;
    let (input, spilled) = le_u8(input)?;
    if spilled != 0 {
        let (input, name) = parse_utf8(input)?;
        Ok((
            input,
            PersistedStream {
                size,
                backing: Some(name),
                values: Vec::new(),
            },
        ))
    } else {
        let (input, values) = count(le_u32, size as usize)(input)?;
        Ok((
            input,
            PersistedStream {
                size,
                backing: None,
                values,
            },
        ))
    }
}

fn write_stream(out: &mut Vec<u8>, stream: &mut PagedIntStream) -> Result<(), HprofRetainError> {
    stream.flush()?;
    out.extend_from_slice(&stream.size().to_le_bytes());
    if stream.is_spilled() {
        out.push(1);
        let path = stream
            .backing_path()
            .ok_or_else(|| HprofRetainError::malformed("spilled stream lost its backing file"))?;
        write_utf8(out, &file_name_of(path));
    } else {
        out.push(0);
        for &value in stream.memory_values() {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    Ok(())
}

fn rehydrate_stream(
    meta: PersistedStream,
    page_size: usize,
    cache: &CacheDirectory,
) -> Result<PagedIntStream, HprofRetainError> {
    match meta.backing {
        Some(name) => {
            let path = cache.cache_file(&name)?;
            Ok(PagedStream::from_backing(path, meta.size, page_size, cache))
        }
        None => Ok(PagedStream::from_memory(meta.values, page_size, cache)),
    }
}

fn write_utf8(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ClassDef;
    use crate::snapshot::{SnapshotReader, SnapshotWriter};
    use std::collections::VecDeque;
    use tempfile::TempDir;

    const NODE_CLASS: u64 = 0xC01;
    const PRIM_ARRAY_CLASS: u64 = 0xC02;
    const ARRAY_CLASS: u64 = 0xC03;
    const REFERENCE_CLASS: u64 = 0xC10;
    const WEAK_CLASS: u64 = 0xC11;
    const HOLDER_CLASS: u64 = 0xC20;
    const POINT_CLASS: u64 = 0xC21;

    fn instance_class(id: u64, super_id: u64, name: &str, fields: &[&str]) -> ClassDef {
        ClassDef {
            class_id: id,
            super_id,
            name: name.to_string(),
            kind: ClassKind::Instance,
            instance_size: 16,
            object_fields: fields.iter().map(|f| f.to_string()).collect(),
            static_refs: Vec::new(),
        }
    }

    fn array_class(id: u64, name: &str, kind: ClassKind) -> ClassDef {
        ClassDef {
            class_id: id,
            super_id: 0,
            name: name.to_string(),
            kind,
            instance_size: 0,
            object_fields: Vec::new(),
            static_refs: Vec::new(),
        }
    }

    fn base_classes() -> Vec<ClassDef> {
        vec![
            instance_class(NODE_CLASS, 0, "com.example.Node", &["next"]),
            array_class(PRIM_ARRAY_CLASS, "[B", ClassKind::PrimitiveArray),
            array_class(ARRAY_CLASS, "[Lcom.example.Node;", ClassKind::ObjectArray),
            instance_class(REFERENCE_CLASS, 0, "java.lang.ref.Reference", &["referent"]),
            instance_class(WEAK_CLASS, REFERENCE_CLASS, "java.lang.ref.WeakReference", &[]),
            instance_class(0xC12, REFERENCE_CLASS, "java.lang.ref.SoftReference", &[]),
            instance_class(0xC13, REFERENCE_CLASS, "java.lang.ref.FinalReference", &[]),
            instance_class(0xC14, REFERENCE_CLASS, "java.lang.ref.PhantomReference", &[]),
        ]
    }

    struct Fixture {
        _snapshot_dir: TempDir,
        _cache_dir: TempDir,
        analysis: HeapAnalysis<SnapshotReader>,
    }

    fn analyse(build: impl FnOnce(&mut SnapshotWriter)) -> Fixture {
        let snapshot_dir = tempfile::tempdir().unwrap();
        let path = snapshot_dir.path().join("graph.bin");
        let mut writer = SnapshotWriter::new(8);
        for class in base_classes() {
            writer.add_class(class);
        }
        build(&mut writer);
        writer.write_to(&path).unwrap();
        let reader = SnapshotReader::open(&path).unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = CacheDirectory::persistent(cache_dir.path()).unwrap();
        let analysis = HeapAnalysis::build(reader, cache, &NullProgress).unwrap();
        Fixture {
            _snapshot_dir: snapshot_dir,
            _cache_dir: cache_dir,
            analysis,
        }
    }

    #[test]
    fn singleton_root() {
        let f = analyse(|w| {
            w.add_root(0xA1).add_instance(0xA1, NODE_CLASS, 32, &[]);
        });
        let a = &f.analysis;
        assert_eq!(a.nearest_gc_root(0xA1).unwrap(), 0xA1);
        assert_eq!(a.immediate_dominator(0xA1).unwrap(), 0);
        assert_eq!(a.retained_size(0xA1).unwrap(), 32);
        assert_eq!(a.top_retainers(1).unwrap(), vec![0xA1]);
    }

    #[test]
    fn chain_of_three() {
        let f = analyse(|w| {
            w.add_root(0xA1)
                .add_instance(0xA1, NODE_CLASS, 16, &[0xB1])
                .add_instance(0xB1, NODE_CLASS, 24, &[0xC1])
                .add_instance(0xC1, NODE_CLASS, 32, &[]);
        });
        let a = &f.analysis;
        assert_eq!(a.immediate_dominator(0xB1).unwrap(), 0xA1);
        assert_eq!(a.immediate_dominator(0xC1).unwrap(), 0xB1);
        assert_eq!(a.retained_size(0xA1).unwrap(), 72);
        assert_eq!(a.retained_size(0xB1).unwrap(), 56);
        assert_eq!(a.retained_size(0xC1).unwrap(), 32);
        assert_eq!(a.nearest_gc_root(0xC1).unwrap(), 0xA1);
        assert_eq!(a.top_retainers(2).unwrap(), vec![0xA1, 0xB1]);
    }

    #[test]
    fn diamond_converges_on_the_fork() {
        let f = analyse(|w| {
            w.add_root(0xA1)
                .add_instance(0xA1, NODE_CLASS, 10, &[0xB1, 0xC1])
                .add_instance(0xB1, NODE_CLASS, 20, &[0xD1])
                .add_instance(0xC1, NODE_CLASS, 30, &[0xD1])
                .add_instance(0xD1, NODE_CLASS, 40, &[]);
        });
        let a = &f.analysis;
        assert_eq!(a.immediate_dominator(0xD1).unwrap(), 0xA1);
        assert_eq!(a.retained_size(0xB1).unwrap(), 20);
        assert_eq!(a.retained_size(0xC1).unwrap(), 30);
        assert_eq!(a.retained_size(0xD1).unwrap(), 40);
        assert_eq!(a.retained_size(0xA1).unwrap(), 100);
    }

    #[test]
    fn cycle_back_to_the_root() {
        let f = analyse(|w| {
            w.add_root(0xA1)
                .add_instance(0xA1, NODE_CLASS, 16, &[0xB1, 0xC1])
                .add_instance(0xB1, NODE_CLASS, 24, &[0xA1])
                .add_instance(0xC1, NODE_CLASS, 8, &[]);
        });
        let a = &f.analysis;
        assert_eq!(a.immediate_dominator(0xB1).unwrap(), 0xA1);
        assert_eq!(a.immediate_dominator(0xC1).unwrap(), 0xA1);
        assert_eq!(a.retained_size(0xA1).unwrap(), 48);
    }

    #[test]
    fn weak_referent_edge_is_not_traversed() {
        let f = analyse(|w| {
            w.add_root(0xA1)
                .add_instance(0xA1, NODE_CLASS, 16, &[0xB1, 0xD1])
                .add_instance(0xB1, NODE_CLASS, 24, &[])
                .add_instance(0xD1, WEAK_CLASS, 32, &[0xE1])
                .add_instance(0xE1, NODE_CLASS, 40, &[]);
        });
        let a = &f.analysis;
        assert_eq!(a.nearest_gc_root(0xE1).unwrap(), 0);
        assert_eq!(a.retained_size(0xE1).unwrap(), 0);
        assert_eq!(a.nearest_gc_root(0xD1).unwrap(), 0xA1);
        assert_eq!(a.retained_size(0xA1).unwrap(), 16 + 24 + 32);
    }

    #[test]
    fn top_retainers_break_ties_by_ascending_id() {
        let f = analyse(|w| {
            w.add_root(0x10)
                .add_root(0x20)
                .add_root(0x30)
                .add_instance(0x20, NODE_CLASS, 100, &[])
                .add_instance(0x10, NODE_CLASS, 100, &[])
                .add_instance(0x30, NODE_CLASS, 50, &[]);
        });
        assert_eq!(f.analysis.top_retainers(2).unwrap(), vec![0x10, 0x20]);
        assert_eq!(
            f.analysis.top_retainers(10).unwrap(),
            vec![0x10, 0x20, 0x30]
        );
    }

    #[test]
    fn arrays_participate_like_instances() {
        let f = analyse(|w| {
            w.add_root(0xA1)
                .add_instance(0xA1, NODE_CLASS, 16, &[0xB1])
                .add_object_array(0xB1, ARRAY_CLASS, 48, &[0xC1, 0, 0xD1])
                .add_primitive_array(0xC1, PRIM_ARRAY_CLASS, 64)
                .add_primitive_array(0xD1, PRIM_ARRAY_CLASS, 72);
        });
        let a = &f.analysis;
        assert_eq!(a.immediate_dominator(0xC1).unwrap(), 0xB1);
        assert_eq!(a.immediate_dominator(0xD1).unwrap(), 0xB1);
        assert_eq!(a.retained_size(0xB1).unwrap(), 48 + 64 + 72);
        assert_eq!(a.retained_size(0xA1).unwrap(), 16 + 48 + 64 + 72);
    }

    #[test]
    fn class_objects_and_statics_are_reachable() {
        let f = analyse(|w| {
            let mut holder = instance_class(HOLDER_CLASS, 0, "com.example.Holder", &[]);
            holder.static_refs = vec![0xB1];
            w.add_class(holder);
            w.add_root(0xA1)
                .add_instance(0xA1, HOLDER_CLASS, 16, &[])
                .add_class_object(HOLDER_CLASS, 80)
                .add_instance(0xB1, NODE_CLASS, 24, &[]);
        });
        let a = &f.analysis;
        // the first instance publishes the class edge, statics hang off it
        assert_eq!(a.immediate_dominator(HOLDER_CLASS).unwrap(), 0xA1);
        assert_eq!(a.nearest_gc_root(0xB1).unwrap(), 0xA1);
        assert_eq!(a.immediate_dominator(0xB1).unwrap(), HOLDER_CLASS);
        assert_eq!(a.retained_size(0xA1).unwrap(), 16 + 80 + 24);
    }

    #[test]
    fn ancestor_class_walks_the_dominator_chain() {
        let f = analyse(|w| {
            w.add_class(instance_class(POINT_CLASS, 0, "com.example.Point", &[]));
            w.add_root(0xA1)
                .add_instance(0xA1, NODE_CLASS, 16, &[0xB1])
                .add_instance(0xB1, NODE_CLASS, 16, &[0xC1])
                .add_instance(0xC1, POINT_CLASS, 16, &[]);
        });
        let a = &f.analysis;
        assert!(a.has_ancestor_of_class(0xC1, NODE_CLASS).unwrap());
        assert!(!a.has_ancestor_of_class(0xA1, NODE_CLASS).unwrap());
        // primitive-array classes can never retain anything
        assert!(!a.has_ancestor_of_class(0xC1, PRIM_ARRAY_CLASS).unwrap());
        // a fieldless class cannot retain another instance of itself
        assert!(!a.has_ancestor_of_class(0xC1, POINT_CLASS).unwrap());
        // a Node asking about its own class takes the full walk
        assert!(a.has_ancestor_of_class(0xB1, NODE_CLASS).unwrap());
    }

    #[test]
    fn unknown_ids_yield_null_answers() {
        let f = analyse(|w| {
            w.add_root(0xA1).add_instance(0xA1, NODE_CLASS, 32, &[]);
        });
        let a = &f.analysis;
        assert_eq!(a.nearest_gc_root(0xDEAD).unwrap(), 0);
        assert_eq!(a.immediate_dominator(0xDEAD).unwrap(), 0);
        assert_eq!(a.retained_size(0xDEAD).unwrap(), 0);
        assert!(!a.has_ancestor_of_class(0xDEAD, NODE_CLASS).unwrap());
    }

    #[test]
    fn dirty_marker_follows_the_compute_lifecycle() {
        let f = analyse(|w| {
            w.add_root(0xA1).add_instance(0xA1, NODE_CLASS, 32, &[]);
        });
        let cache = f.analysis.cache_directory().clone();
        assert!(!cache.is_dirty());
        f.analysis.compute_gc_roots(&NullProgress).unwrap();
        assert!(cache.is_dirty());
        f.analysis.persist().unwrap();
        assert!(!cache.is_dirty());
    }

    #[test]
    fn persisted_analysis_reopens_identically() {
        let snapshot_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let path = snapshot_dir.path().join("graph.bin");
        let mut writer = SnapshotWriter::new(8);
        for class in base_classes() {
            writer.add_class(class);
        }
        writer
            .add_root(0xA1)
            .add_instance(0xA1, NODE_CLASS, 10, &[0xB1, 0xC1])
            .add_instance(0xB1, NODE_CLASS, 20, &[0xD1])
            .add_instance(0xC1, NODE_CLASS, 30, &[0xD1])
            .add_instance(0xD1, NODE_CLASS, 40, &[]);
        writer.write_to(&path).unwrap();
        let ids = [0xA1u64, 0xB1, 0xC1, 0xD1];

        let cache = CacheDirectory::persistent(cache_dir.path()).unwrap();
        let analysis =
            HeapAnalysis::build(SnapshotReader::open(&path).unwrap(), cache, &NullProgress)
                .unwrap();
        let before: Vec<(u64, u64, u64)> = ids
            .iter()
            .map(|&id| {
                (
                    analysis.nearest_gc_root(id).unwrap(),
                    analysis.immediate_dominator(id).unwrap(),
                    analysis.retained_size(id).unwrap(),
                )
            })
            .collect();
        let top_before = analysis.top_retainers(3).unwrap();
        analysis.persist().unwrap();
        drop(analysis);

        let cache = CacheDirectory::persistent(cache_dir.path()).unwrap();
        assert!(!cache.is_dirty());
        let reopened =
            HeapAnalysis::open(SnapshotReader::open(&path).unwrap(), cache).unwrap();
        let after: Vec<(u64, u64, u64)> = ids
            .iter()
            .map(|&id| {
                (
                    reopened.nearest_gc_root(id).unwrap(),
                    reopened.immediate_dominator(id).unwrap(),
                    reopened.retained_size(id).unwrap(),
                )
            })
            .collect();
        assert_eq!(before, after);
        assert_eq!(top_before, reopened.top_retainers(3).unwrap());
        assert!(reopened.has_ancestor_of_class(0xD1, NODE_CLASS).unwrap());
    }

    // deterministic LCG so randomised graphs are reproducible
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    fn nid(i: usize) -> u64 {
        0x1000 + i as u64
    }

    fn reachable_without(adj: &[Vec<usize>], roots: &[usize], removed: Option<usize>) -> Vec<bool> {
        let mut seen = vec![false; adj.len()];
        let mut queue = VecDeque::new();
        for &root in roots {
            if Some(root) != removed && !seen[root] {
                seen[root] = true;
                queue.push_back(root);
            }
        }
        while let Some(u) = queue.pop_front() {
            for &v in &adj[u] {
                if Some(v) != removed && !seen[v] {
                    seen[v] = true;
                    queue.push_back(v);
                }
            }
        }
        seen
    }

    // dominators from first principles: d dominates v iff removing d cuts
    // every root path to v; the immediate dominator is the one with the
    // largest dominator set of its own
    fn brute_force_dominators(
        adj: &[Vec<usize>],
        roots: &[usize],
    ) -> (Vec<bool>, Vec<Option<usize>>, Vec<Vec<usize>>) {
        let n = adj.len();
        let reachable = reachable_without(adj, roots, None);
        let mut dom_sets: Vec<Vec<usize>> = vec![Vec::new(); n];
        for d in 0..n {
            if !reachable[d] {
                continue;
            }
            let cut = reachable_without(adj, roots, Some(d));
            for v in 0..n {
                if v != d && reachable[v] && !cut[v] {
                    dom_sets[v].push(d);
                }
            }
        }
        let mut idom = vec![None; n];
        for v in 0..n {
            if !reachable[v] || roots.contains(&v) {
                continue;
            }
            idom[v] = dom_sets[v]
                .iter()
                .copied()
                .max_by_key(|&d| dom_sets[d].len());
        }
        (reachable, idom, dom_sets)
    }

    #[test]
    fn random_graphs_match_the_reference_dominators() {
        for seed in [3u64, 11, 77, 123] {
            let mut rng = Lcg(seed);
            let n = 40;
            let roots = vec![0usize, 1];
            let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
            let mut shallow = vec![0u64; n];
            for v in 0..n {
                shallow[v] = 8 + (rng.next() % 6) * 8;
                let degree = (rng.next() % 4) as usize;
                for _ in 0..degree {
                    adj[v].push((rng.next() % n as u64) as usize);
                }
            }

            let snapshot_dir = tempfile::tempdir().unwrap();
            let path = snapshot_dir.path().join("graph.bin");
            let mut writer = SnapshotWriter::new(8);
            for class in base_classes() {
                writer.add_class(class);
            }
            for &root in &roots {
                writer.add_root(nid(root));
            }
            for v in 0..n {
                let refs: Vec<u64> = adj[v].iter().map(|&t| nid(t)).collect();
                writer.add_instance(nid(v), NODE_CLASS, shallow[v], &refs);
            }
            writer.write_to(&path).unwrap();
            let cache_dir = tempfile::tempdir().unwrap();
            let cache = CacheDirectory::persistent(cache_dir.path()).unwrap();
            let analysis =
                HeapAnalysis::build(SnapshotReader::open(&path).unwrap(), cache, &NullProgress)
                    .unwrap();

            let (reachable, idom, dom_sets) = brute_force_dominators(&adj, &roots);
            let mut expected_retained = vec![0u64; n];
            for v in 0..n {
                if !reachable[v] {
                    continue;
                }
                expected_retained[v] = shallow[v];
            }
            for u in 0..n {
                if !reachable[u] {
                    continue;
                }
                for &d in &dom_sets[u] {
                    expected_retained[d] += shallow[u];
                }
            }

            for v in 0..n {
                let id = nid(v);
                if !reachable[v] {
                    assert_eq!(
                        analysis.nearest_gc_root(id).unwrap(),
                        0,
                        "seed {seed} node {v} should be unreachable"
                    );
                    assert_eq!(analysis.retained_size(id).unwrap(), 0);
                    continue;
                }
                if roots.contains(&v) {
                    assert_eq!(analysis.immediate_dominator(id).unwrap(), 0);
                } else {
                    let expected = idom[v].map(nid).unwrap_or(0);
                    assert_eq!(
                        analysis.immediate_dominator(id).unwrap(),
                        expected,
                        "seed {seed} node {v}"
                    );
                }
                assert_eq!(
                    analysis.retained_size(id).unwrap(),
                    expected_retained[v],
                    "seed {seed} node {v} retained"
                );
                assert_ne!(analysis.nearest_gc_root(id).unwrap(), 0);
            }
        }
    }

    #[test]
    fn retained_of_the_single_root_covers_every_reachable_byte() {
        let f = analyse(|w| {
            w.add_root(0xA1)
                .add_instance(0xA1, NODE_CLASS, 10, &[0xB1, 0xC1])
                .add_instance(0xB1, NODE_CLASS, 20, &[0xD1])
                .add_instance(0xC1, NODE_CLASS, 30, &[0xD1])
                .add_instance(0xD1, NODE_CLASS, 40, &[0xB1]);
        });
        assert_eq!(f.analysis.retained_size(0xA1).unwrap(), 100);
    }
}
