use ahash::{AHashMap, AHashSet};

use crate::errors::HprofRetainError;

pub type ObjectId = u64;
pub type ObjectIndex = u32;
pub type ClassId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClassKind {
    Instance = 0,
    ObjectArray = 1,
    PrimitiveArray = 2,
}

impl ClassKind {
    pub fn from_value(v: u8) -> Result<ClassKind, HprofRetainError> {
        match v {
            0 => Ok(ClassKind::Instance),
            1 => Ok(ClassKind::ObjectArray),
            2 => Ok(ClassKind::PrimitiveArray),
            x => Err(HprofRetainError::malformed(format!("class kind {x} not found"))),
        }
    }
}

/// Class definition as delivered by the dump front-end. `object_fields` holds
/// the names of this class's own object-typed instance fields, in declaration
/// order; the full layout of an instance is these fields followed by the
/// super-class chain's.
#[derive(Clone, Debug)]
pub struct ClassDef {
    pub class_id: ClassId,
    pub super_id: ClassId,
    pub name: String,
    pub kind: ClassKind,
    pub instance_size: u32,
    pub object_fields: Vec<String>,
    pub static_refs: Vec<ObjectId>,
}

/// Tagged object variant; one of these per heap object, dispatching on the
/// tag instead of a class hierarchy.
#[derive(Debug)]
pub enum ObjectKind {
    /// Object-field targets, positionally aligned with the class layout.
    Instance { field_refs: Vec<ObjectId> },
    ObjectArray { elements: Vec<ObjectId> },
    PrimitiveArray,
    ClassObject { static_refs: Vec<ObjectId> },
}

#[derive(Debug)]
pub struct HeapObject {
    pub object_id: ObjectId,
    pub class_id: ClassId,
    pub shallow_size: u64,
    pub kind: ObjectKind,
}

/// Boundary to the dump front-end: everything the engines need from a
/// preprocessed object graph.
pub trait HeapSource {
    /// Pointer width of the dump, 4 or 8.
    fn id_size(&self) -> u32;

    fn object_count(&self) -> u64;

    fn classes(&self) -> &[ClassDef];

    fn gc_roots(&self) -> &[ObjectId];

    /// Every heap object in discovery order as (ObjectId, file offset);
    /// discovery order defines the dense index assignment.
    fn objects(&self) -> Box<dyn Iterator<Item = Result<(ObjectId, u64), HprofRetainError>> + '_>;

    /// Random access to one object by its file offset.
    fn object_at(&self, file_offset: u64) -> Result<HeapObject, HprofRetainError>;
}

/// Class metadata prepared for the engines: id and name lookups, instance
/// field layouts, and the subclass closure used for reference-class
/// discovery.
pub struct ClassTable {
    by_id: AHashMap<ClassId, ClassDef>,
    by_name: AHashMap<String, ClassId>,
    layouts: AHashMap<ClassId, Vec<String>>,
}

impl ClassTable {
    pub fn new(classes: &[ClassDef]) -> ClassTable {
        let mut by_id = AHashMap::with_capacity(classes.len());
        let mut by_name = AHashMap::with_capacity(classes.len());
        for class in classes {
            by_name.insert(class.name.clone(), class.class_id);
            by_id.insert(class.class_id, class.clone());
        }
        let mut layouts = AHashMap::with_capacity(classes.len());
        for class in classes {
            let mut layout = Vec::new();
            let mut current = Some(class.class_id);
            let mut depth = 0;
            while let Some(id) = current {
                let Some(def) = by_id.get(&id) else { break };
                layout.extend(def.object_fields.iter().cloned());
                current = (def.super_id != 0).then_some(def.super_id);
                depth += 1;
                if depth > classes.len() {
                    // cyclic super chain in a broken dump; stop extending
                    break;
                }
            }
            layouts.insert(class.class_id, layout);
        }
        ClassTable {
            by_id,
            by_name,
            layouts,
        }
    }

    pub fn get(&self, class_id: ClassId) -> Option<&ClassDef> {
        self.by_id.get(&class_id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ClassDef> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    /// Object-field names of an instance of `class_id`, own fields first,
    /// then the super chain.
    pub fn layout(&self, class_id: ClassId) -> &[String] {
        self.layouts
            .get(&class_id)
            .map(|layout| layout.as_slice())
            .unwrap_or(&[])
    }

    /// `class_id` plus every class that transitively extends it.
    pub fn with_subclasses(&self, class_id: ClassId) -> AHashSet<ClassId> {
        let mut result = AHashSet::new();
        result.insert(class_id);
        for class in self.by_id.values() {
            let mut current = class.super_id;
            let mut depth = 0;
            while current != 0 && depth <= self.by_id.len() {
                if current == class_id {
                    result.insert(class.class_id);
                    break;
                }
                current = self.by_id.get(&current).map(|c| c.super_id).unwrap_or(0);
                depth += 1;
            }
        }
        result
    }

    /// Whether an instance of this class could transitively reference another
    /// instance of it. Object fields are untyped in the dump, so any object
    /// field (or array slot) keeps the answer at true; only classes whose
    /// hierarchy declares no object field at all can be ruled out.
    pub fn can_contain_itself(&self, class_id: ClassId) -> bool {
        match self.by_id.get(&class_id) {
            Some(class) => match class.kind {
                ClassKind::PrimitiveArray => false,
                ClassKind::ObjectArray => true,
                ClassKind::Instance => !self.layout(class_id).is_empty(),
            },
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

const HOTSPOT_REF_CLASSES: [&str; 4] = [
    "java.lang.ref.WeakReference",
    "java.lang.ref.SoftReference",
    "java.lang.ref.FinalReference",
    "java.lang.ref.PhantomReference",
];
const JAVA_LANG_REF_REFERENCE: &str = "java.lang.ref.Reference";
const REFERENT_FIELD_NAME: &str = "referent";
const SVM_REFERENCE: &str = "com.oracle.svm.core.heap.heapImpl.DiscoverableReference";
const SVM_REFERENCE_1: &str = "com.oracle.svm.core.heap.DiscoverableReference";
const SVM_REFERENT_FIELD_NAME: &str = "rawReferent";

/// Identifies the soft/weak/final/phantom `referent` edges that the
/// reachability scan must not follow. Resolved once per dump against the
/// HotSpot naming convention first, then SubstrateVM.
pub struct ReferentFilter {
    skip_slots: AHashMap<ClassId, usize>,
}

impl ReferentFilter {
    pub fn discover(classes: &ClassTable) -> Result<ReferentFilter, HprofRetainError> {
        if let Some(filter) = Self::init_hotspot(classes) {
            return Ok(filter);
        }
        if let Some(filter) = Self::init_svm(classes) {
            return Ok(filter);
        }
        Err(HprofRetainError::UnsupportedDump {
            message: "reference field not found".to_string(),
        })
    }

    fn init_hotspot(classes: &ClassTable) -> Option<ReferentFilter> {
        let reference = classes.by_name(JAVA_LANG_REF_REFERENCE)?;
        if !classes
            .layout(reference.class_id)
            .iter()
            .any(|f| f == REFERENT_FIELD_NAME)
        {
            return None;
        }
        let mut reference_classes = AHashSet::new();
        for name in HOTSPOT_REF_CLASSES {
            if let Some(class) = classes.by_name(name) {
                reference_classes.extend(classes.with_subclasses(class.class_id));
            }
        }
        if reference_classes.len() < HOTSPOT_REF_CLASSES.len() {
            return None;
        }
        Some(Self::build(classes, &reference_classes, REFERENT_FIELD_NAME))
    }

    fn init_svm(classes: &ClassTable) -> Option<ReferentFilter> {
        let reference = classes
            .by_name(SVM_REFERENCE)
            .or_else(|| classes.by_name(SVM_REFERENCE_1))?;
        if !classes
            .layout(reference.class_id)
            .iter()
            .any(|f| f == SVM_REFERENT_FIELD_NAME)
        {
            return None;
        }
        let reference_classes = classes.with_subclasses(reference.class_id);
        if reference_classes.is_empty() {
            return None;
        }
        Some(Self::build(classes, &reference_classes, SVM_REFERENT_FIELD_NAME))
    }

    fn build(
        classes: &ClassTable,
        reference_classes: &AHashSet<ClassId>,
        referent_name: &str,
    ) -> ReferentFilter {
        let mut skip_slots = AHashMap::with_capacity(reference_classes.len());
        for &class_id in reference_classes {
            if let Some(slot) = classes
                .layout(class_id)
                .iter()
                .position(|f| f == referent_name)
            {
                skip_slots.insert(class_id, slot);
            }
        }
        ReferentFilter { skip_slots }
    }

    /// True when field `slot` of an instance of `class_id` is the referent
    /// edge.
    pub fn skips(&self, class_id: ClassId, slot: usize) -> bool {
        self.skip_slots.get(&class_id) == Some(&slot)
    }
}
