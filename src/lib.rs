//! Reachability and dominance analysis for large JVM heap dumps: nearest
//! GC roots, immediate dominators and retained sizes over a preprocessed
//! object graph that does not fit in main memory.

pub mod analysis;
pub mod cache;
pub mod engine;
pub mod errors;
pub mod heap;
pub mod lru;
pub mod maps;
pub mod object_table;
pub mod paged;
pub mod reference_list;
pub mod report;
pub mod snapshot;

pub use crate::analysis::{AnalysisStats, HeapAnalysis};
pub use crate::cache::CacheDirectory;
pub use crate::engine::{NullProgress, ProgressListener};
pub use crate::errors::HprofRetainError;
pub use crate::heap::{
    ClassDef, ClassId, ClassKind, HeapObject, HeapSource, ObjectId, ObjectIndex, ObjectKind,
};
pub use crate::snapshot::{SnapshotReader, SnapshotWriter};
