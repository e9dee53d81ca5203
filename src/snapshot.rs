use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use ahash::AHashMap;
use memmap2::Mmap;
use nom::bytes::complete::{tag, take};
use nom::multi::count;
use nom::number::complete::{le_u16, le_u32, le_u64, le_u8};
use nom::IResult;

use crate::errors::HprofRetainError;
use crate::heap::{ClassDef, ClassId, ClassKind, HeapObject, HeapSource, ObjectId, ObjectKind};

/// Preprocessed-graph snapshot format.
///
/// The HPROF front-end flattens a dump into this self-describing layout:
/// little-endian fixed-width integers, length-prefixed UTF-8 strings, object
/// records addressed by their byte offset. Sections in order: header, class
/// table, GC roots, object records.
const MAGIC: &[u8; 4] = b"HRSN";
const VERSION: u16 = 1;

const TAG_INSTANCE: u8 = 0;
const TAG_OBJECT_ARRAY: u8 = 1;
const TAG_PRIMITIVE_ARRAY: u8 = 2;
const TAG_CLASS_OBJECT: u8 = 3;

// tag (1) + object id (8) + class id (8) + shallow size (8)
const RECORD_HEADER_SIZE: usize = 25;

struct SnapshotHeader {
    id_size: u8,
    class_count: u32,
    root_count: u32,
    object_count: u64,
}

pub(crate) fn parse_utf8(input: &[u8]) -> IResult<&[u8], String> {
    let (input, len) = le_u16(input)?;
    let (input, bytes) = take(len as usize)(input)?;
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok((input, s.to_string())),
        Err(_) => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Char,
        ))),
    }
}

fn parse_header(input: &[u8]) -> IResult<&[u8], SnapshotHeader> {
    let (input, _) = tag(MAGIC)(input)?;
    let (input, version) = le_u16(input)?;
    if version != VERSION {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    let (input, id_size) = le_u8(input)?;
    let (input, _reserved) = le_u8(input)?;
    let (input, class_count) = le_u32(input)?;
    let (input, root_count) = le_u32(input)?;
    let (input, object_count) = le_u64(input)?;
    Ok((
        input,
        SnapshotHeader {
            id_size,
            class_count,
            root_count,
            object_count,
        },
    ))
}

fn parse_class(input: &[u8]) -> IResult<&[u8], ClassDef> {
    let (input, class_id) = le_u64(input)?;
    let (input, super_id) = le_u64(input)?;
    let (input, kind_raw) = le_u8(input)?;
    let (input, instance_size) = le_u32(input)?;
    let (input, name) = parse_utf8(input)?;
    let (input, field_count) = le_u16(input)?;
    let (input, object_fields) = count(parse_utf8, field_count as usize)(input)?;
    let (input, static_count) = le_u16(input)?;
    let (input, static_refs) = count(le_u64, static_count as usize)(input)?;
    let kind = match ClassKind::from_value(kind_raw) {
        Ok(kind) => kind,
        Err(_) => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Verify,
            )))
        }
    };
    Ok((
        input,
        ClassDef {
            class_id,
            super_id,
            name,
            kind,
            instance_size,
            object_fields,
            static_refs,
        },
    ))
}

fn parse_record(input: &[u8]) -> IResult<&[u8], (u8, ObjectId, ClassId, u64, Vec<ObjectId>)> {
    let (input, record_tag) = le_u8(input)?;
    let (input, object_id) = le_u64(input)?;
    let (input, class_id) = le_u64(input)?;
    let (input, shallow_size) = le_u64(input)?;
    let (input, refs) = match record_tag {
        TAG_INSTANCE => {
            let (input, field_count) = le_u16(input)?;
            count(le_u64, field_count as usize)(input)?
        }
        TAG_OBJECT_ARRAY => {
            let (input, element_count) = le_u32(input)?;
            count(le_u64, element_count as usize)(input)?
        }
        TAG_PRIMITIVE_ARRAY | TAG_CLASS_OBJECT => (input, Vec::new()),
        _ => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        }
    };
    Ok((input, (record_tag, object_id, class_id, shallow_size, refs)))
}

pub(crate) fn run<'a, T>(
    result: IResult<&'a [u8], T>,
    what: &str,
) -> Result<(&'a [u8], T), HprofRetainError> {
    result.map_err(|_| HprofRetainError::malformed(format!("invalid snapshot {what}")))
}

/// Memory-mapped reader over a snapshot file; random record access through
/// [`HeapSource::object_at`].
pub struct SnapshotReader {
    map: Mmap,
    id_size: u32,
    object_count: u64,
    classes: Vec<ClassDef>,
    statics_by_class: AHashMap<ClassId, Vec<ObjectId>>,
    roots: Vec<ObjectId>,
    objects_start: usize,
}

impl SnapshotReader {
    pub fn open(path: &Path) -> Result<SnapshotReader, HprofRetainError> {
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        let data: &[u8] = &map;

        let (mut rest, header) = run(parse_header(data), "header")?;
        if header.id_size != 4 && header.id_size != 8 {
            return Err(HprofRetainError::malformed(format!(
                "unsupported pointer width {}",
                header.id_size
            )));
        }
        let mut classes = Vec::with_capacity(header.class_count as usize);
        for _ in 0..header.class_count {
            let (next, class) = run(parse_class(rest), "class table")?;
            classes.push(class);
            rest = next;
        }
        let (rest, roots) = run(
            count(le_u64, header.root_count as usize)(rest),
            "root table",
        )?;
        let objects_start = data.len() - rest.len();
        let statics_by_class = classes
            .iter()
            .map(|class| (class.class_id, class.static_refs.clone()))
            .collect();
        Ok(SnapshotReader {
            id_size: header.id_size as u32,
            object_count: header.object_count,
            classes,
            statics_by_class,
            roots,
            objects_start,
            map,
        })
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl HeapSource for SnapshotReader {
    fn id_size(&self) -> u32 {
        self.id_size
    }

    fn object_count(&self) -> u64 {
        self.object_count
    }

    fn classes(&self) -> &[ClassDef] {
        &self.classes
    }

    fn gc_roots(&self) -> &[ObjectId] {
        &self.roots
    }

    fn objects(&self) -> Box<dyn Iterator<Item = Result<(ObjectId, u64), HprofRetainError>> + '_> {
        Box::new(SnapshotObjects {
            data: &self.map,
            pos: self.objects_start,
            remaining: self.object_count,
        })
    }

    fn object_at(&self, file_offset: u64) -> Result<HeapObject, HprofRetainError> {
        let offset = file_offset as usize;
        if offset < self.objects_start || offset >= self.map.len() {
            return Err(HprofRetainError::malformed(format!(
                "object offset {file_offset} outside the snapshot"
            )));
        }
        let (_, (record_tag, object_id, class_id, shallow_size, refs)) =
            run(parse_record(&self.map[offset..]), "object record")?;
        let kind = match record_tag {
            TAG_INSTANCE => ObjectKind::Instance { field_refs: refs },
            TAG_OBJECT_ARRAY => ObjectKind::ObjectArray { elements: refs },
            TAG_PRIMITIVE_ARRAY => ObjectKind::PrimitiveArray,
            _ => ObjectKind::ClassObject {
                static_refs: self
                    .statics_by_class
                    .get(&class_id)
                    .cloned()
                    .unwrap_or_default(),
            },
        };
        Ok(HeapObject {
            object_id,
            class_id,
            shallow_size,
            kind,
        })
    }
}

struct SnapshotObjects<'a> {
    data: &'a [u8],
    pos: usize,
    remaining: u64,
}

impl<'a> SnapshotObjects<'a> {
    fn read_u16(&self, at: usize) -> Option<u16> {
        let bytes = self.data.get(at..at + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&self, at: usize) -> Option<u32> {
        let bytes = self.data.get(at..at + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&self, at: usize) -> Option<u64> {
        let bytes = self.data.get(at..at + 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(u64::from_le_bytes(buf))
    }

    // Record length without materialising the reference vector.
    fn record_len(&self, at: usize) -> Option<usize> {
        let record_tag = *self.data.get(at)?;
        match record_tag {
            TAG_INSTANCE => {
                let fields = self.read_u16(at + RECORD_HEADER_SIZE)? as usize;
                Some(RECORD_HEADER_SIZE + 2 + fields * 8)
            }
            TAG_OBJECT_ARRAY => {
                let elements = self.read_u32(at + RECORD_HEADER_SIZE)? as usize;
                Some(RECORD_HEADER_SIZE + 4 + elements * 8)
            }
            TAG_PRIMITIVE_ARRAY | TAG_CLASS_OBJECT => Some(RECORD_HEADER_SIZE),
            _ => None,
        }
    }
}

impl<'a> Iterator for SnapshotObjects<'a> {
    type Item = Result<(ObjectId, u64), HprofRetainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let offset = self.pos;
        let parsed = self
            .read_u64(offset + 1)
            .zip(self.record_len(offset))
            .ok_or_else(|| {
                HprofRetainError::malformed(format!("truncated object record at {offset}"))
            });
        match parsed {
            Ok((object_id, len)) => {
                self.pos += len;
                Some(Ok((object_id, offset as u64)))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// Produces the snapshot format; the write side of the front-end contract,
/// also used to assemble graphs in tests.
pub struct SnapshotWriter {
    id_size: u32,
    classes: Vec<ClassDef>,
    records: Vec<u8>,
    object_count: u64,
    roots: Vec<ObjectId>,
}

impl SnapshotWriter {
    pub fn new(id_size: u32) -> SnapshotWriter {
        SnapshotWriter {
            id_size,
            classes: Vec::new(),
            records: Vec::new(),
            object_count: 0,
            roots: Vec::new(),
        }
    }

    pub fn add_class(&mut self, class: ClassDef) -> &mut Self {
        self.classes.push(class);
        self
    }

    pub fn add_root(&mut self, object_id: ObjectId) -> &mut Self {
        self.roots.push(object_id);
        self
    }

    pub fn add_instance(
        &mut self,
        object_id: ObjectId,
        class_id: ClassId,
        shallow_size: u64,
        field_refs: &[ObjectId],
    ) -> &mut Self {
        self.record_header(TAG_INSTANCE, object_id, class_id, shallow_size);
        self.records
            .extend_from_slice(&(field_refs.len() as u16).to_le_bytes());
        for &r in field_refs {
            self.records.extend_from_slice(&r.to_le_bytes());
        }
        self
    }

    pub fn add_object_array(
        &mut self,
        object_id: ObjectId,
        class_id: ClassId,
        shallow_size: u64,
        elements: &[ObjectId],
    ) -> &mut Self {
        self.record_header(TAG_OBJECT_ARRAY, object_id, class_id, shallow_size);
        self.records
            .extend_from_slice(&(elements.len() as u32).to_le_bytes());
        for &e in elements {
            self.records.extend_from_slice(&e.to_le_bytes());
        }
        self
    }

    pub fn add_primitive_array(
        &mut self,
        object_id: ObjectId,
        class_id: ClassId,
        shallow_size: u64,
    ) -> &mut Self {
        self.record_header(TAG_PRIMITIVE_ARRAY, object_id, class_id, shallow_size);
        self
    }

    /// The heap object representing a class; its outgoing references are the
    /// class's static reference fields.
    pub fn add_class_object(&mut self, class_id: ClassId, shallow_size: u64) -> &mut Self {
        self.record_header(TAG_CLASS_OBJECT, class_id, class_id, shallow_size);
        self
    }

    fn record_header(&mut self, record_tag: u8, object_id: u64, class_id: u64, shallow: u64) {
        self.object_count += 1;
        self.records.push(record_tag);
        self.records.extend_from_slice(&object_id.to_le_bytes());
        self.records.extend_from_slice(&class_id.to_le_bytes());
        self.records.extend_from_slice(&shallow.to_le_bytes());
    }

    pub fn write_to(&self, path: &Path) -> Result<(), HprofRetainError> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;
        out.write_all(&[self.id_size as u8, 0])?;
        out.write_all(&(self.classes.len() as u32).to_le_bytes())?;
        out.write_all(&(self.roots.len() as u32).to_le_bytes())?;
        out.write_all(&self.object_count.to_le_bytes())?;
        for class in &self.classes {
            out.write_all(&class.class_id.to_le_bytes())?;
            out.write_all(&class.super_id.to_le_bytes())?;
            out.write_all(&[class.kind as u8])?;
            out.write_all(&class.instance_size.to_le_bytes())?;
            write_utf8(&mut out, &class.name)?;
            out.write_all(&(class.object_fields.len() as u16).to_le_bytes())?;
            for field in &class.object_fields {
                write_utf8(&mut out, field)?;
            }
            out.write_all(&(class.static_refs.len() as u16).to_le_bytes())?;
            for &r in &class.static_refs {
                out.write_all(&r.to_le_bytes())?;
            }
        }
        for &root in &self.roots {
            out.write_all(&root.to_le_bytes())?;
        }
        out.write_all(&self.records)?;
        out.flush()?;
        Ok(())
    }
}

fn write_utf8<W: Write>(out: &mut W, s: &str) -> Result<(), HprofRetainError> {
    out.write_all(&(s.len() as u16).to_le_bytes())?;
    out.write_all(s.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_class(id: ClassId, name: &str, fields: &[&str], statics: &[u64]) -> ClassDef {
        ClassDef {
            class_id: id,
            super_id: 0,
            name: name.to_string(),
            kind: ClassKind::Instance,
            instance_size: 24,
            object_fields: fields.iter().map(|f| f.to_string()).collect(),
            static_refs: statics.to_vec(),
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("graph.bin");
        let mut writer = SnapshotWriter::new(8);
        writer
            .add_class(sample_class(0x100, "com.example.Holder", &["value"], &[0x20]))
            .add_class(sample_class(0x101, "[I", &[], &[]))
            .add_root(0x10)
            .add_instance(0x10, 0x100, 32, &[0x20])
            .add_instance(0x20, 0x100, 32, &[0x30])
            .add_object_array(0x30, 0x101, 48, &[0x40, 0, 0x10])
            .add_primitive_array(0x40, 0x101, 64)
            .add_class_object(0x100, 80);
        writer.write_to(&path).unwrap();

        let reader = SnapshotReader::open(&path).unwrap();
        assert_eq!(reader.id_size(), 8);
        assert_eq!(reader.object_count(), 5);
        assert_eq!(reader.gc_roots(), &[0x10]);
        assert_eq!(reader.classes().len(), 2);
        assert_eq!(reader.classes()[0].name, "com.example.Holder");
        assert_eq!(reader.classes()[0].object_fields, vec!["value".to_string()]);

        let entries: Vec<(u64, u64)> = reader.objects().map(|r| r.unwrap()).collect();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].0, 0x10);
        assert_eq!(entries[4].0, 0x100);
        assert!(entries.windows(2).all(|w| w[0].1 < w[1].1));

        let holder = reader.object_at(entries[0].1).unwrap();
        assert_eq!(holder.shallow_size, 32);
        match holder.kind {
            ObjectKind::Instance { ref field_refs } => assert_eq!(field_refs, &[0x20]),
            _ => panic!("expected an instance"),
        }
        let array = reader.object_at(entries[2].1).unwrap();
        match array.kind {
            ObjectKind::ObjectArray { ref elements } => {
                assert_eq!(elements, &[0x40, 0, 0x10])
            }
            _ => panic!("expected an object array"),
        }
        let class_object = reader.object_at(entries[4].1).unwrap();
        match class_object.kind {
            ObjectKind::ClassObject { ref static_refs } => assert_eq!(static_refs, &[0x20]),
            _ => panic!("expected a class object"),
        }
    }

    #[test]
    fn rejects_a_foreign_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("not-a-snapshot.bin");
        std::fs::write(&path, b"JAVA PROFILE 1.0.2\0garbage").unwrap();
        assert!(matches!(
            SnapshotReader::open(&path),
            Err(HprofRetainError::MalformedDump { .. })
        ));
    }
}
