use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::cache::CacheDirectory;
use crate::errors::HprofRetainError;

/// Fixed-width integer element of a [`PagedStream`].
pub trait PagedValue: Copy + Eq {
    const ZERO: Self;
    const BYTES: usize;
    fn write_le(self, buf: &mut [u8]);
    fn read_le(buf: &[u8]) -> Self;
}

impl PagedValue for u32 {
    const ZERO: u32 = 0;
    const BYTES: usize = 4;

    fn write_le(self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(buf: &[u8]) -> u32 {
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }
}

impl PagedValue for u64 {
    const ZERO: u64 = 0;
    const BYTES: usize = 8;

    fn write_le(self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(buf: &[u8]) -> u64 {
        u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ])
    }
}

/// Append-only queue of fixed-width integers. Values live in a single
/// in-memory page until it overflows, at which point the whole stream spills
/// to a temp file and stays there. A stream is written, sealed with
/// [`start_reading`](PagedStream::start_reading), then consumed through a
/// single forward cursor; `read` returns zero once the data is exhausted, so
/// zero doubles as the end-of-level marker for the engines.
pub struct PagedStream<T: PagedValue> {
    cache: CacheDirectory,
    page: Vec<T>,
    page_size: usize,
    count: u64,
    read_pos: usize,
    backing: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    reader: Option<BufReader<File>>,
    reader_done: bool,
    spilled: bool,
}

pub type PagedIntStream = PagedStream<u32>;
pub type PagedLongStream = PagedStream<u64>;

impl<T: PagedValue> PagedStream<T> {
    pub fn new(page_size: usize, cache: &CacheDirectory) -> PagedStream<T> {
        PagedStream {
            cache: cache.clone(),
            page: Vec::with_capacity(page_size),
            page_size,
            count: 0,
            read_pos: 0,
            backing: None,
            writer: None,
            reader: None,
            reader_done: false,
            spilled: false,
        }
    }

    /// Rebuilds an in-memory stream from persisted values.
    pub fn from_memory(values: Vec<T>, page_size: usize, cache: &CacheDirectory) -> PagedStream<T> {
        let count = values.len() as u64;
        PagedStream {
            cache: cache.clone(),
            page: values,
            page_size,
            count,
            read_pos: 0,
            backing: None,
            writer: None,
            reader: None,
            reader_done: false,
            spilled: false,
        }
    }

    /// Rebuilds a spilled stream over a persisted backing file. The stream is
    /// read-only from here on.
    pub fn from_backing(
        path: PathBuf,
        count: u64,
        page_size: usize,
        cache: &CacheDirectory,
    ) -> PagedStream<T> {
        PagedStream {
            cache: cache.clone(),
            page: Vec::new(),
            page_size,
            count,
            read_pos: 0,
            backing: Some(path),
            writer: None,
            reader: None,
            reader_done: false,
            spilled: true,
        }
    }

    pub fn write(&mut self, value: T) -> Result<(), HprofRetainError> {
        if !self.spilled {
            if self.page.len() < self.page_size {
                self.page.push(value);
                self.count += 1;
                return Ok(());
            }
            self.spill()?;
        }
        let writer = self.writer.as_mut().ok_or_else(|| HprofRetainError::StdIoError {
            e: io::Error::new(io::ErrorKind::Other, "stream is sealed for reading"),
        })?;
        let mut buf = [0u8; 8];
        value.write_le(&mut buf);
        writer.write_all(&buf[..T::BYTES])?;
        self.count += 1;
        Ok(())
    }

    // One-shot transition: flush the full page to the backing file and keep
    // appending there.
    fn spill(&mut self) -> Result<(), HprofRetainError> {
        let path = match &self.backing {
            Some(path) => path.clone(),
            None => {
                let path = self.cache.create_temp_file("retain", ".gc")?;
                self.backing = Some(path.clone());
                path
            }
        };
        let file = File::create(&path)?;
        let mut writer = BufWriter::with_capacity(self.page_size * T::BYTES, file);
        let mut buf = [0u8; 8];
        for value in &self.page {
            value.write_le(&mut buf);
            writer.write_all(&buf[..T::BYTES])?;
        }
        self.page.clear();
        self.writer = Some(writer);
        self.spilled = true;
        Ok(())
    }

    /// Seals writes and positions the read cursor at the beginning.
    pub fn start_reading(&mut self) -> Result<(), HprofRetainError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        self.read_pos = 0;
        self.reader = None;
        self.reader_done = false;
        if self.spilled {
            let path = self.backing.as_ref().expect("spilled stream has a backing file");
            let file = File::open(path)?;
            self.reader = Some(BufReader::with_capacity(self.page_size * T::BYTES, file));
        }
        Ok(())
    }

    /// Next value, or zero once the stream is exhausted.
    pub fn read(&mut self) -> Result<T, HprofRetainError> {
        if !self.spilled {
            if self.read_pos < self.page.len() {
                let value = self.page[self.read_pos];
                self.read_pos += 1;
                return Ok(value);
            }
            return Ok(T::ZERO);
        }
        if self.reader_done {
            return Ok(T::ZERO);
        }
        let reader = self.reader.as_mut().ok_or_else(|| HprofRetainError::StdIoError {
            e: io::Error::new(io::ErrorKind::Other, "start_reading was not called"),
        })?;
        let mut buf = [0u8; 8];
        match reader.read_exact(&mut buf[..T::BYTES]) {
            Ok(()) => Ok(T::read_le(&buf)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.reader_done = true;
                self.reader = None;
                Ok(T::ZERO)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn size(&self) -> u64 {
        self.count
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }

    /// Clears the stream for reuse as a fresh write buffer. The backing file,
    /// if any, is kept around and truncated on the next spill.
    pub fn reset(&mut self) -> Result<(), HprofRetainError> {
        self.writer = None;
        self.reader = None;
        self.reader_done = false;
        self.page.clear();
        self.count = 0;
        self.read_pos = 0;
        self.spilled = false;
        Ok(())
    }

    /// Produces a new stream whose read sequence is the reverse of this one's
    /// write sequence. Spilled data is swept backwards one page-sized chunk at
    /// a time; the original stream is left untouched.
    pub fn reverse(&mut self) -> Result<PagedStream<T>, HprofRetainError> {
        let mut reverted = PagedStream::new(self.page_size, &self.cache);
        if !self.spilled {
            for value in self.page.iter().rev() {
                reverted.write(*value)?;
            }
            reverted.start_reading()?;
            return Ok(reverted);
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        let path = self.backing.as_ref().expect("spilled stream has a backing file");
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        if size % T::BYTES as u64 != 0 {
            return Err(HprofRetainError::malformed(format!(
                "{} size ({size}) is not divisible by {}",
                path.display(),
                T::BYTES
            )));
        }
        if size > 0 {
            let cap = std::cmp::min(size, (self.page_size * T::BYTES) as u64) as usize;
            let mut buf = vec![0u8; cap];
            let mut to = size;
            let mut from = to - cap as u64;
            loop {
                let len = (to - from) as usize;
                file.seek(SeekFrom::Start(from))?;
                file.read_exact(&mut buf[..len])?;
                let mut off = len;
                while off >= T::BYTES {
                    off -= T::BYTES;
                    reverted.write(T::read_le(&buf[off..off + T::BYTES]))?;
                }
                to = from;
                if from >= cap as u64 {
                    from -= cap as u64;
                } else if from > 0 {
                    from = 0;
                } else {
                    break;
                }
            }
        }
        reverted.start_reading()?;
        Ok(reverted)
    }

    /// Releases the backing temp file, if any.
    pub fn delete(&mut self) -> Result<(), HprofRetainError> {
        self.writer = None;
        self.reader = None;
        self.reader_done = false;
        self.page.clear();
        self.count = 0;
        self.read_pos = 0;
        self.spilled = false;
        if let Some(path) = self.backing.take() {
            if path.is_file() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Completes any pending writes to the backing file so it can be
    /// persisted as-is.
    pub fn flush(&mut self) -> Result<(), HprofRetainError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn is_spilled(&self) -> bool {
        self.spilled
    }

    pub fn backing_path(&self) -> Option<&Path> {
        self.backing.as_deref()
    }

    /// Contents of an in-memory stream, for persistence.
    pub fn memory_values(&self) -> &[T] {
        &self.page
    }
}
