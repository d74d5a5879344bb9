//! Storage for buffered part content.
//!
//! A [`WritableBlobFactory`] hands out [`WritableBlob`]s. The reader fills one with the decoded
//! body of a part and then freezes it into a shared, re-readable [`Blob`]. Content is released when
//! the last `Rc<dyn Blob>` is dropped.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::rc::Rc;

use bytes::{Buf, Bytes, BytesMut};
use derive_more::Display;
use tempfile::NamedTempFile;

use crate::constants;

/// Re-readable content.
pub trait Blob {
    /// The number of bytes in the blob. Fails if a lazily loaded blob can't load its content.
    fn size(&self) -> io::Result<u64>;

    /// Opens a fresh reader positioned at the start of the content.
    fn input_stream(&self) -> io::Result<Box<dyn Read>>;

    /// Copies the whole content to `out`.
    fn write_to(&self, out: &mut dyn Write) -> io::Result<u64> {
        let mut input = self.input_stream()?;
        io::copy(&mut input, out)
    }

    /// Reads the whole content into memory.
    fn to_bytes(&self) -> io::Result<Bytes> {
        let mut data = Vec::with_capacity(self.size()? as usize);
        self.input_stream()?.read_to_end(&mut data)?;
        Ok(Bytes::from(data))
    }

    /// A short name for the storage backing this blob, used in logs.
    fn kind(&self) -> &'static str;
}

/// Tells which side of a copy failed.
#[derive(Debug, Display)]
pub enum StreamCopyError {
    /// Reading from the source failed.
    #[display(fmt = "error reading from source: {}", _0)]
    Read(io::Error),
    /// Writing to the blob storage failed.
    #[display(fmt = "error writing to blob: {}", _0)]
    Write(io::Error),
}

impl std::error::Error for StreamCopyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamCopyError::Read(err) | StreamCopyError::Write(err) => Some(err),
        }
    }
}

/// A blob in the process of being filled.
pub trait WritableBlob {
    /// Copies everything `src` yields into the blob and returns the number of bytes copied.
    fn read_from(&mut self, src: &mut dyn Read) -> Result<u64, StreamCopyError>;

    /// Freezes the content into a shared, read-only blob.
    fn into_blob(self: Box<Self>) -> io::Result<Rc<dyn Blob>>;

    /// A short name for the storage backing this blob, used in logs.
    fn kind(&self) -> &'static str;
}

/// Creates the blobs buffered parts are stored in.
pub trait WritableBlobFactory {
    fn create_blob(&self) -> Box<dyn WritableBlob>;
}

impl<F: Fn() -> Box<dyn WritableBlob>> WritableBlobFactory for F {
    fn create_blob(&self) -> Box<dyn WritableBlob> {
        self()
    }
}

fn read_chunk(src: &mut dyn Read, chunk: &mut [u8]) -> Result<usize, StreamCopyError> {
    loop {
        match src.read(chunk) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(StreamCopyError::Read(err)),
        }
    }
}

/// Content held in memory.
#[derive(Debug, Clone)]
pub struct MemoryBlob {
    data: Bytes,
}

impl MemoryBlob {
    pub fn new<B: Into<Bytes>>(data: B) -> MemoryBlob {
        MemoryBlob { data: data.into() }
    }
}

impl Blob for MemoryBlob {
    fn size(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn input_stream(&self) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(self.data.clone().reader()))
    }

    fn write_to(&self, out: &mut dyn Write) -> io::Result<u64> {
        out.write_all(&self.data)?;
        Ok(self.data.len() as u64)
    }

    fn to_bytes(&self) -> io::Result<Bytes> {
        Ok(self.data.clone())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// A [`WritableBlob`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct WritableMemoryBlob {
    buf: BytesMut,
}

impl WritableBlob for WritableMemoryBlob {
    fn read_from(&mut self, src: &mut dyn Read) -> Result<u64, StreamCopyError> {
        let mut chunk = vec![0u8; constants::READ_CHUNK_SIZE];
        let mut total = 0;
        loop {
            let n = read_chunk(src, &mut chunk)?;
            if n == 0 {
                return Ok(total);
            }
            self.buf.extend_from_slice(&chunk[..n]);
            total += n as u64;
        }
    }

    fn into_blob(self: Box<Self>) -> io::Result<Rc<dyn Blob>> {
        Ok(Rc::new(MemoryBlob::new(self.buf.freeze())))
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// Creates [`WritableMemoryBlob`]s. This is the storage used for the root part, and the default
/// for attachments.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBlobFactory;

impl WritableBlobFactory for MemoryBlobFactory {
    fn create_blob(&self) -> Box<dyn WritableBlob> {
        Box::new(WritableMemoryBlob::default())
    }
}

/// Content spilled to a temporary file. The file is deleted when the blob is dropped.
#[derive(Debug)]
pub struct FileBlob {
    file: NamedTempFile,
    size: u64,
}

impl Blob for FileBlob {
    fn size(&self) -> io::Result<u64> {
        Ok(self.size)
    }

    fn input_stream(&self) -> io::Result<Box<dyn Read>> {
        let file: File = self.file.reopen()?;
        Ok(Box::new(file))
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

/// A [`WritableBlob`] that starts in memory and switches to a temporary file once its content
/// grows past a threshold.
#[derive(Debug)]
pub struct WritableOverflowBlob {
    threshold: usize,
    temp_dir: Option<PathBuf>,
    buf: BytesMut,
    overflow: Option<NamedTempFile>,
    size: u64,
}

impl WritableOverflowBlob {
    fn switch_to_overflow(&mut self) -> io::Result<()> {
        let mut file = match &self.temp_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        file.write_all(&self.buf)?;
        self.buf = BytesMut::new();
        self.overflow = Some(file);
        Ok(())
    }
}

impl WritableBlob for WritableOverflowBlob {
    fn read_from(&mut self, src: &mut dyn Read) -> Result<u64, StreamCopyError> {
        let mut chunk = vec![0u8; constants::READ_CHUNK_SIZE];
        let mut total = 0;
        loop {
            let n = read_chunk(src, &mut chunk)?;
            if n == 0 {
                if let Some(file) = &mut self.overflow {
                    file.flush().map_err(StreamCopyError::Write)?;
                }
                return Ok(total);
            }

            if self.overflow.is_none() && self.buf.len() + n > self.threshold {
                self.switch_to_overflow().map_err(StreamCopyError::Write)?;
            }
            match &mut self.overflow {
                Some(file) => file.write_all(&chunk[..n]).map_err(StreamCopyError::Write)?,
                None => self.buf.extend_from_slice(&chunk[..n]),
            }
            total += n as u64;
            self.size += n as u64;
        }
    }

    fn into_blob(self: Box<Self>) -> io::Result<Rc<dyn Blob>> {
        let this = *self;
        match this.overflow {
            Some(file) => Ok(Rc::new(FileBlob { file, size: this.size })),
            None => Ok(Rc::new(MemoryBlob::new(this.buf.freeze()))),
        }
    }

    fn kind(&self) -> &'static str {
        if self.overflow.is_some() {
            "file"
        } else {
            "memory"
        }
    }
}

/// Creates [`WritableOverflowBlob`]s, suitable for attachments that may be large.
///
/// # Examples
///
/// ```
/// use xop_multipart::OverflowBlobFactory;
///
/// let factory = OverflowBlobFactory::new(64 * 1024).temp_dir(std::env::temp_dir());
/// # let _ = factory;
/// ```
#[derive(Debug, Clone)]
pub struct OverflowBlobFactory {
    threshold: usize,
    temp_dir: Option<PathBuf>,
}

impl OverflowBlobFactory {
    /// Creates a factory for blobs that keep up to `threshold` bytes in memory.
    pub fn new(threshold: usize) -> OverflowBlobFactory {
        OverflowBlobFactory {
            threshold,
            temp_dir: None,
        }
    }

    /// Sets the directory temporary files are created in. Defaults to the system temp directory.
    pub fn temp_dir<P: Into<PathBuf>>(mut self, dir: P) -> OverflowBlobFactory {
        self.temp_dir = Some(dir.into());
        self
    }
}

impl Default for OverflowBlobFactory {
    fn default() -> Self {
        OverflowBlobFactory::new(constants::DEFAULT_OVERFLOW_THRESHOLD)
    }
}

impl WritableBlobFactory for OverflowBlobFactory {
    fn create_blob(&self) -> Box<dyn WritableBlob> {
        Box::new(WritableOverflowBlob {
            threshold: self.threshold,
            temp_dir: self.temp_dir.clone(),
            buf: BytesMut::new(),
            overflow: None,
            size: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::ConnectionReset, "connection reset"))
        }
    }

    #[test]
    fn test_memory_blob() {
        let mut blob = MemoryBlobFactory.create_blob();
        assert_eq!(blob.read_from(&mut &b"hello"[..]).unwrap(), 5);
        let blob = blob.into_blob().unwrap();
        assert_eq!(blob.size().unwrap(), 5);
        assert_eq!(blob.kind(), "memory");
        assert_eq!(blob.to_bytes().unwrap(), Bytes::from_static(b"hello"));

        let mut first = String::new();
        blob.input_stream().unwrap().read_to_string(&mut first).unwrap();
        let mut second = String::new();
        blob.input_stream().unwrap().read_to_string(&mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_overflow_blob_stays_in_memory_below_threshold() {
        let mut blob = OverflowBlobFactory::new(16).create_blob();
        blob.read_from(&mut &b"0123456789"[..]).unwrap();
        assert_eq!(blob.kind(), "memory");
        assert_eq!(blob.into_blob().unwrap().kind(), "memory");
    }

    #[test]
    fn test_overflow_blob_spills_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

        let mut blob = OverflowBlobFactory::new(1024).temp_dir(dir.path()).create_blob();
        assert_eq!(blob.read_from(&mut &data[..]).unwrap(), data.len() as u64);
        assert_eq!(blob.kind(), "file");

        let blob = blob.into_blob().unwrap();
        assert_eq!(blob.size().unwrap(), data.len() as u64);
        assert_eq!(blob.to_bytes().unwrap(), Bytes::from(data.clone()));

        let mut out = Vec::new();
        blob.write_to(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        drop(blob);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_read_failure_is_reported_as_read() {
        let mut blob = MemoryBlobFactory.create_blob();
        assert!(matches!(blob.read_from(&mut FailingReader), Err(StreamCopyError::Read(_))));
    }

    #[test]
    fn test_closure_factory() {
        let factory = || -> Box<dyn WritableBlob> { Box::new(WritableMemoryBlob::default()) };
        let blob = factory.create_blob();
        assert_eq!(blob.kind(), "memory");
    }
}
