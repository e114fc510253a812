//! Chunked payload sources for `program` transfers.

use {
    crate::error::Result,
    std::{
        fs::File,
        io::{BufReader, ErrorKind, Read, Seek, SeekFrom},
        path::Path,
    },
};

/// A payload read in bounded pieces.
pub trait ImageSource {
    /// Return the next `max_len` bytes, or fewer only when the source is
    /// exhausted. An empty vector means end of data.
    fn next_chunk(&mut self, max_len: usize) -> Result<Vec<u8>>;

    /// Total bytes the source will yield, when known up front.
    fn total_len(&self) -> Option<u64>;
}

impl<S: ImageSource + ?Sized> ImageSource for &mut S {
    fn next_chunk(&mut self, max_len: usize) -> Result<Vec<u8>> {
        (**self).next_chunk(max_len)
    }

    fn total_len(&self) -> Option<u64> {
        (**self).total_len()
    }
}

/// In-memory payload.
#[derive(Debug, Clone)]
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    /// Serve `data` from the start.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl ImageSource for SliceSource<'_> {
    fn next_chunk(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let end = (self.pos + max_len).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(chunk)
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Any reader, optionally limited to a byte count.
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
    remaining: Option<u64>,
    total: Option<u64>,
}

impl<R: Read> ReaderSource<R> {
    /// Read until EOF.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            remaining: None,
            total: None,
        }
    }

    /// Read at most `len` bytes.
    pub fn with_len(reader: R, len: u64) -> Self {
        Self {
            reader,
            remaining: Some(len),
            total: Some(len),
        }
    }

    /// Stop after `max` bytes even if the reader has more.
    #[must_use]
    pub fn limit(mut self, max: u64) -> Self {
        self.remaining = Some(self.remaining.map_or(max, |r| r.min(max)));
        self.total = self.total.map(|t| t.min(max));
        self
    }
}

impl<R: Read> ImageSource for ReaderSource<R> {
    #[allow(clippy::cast_possible_truncation)] // min() against a usize
    fn next_chunk(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let want = match self.remaining {
            Some(remaining) => remaining.min(max_len as u64) as usize,
            None => max_len,
        };

        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= filled as u64;
        }
        Ok(buf)
    }

    fn total_len(&self) -> Option<u64> {
        self.total
    }
}

/// A file, or a window of it starting at a sector offset.
pub type FileSource = ReaderSource<BufReader<File>>;

impl FileSource {
    /// Serve the whole file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let len = file
            .metadata()?
            .len();
        Ok(Self::with_len(BufReader::new(file), len))
    }

    /// Serve the file from byte `offset` to its end.
    pub fn open_at<P: AsRef<Path>>(path: P, offset: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        let len = file
            .metadata()?
            .len()
            .saturating_sub(offset);
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self::with_len(BufReader::new(file), len))
    }
}
