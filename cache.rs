//! Cache-buffered reader for consumers that scrub back and forth, such as
//! media players.
//!
//! A miss at position `p` fills a buffer starting `back_offset` bytes before
//! `p`, since these consumers tend to re-request a position slightly before
//! their first request. Buffers are chosen deterministically: the first empty
//! one, otherwise the last slot. Buffer contents are zeroed when cleared and
//! when the reader is dropped.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use tracing::{debug, error};
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::BLOCK_SIZE;
use crate::error::{Result, VaultError};
use crate::parallel::{split_ranges, WorkerPool};
use crate::virtual_file::{FileStream, VirtualFile};

/// Default number of cache buffers
pub const DEFAULT_CACHE_BUFFERS: usize = 2;

/// Default size of one cache buffer
pub const DEFAULT_CACHE_BUFFER_SIZE: usize = 512 * 1024;

/// Default distance a fill starts before the requested position
pub const DEFAULT_BACK_OFFSET: u64 = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub buffers: usize,
    pub buffer_size: usize,
    pub back_offset: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            buffers: DEFAULT_CACHE_BUFFERS,
            buffer_size: DEFAULT_CACHE_BUFFER_SIZE,
            back_offset: DEFAULT_BACK_OFFSET,
        }
    }
}

/// Something that can hand out independent plaintext streams over the same
/// content, one per worker.
pub trait StreamSource: Sync {
    type Stream: Read + Seek;

    fn open_stream(&self) -> Result<Self::Stream>;

    /// Granularity fills are aligned to.
    fn alignment(&self) -> Result<u64> {
        Ok(BLOCK_SIZE as u64)
    }
}

impl StreamSource for VirtualFile<'_> {
    type Stream = FileStream;

    fn open_stream(&self) -> Result<FileStream> {
        self.input_stream()
    }

    fn alignment(&self) -> Result<u64> {
        Ok(match self.header()?.map(|h| h.chunk_size()) {
            Some(chunk) if chunk > 0 => u64::from(chunk),
            _ => BLOCK_SIZE as u64,
        })
    }
}

struct CacheBuffer {
    data: Zeroizing<Vec<u8>>,
    start: u64,
    len: usize,
}

impl CacheBuffer {
    fn empty() -> Self {
        Self {
            data: Zeroizing::new(Vec::new()),
            start: 0,
            len: 0,
        }
    }

    fn contains(&self, pos: u64) -> bool {
        self.len > 0 && pos >= self.start && pos < self.start + self.len as u64
    }

    fn clear(&mut self) {
        self.data[..].zeroize();
        self.start = 0;
        self.len = 0;
    }
}

pub type IntegrityCallback = Box<dyn FnMut(&VaultError) + Send>;

pub struct CachedReader<P: StreamSource> {
    source: P,
    stream: P::Stream,
    pool: Option<WorkerPool>,
    options: CacheOptions,
    buffers: Vec<CacheBuffer>,
    align: u64,
    position: u64,
    length: u64,
    on_integrity: Option<IntegrityCallback>,
    integrity_reported: bool,
}

impl<P: StreamSource> CachedReader<P> {
    pub fn new(source: P, options: CacheOptions) -> Result<Self> {
        Self::with_threads(source, options, 1)
    }

    /// Fills buffers with `threads` workers, each reading its part through
    /// its own stream.
    pub fn with_threads(source: P, options: CacheOptions, threads: usize) -> Result<Self> {
        if options.buffers == 0 || options.buffer_size == 0 {
            return Err(VaultError::config(
                "cache needs at least one non-empty buffer",
            ));
        }
        let mut stream = source.open_stream()?;
        let length = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(0))?;
        let align = source.alignment()?.max(1);
        let pool = if threads > 1 {
            Some(WorkerPool::new(threads)?)
        } else {
            None
        };
        Ok(Self {
            source,
            stream,
            pool,
            options,
            buffers: (0..options.buffers).map(|_| CacheBuffer::empty()).collect(),
            align,
            position: 0,
            length,
            on_integrity: None,
            integrity_reported: false,
        })
    }

    /// Registers a callback invoked once, on the first integrity failure.
    /// The error itself is still returned by every affected read.
    pub fn on_integrity_failure(mut self, callback: IntegrityCallback) -> Self {
        self.on_integrity = Some(callback);
        self
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// `(start, len)` of every filled buffer, in slot order.
    pub fn cached_ranges(&self) -> Vec<(u64, u64)> {
        self.buffers
            .iter()
            .filter(|b| b.len > 0)
            .map(|b| (b.start, b.len as u64))
            .collect()
    }

    /// Zeroes and empties every buffer.
    pub fn clear(&mut self) {
        for buffer in &mut self.buffers {
            buffer.clear();
        }
    }

    pub fn read_plain(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() || self.position >= self.length {
            return Ok(0);
        }
        let pos = self.position;
        let slot = match self.buffers.iter().position(|b| b.contains(pos)) {
            Some(slot) => slot,
            None => {
                let slot = self.select_slot();
                if let Err(err) = self.fill(slot, pos) {
                    self.buffers[slot].clear();
                    self.report(&err);
                    return Err(err);
                }
                slot
            }
        };
        let buffer = &self.buffers[slot];
        let from = (pos - buffer.start) as usize;
        let n = out.len().min(buffer.len - from);
        out[..n].copy_from_slice(&buffer.data[from..from + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn select_slot(&self) -> usize {
        self.buffers
            .iter()
            .position(|b| b.len == 0)
            .unwrap_or(self.buffers.len() - 1)
    }

    fn fill_start(&self, pos: u64) -> u64 {
        let size = self.options.buffer_size as u64;
        let align_down = |p: u64| p - p % self.align;
        let mut start = align_down(pos.saturating_sub(self.options.back_offset));
        if pos - start >= size {
            start = align_down(pos);
        }
        if pos - start >= size {
            start = pos;
        }
        start
    }

    fn fill(&mut self, slot: usize, pos: u64) -> Result<()> {
        let start = self.fill_start(pos);
        let len = (self.length - start).min(self.options.buffer_size as u64) as usize;
        debug!(slot, start, len, "cache miss");

        let buffer = &mut self.buffers[slot];
        buffer.clear();
        if buffer.data.len() < self.options.buffer_size {
            buffer.data = Zeroizing::new(vec![0u8; self.options.buffer_size]);
        }
        let target = &mut buffer.data[..len];
        match &self.pool {
            Some(pool) => {
                let mut jobs = Vec::new();
                let mut rest: &mut [u8] = target;
                for (offset, part) in split_ranges(len as u64, pool.threads(), self.align) {
                    let (region, tail) = std::mem::take(&mut rest).split_at_mut(part as usize);
                    rest = tail;
                    jobs.push((start + offset, region));
                }
                let source = &self.source;
                pool.run(jobs, |(at, region)| {
                    let mut stream = source.open_stream()?;
                    stream.seek(SeekFrom::Start(at))?;
                    read_full(&mut stream, region)
                })?;
            }
            None => {
                self.stream.seek(SeekFrom::Start(start))?;
                read_full(&mut self.stream, target)?;
            }
        }
        buffer.start = start;
        buffer.len = len;
        Ok(())
    }

    fn report(&mut self, err: &VaultError) {
        if !err.is_integrity() || self.integrity_reported {
            return;
        }
        self.integrity_reported = true;
        error!(error = %err, "integrity failure while reading cached content");
        if let Some(callback) = self.on_integrity.as_mut() {
            callback(err);
        }
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => return Err(VaultError::format("content ended before its expected length")),
            n => filled += n,
        }
    }
    Ok(())
}

impl<P: StreamSource> Read for CachedReader<P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_plain(buf).map_err(io::Error::from)
    }
}

impl<P: StreamSource> Seek for CachedReader<P> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        self.position = target;
        Ok(target)
    }
}

impl<P: StreamSource> fmt::Debug for CachedReader<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedReader")
            .field("options", &self.options)
            .field("position", &self.position)
            .field("length", &self.length)
            .field("cached", &self.cached_ranges())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::ProviderType;
    use crate::integrity::Integrity;
    use crate::key_manager::SecretKey;
    use crate::nonce::Nonce;
    use crate::streaming::ContentStream;
    use std::io::{Cursor, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const CHUNK: u32 = 4096;

    struct MemorySource {
        content: Vec<u8>,
    }

    impl MemorySource {
        fn new(data: &[u8]) -> Self {
            let integrity =
                Integrity::for_writing(true, Some(SecretKey::from_bytes([2u8; 32])), CHUNK).unwrap();
            let mut stream = ContentStream::encrypt(
                Cursor::new(Vec::new()),
                &SecretKey::from_bytes([1u8; 32]),
                Nonce::from_u64(77),
                integrity,
                ProviderType::Aes,
            )
            .unwrap();
            stream.write_all(data).unwrap();
            Self {
                content: stream.finish().unwrap().into_inner(),
            }
        }
    }

    impl StreamSource for MemorySource {
        type Stream = ContentStream<Cursor<Vec<u8>>>;

        fn open_stream(&self) -> Result<Self::Stream> {
            ContentStream::decrypt(
                Cursor::new(self.content.clone()),
                &SecretKey::from_bytes([1u8; 32]),
                Some(SecretKey::from_bytes([2u8; 32])),
                true,
                ProviderType::Aes,
            )
        }

        fn alignment(&self) -> Result<u64> {
            Ok(u64::from(CHUNK))
        }
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn reads_everything() {
        let data = data(200_000);
        for threads in [1, 3] {
            let options = CacheOptions {
                buffer_size: 40_000,
                ..Default::default()
            };
            let mut reader =
                CachedReader::with_threads(MemorySource::new(&data), options, threads).unwrap();
            assert_eq!(reader.length(), data.len() as u64);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            assert_eq!(out, data, "threads = {threads}");
        }
    }

    #[test]
    fn miss_fills_before_requested_position() {
        let data = data(300_000);
        let mut reader = CachedReader::new(MemorySource::new(&data), CacheOptions::default()).unwrap();
        reader.seek(SeekFrom::Start(100_000)).unwrap();
        let mut buf = [0u8; 10];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &data[100_000..100_010]);
        // 100000 - 32768 = 67232, aligned down to the chunk
        assert_eq!(reader.cached_ranges(), vec![(65_536, 300_000 - 65_536)]);

        reader.seek(SeekFrom::Start(99_000)).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &data[99_000..99_010]);
        assert_eq!(reader.cached_ranges().len(), 1);
    }

    #[test]
    fn evicts_last_slot() {
        let data = data(100_000);
        let options = CacheOptions {
            buffers: 2,
            buffer_size: 8192,
            back_offset: 0,
        };
        let mut reader = CachedReader::new(MemorySource::new(&data), options).unwrap();
        let mut buf = [0u8; 4];
        for pos in [0u64, 40_960, 81_920] {
            reader.seek(SeekFrom::Start(pos)).unwrap();
            reader.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, &data[pos as usize..pos as usize + 4]);
        }
        assert_eq!(reader.cached_ranges(), vec![(0, 8192), (81_920, 8192)]);

        reader.clear();
        assert!(reader.cached_ranges().is_empty());
    }

    #[test]
    fn integrity_failure_reported_once() {
        let data = data(50_000);
        let mut source = MemorySource::new(&data);
        let last = source.content.len() - 1;
        source.content[last] ^= 0x55;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let options = CacheOptions {
            buffer_size: 8192,
            back_offset: 0,
            ..Default::default()
        };
        let mut reader = CachedReader::new(source, options)
            .unwrap()
            .on_integrity_failure(Box::new(move |_: &VaultError| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        let mut buf = [0u8; 16];
        reader.read_exact(&mut buf).unwrap();
        for _ in 0..3 {
            reader.seek(SeekFrom::Start(49_990)).unwrap();
            let err = VaultError::from(reader.read(&mut buf).unwrap_err());
            assert!(err.is_integrity(), "{err:?}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejects_empty_cache() {
        let options = CacheOptions {
            buffers: 0,
            ..Default::default()
        };
        assert!(CachedReader::new(MemorySource::new(b"abc"), options).is_err());
    }
}
