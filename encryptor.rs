//! Multi-threaded encryption and decryption of in-memory buffers.
//!
//! The plaintext range is split with [`split_ranges`]; every worker opens its
//! own [`ContentStream`] over a disjoint region of the output buffer, seeks to
//! its part and transforms it. Output is identical for any thread count.

use std::io::{self, Cursor, Seek, SeekFrom, Write};
use tracing::debug;
use zeroize::Zeroizing;

use crate::cipher::{ProviderType, BLOCK_SIZE};
use crate::error::{Result, VaultError};
use crate::header::{physical_length, plaintext_length, EncryptionMode, Header, HEADER_LENGTH};
use crate::integrity::Integrity;
use crate::key_manager::SecretKey;
use crate::nonce::Nonce;
use crate::parallel::{split_ranges, WorkerPool};
use crate::streaming::{ContentStream, DEFAULT_BUFFER_SIZE};

/// Writable view of one worker's slice of the output, addressed with
/// offsets into the whole output.
struct RegionWriter<'a> {
    region: &'a mut [u8],
    offset: u64,
    pos: u64,
}

impl<'a> RegionWriter<'a> {
    fn new(region: &'a mut [u8], offset: u64) -> Self {
        Self {
            region,
            offset,
            pos: offset,
        }
    }
}

impl Write for RegionWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let start = self
            .pos
            .checked_sub(self.offset)
            .map(|s| s as usize)
            .filter(|s| s + buf.len() <= self.region.len())
            .ok_or_else(|| io::Error::other("write outside the worker's region"))?;
        self.region[start..start + buf.len()].copy_from_slice(buf);
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for RegionWriter<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let end = self.offset + self.region.len() as u64;
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => end.checked_add_signed(d),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        self.pos = target;
        Ok(target)
    }
}

/// Either a header or, for raw content, the IV.
#[derive(Clone, Copy)]
enum Framing<'a> {
    Header(Header),
    Raw(&'a [u8]),
}

fn align_of(integrity: &Integrity) -> u64 {
    match integrity.chunk_size() {
        0 => BLOCK_SIZE as u64,
        chunk => u64::from(chunk),
    }
}

/// Parallel buffer encryptor.
#[derive(Debug)]
pub struct Encryptor {
    pool: WorkerPool,
    provider: ProviderType,
    buffer_size: usize,
}

impl Encryptor {
    pub fn new(threads: usize, provider: ProviderType) -> Result<Self> {
        Ok(Self {
            pool: WorkerPool::new(threads)?,
            provider,
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Encrypts `data` as headered content under `nonce`.
    pub fn encrypt(
        &self,
        data: &[u8],
        key: &SecretKey,
        nonce: Nonce,
        integrity: &Integrity,
    ) -> Result<Vec<u8>> {
        let header = Header::new(nonce, integrity.chunk_size())?;
        self.run(data, key, Framing::Header(header), integrity)
    }

    /// Encrypts `data` as raw CTR ciphertext under `iv`.
    pub fn encrypt_raw(&self, data: &[u8], key: &SecretKey, iv: &[u8]) -> Result<Vec<u8>> {
        self.run(data, key, Framing::Raw(iv), &Integrity::disabled())
    }

    fn run(
        &self,
        data: &[u8],
        key: &SecretKey,
        framing: Framing<'_>,
        integrity: &Integrity,
    ) -> Result<Vec<u8>> {
        let chunk = integrity.chunk_size();
        let header_len = match framing {
            Framing::Header(_) => HEADER_LENGTH,
            Framing::Raw(_) => 0,
        };
        let mut out = vec![0u8; header_len + physical_length(data.len() as u64, chunk) as usize];
        let (head, mut body) = out.split_at_mut(header_len);
        if let Framing::Header(header) = framing {
            head.copy_from_slice(&header.to_bytes());
        }

        let parts = split_ranges(data.len() as u64, self.pool.threads(), align_of(integrity));
        let mut jobs = Vec::with_capacity(parts.len());
        for (start, len) in parts {
            let (region, rest) = std::mem::take(&mut body).split_at_mut(physical_length(len, chunk) as usize);
            body = rest;
            let offset = (header_len as u64) + physical_length(start, chunk);
            let plain = &data[start as usize..(start + len) as usize];
            jobs.push((start, plain, region, offset));
        }
        debug!(parts = jobs.len(), bytes = data.len(), "encrypting in parallel");

        self.pool.run(jobs, |(start, plain, region, offset)| {
            let window = RegionWriter::new(region, offset);
            let mut stream = match framing {
                Framing::Header(header) => ContentStream::attach(
                    window,
                    EncryptionMode::Encrypt,
                    key,
                    header,
                    integrity.clone(),
                    self.provider,
                )?,
                Framing::Raw(iv) => ContentStream::attach_raw(
                    window,
                    EncryptionMode::Encrypt,
                    key,
                    iv,
                    self.provider,
                )?,
            };
            stream.set_allow_range_write(true);
            stream.set_buffer_size(self.buffer_size);
            stream.seek_to(start)?;
            stream.write_plain(plain)?;
            stream.flush_pending()
        })?;
        Ok(out)
    }
}

/// Parallel buffer decryptor.
#[derive(Debug)]
pub struct Decryptor {
    pool: WorkerPool,
    provider: ProviderType,
    buffer_size: usize,
}

impl Decryptor {
    pub fn new(threads: usize, provider: ProviderType) -> Result<Self> {
        Ok(Self {
            pool: WorkerPool::new(threads)?,
            provider,
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Decrypts headered content. With `verify`, every chunk is checked
    /// and nothing is returned if any chunk fails.
    pub fn decrypt(
        &self,
        content: &[u8],
        key: &SecretKey,
        hash_key: Option<SecretKey>,
        verify: bool,
    ) -> Result<Vec<u8>> {
        let header = Header::parse(content)?;
        let integrity = Integrity::for_content(verify, hash_key, header.chunk_size())?;
        let length = plaintext_length((content.len() - HEADER_LENGTH) as u64, header.chunk_size());
        self.run(content, length, key, Framing::Header(header), &integrity)
    }

    pub fn decrypt_raw(&self, content: &[u8], key: &SecretKey, iv: &[u8]) -> Result<Vec<u8>> {
        self.run(
            content,
            content.len() as u64,
            key,
            Framing::Raw(iv),
            &Integrity::disabled(),
        )
    }

    fn run(
        &self,
        content: &[u8],
        length: u64,
        key: &SecretKey,
        framing: Framing<'_>,
        integrity: &Integrity,
    ) -> Result<Vec<u8>> {
        let mut out = Zeroizing::new(vec![0u8; length as usize]);
        let parts = split_ranges(length, self.pool.threads(), align_of(integrity));
        let mut jobs = Vec::with_capacity(parts.len());
        let mut rest: &mut [u8] = &mut out;
        for (start, len) in parts {
            let (region, tail) = std::mem::take(&mut rest).split_at_mut(len as usize);
            rest = tail;
            jobs.push((start, region));
        }
        debug!(parts = jobs.len(), bytes = length, "decrypting in parallel");

        self.pool.run(jobs, |(start, region)| {
            let base = Cursor::new(content);
            let mut stream = match framing {
                Framing::Header(header) => ContentStream::attach(
                    base,
                    EncryptionMode::Decrypt,
                    key,
                    header,
                    integrity.clone(),
                    self.provider,
                )?,
                Framing::Raw(iv) => ContentStream::attach_raw(
                    base,
                    EncryptionMode::Decrypt,
                    key,
                    iv,
                    self.provider,
                )?,
            };
            stream.set_buffer_size(self.buffer_size);
            stream.seek_to(start)?;
            let mut filled = 0;
            while filled < region.len() {
                match stream.read_plain(&mut region[filled..])? {
                    0 => return Err(VaultError::format("content ended before its expected length")),
                    n => filled += n,
                }
            }
            Ok(())
        })?;
        Ok(std::mem::take(&mut *out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn key() -> SecretKey {
        SecretKey::from_bytes([3u8; 32])
    }

    fn integrity(chunk: u32) -> Integrity {
        Integrity::for_writing(true, Some(SecretKey::from_bytes([4u8; 32])), chunk).unwrap()
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn serial(data: &[u8], chunk: u32) -> Vec<u8> {
        let mut stream = ContentStream::encrypt(
            Cursor::new(Vec::new()),
            &key(),
            Nonce::from_u64(5),
            integrity(chunk),
            ProviderType::Aes,
        )
        .unwrap();
        stream.write_all(data).unwrap();
        stream.finish().unwrap().into_inner()
    }

    #[test]
    fn parallel_encrypt_matches_serial() {
        let data = data(10_000);
        let expected = serial(&data, 256);
        for threads in [1, 2, 3, 4] {
            let encryptor = Encryptor::new(threads, ProviderType::Aes).unwrap().with_buffer_size(512);
            let out = encryptor
                .encrypt(&data, &key(), Nonce::from_u64(5), &integrity(256))
                .unwrap();
            assert_eq!(out, expected, "threads = {threads}");
        }
    }

    #[test]
    fn parallel_decrypt_is_thread_independent() {
        let data = data(33_333);
        let content = serial(&data, 1024);
        let hash_key = Some(SecretKey::from_bytes([4u8; 32]));
        let one = Decryptor::new(1, ProviderType::Aes)
            .unwrap()
            .decrypt(&content, &key(), hash_key.clone(), true)
            .unwrap();
        let four = Decryptor::new(4, ProviderType::AesCtr)
            .unwrap()
            .decrypt(&content, &key(), hash_key, true)
            .unwrap();
        assert_eq!(one, data);
        assert_eq!(four, one);
    }

    #[test]
    fn tamper_fails_whole_call() {
        let data = data(8192);
        let mut content = serial(&data, 256);
        let last = content.len() - 1;
        content[last] ^= 0xff;
        let err = Decryptor::new(4, ProviderType::Aes)
            .unwrap()
            .decrypt(&content, &key(), Some(SecretKey::from_bytes([4u8; 32])), true)
            .unwrap_err();
        assert!(err.is_integrity(), "{err:?}");
    }

    #[test]
    fn raw_roundtrip() {
        let data = data(4099);
        let iv = [9u8; 16];
        let encrypted = Encryptor::new(3, ProviderType::Aes)
            .unwrap()
            .encrypt_raw(&data, &key(), &iv)
            .unwrap();
        assert_eq!(encrypted.len(), data.len());
        let decrypted = Decryptor::new(2, ProviderType::Aes)
            .unwrap()
            .decrypt_raw(&encrypted, &key(), &iv)
            .unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn output_readable_by_stream() {
        let data = data(5000);
        let content = Encryptor::new(4, ProviderType::AesCtr)
            .unwrap()
            .encrypt(&data, &key(), Nonce::from_u64(8), &integrity(128))
            .unwrap();
        let mut stream = ContentStream::decrypt(
            Cursor::new(&content[..]),
            &key(),
            Some(SecretKey::from_bytes([4u8; 32])),
            true,
            ProviderType::Aes,
        )
        .unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }
}
