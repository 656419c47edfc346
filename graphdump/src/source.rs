use crate::errors::ReadError;

use itertools::Itertools;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Magic prefix of every dump stream, followed by one byte each of major and
/// minor version.
pub const MAGIC: &[u8; 4] = b"BIGV";

/// Highest dump version this reader understands.  Streams declaring a
/// strictly greater `major.minor` are rejected.
pub const MAJOR_VERSION: u8 = 1;
pub const MINOR_VERSION: u8 = 0;

const BUFFER_CAPACITY: usize = 256 * 1024;

/// SHA-256 over a contiguous span of consumed stream bytes.  Equal digests
/// mean the two spans were byte-for-byte identical.
pub type ContentDigest = [u8; 32];

/// Cancellation flag and progress counter shared between a running load and
/// its observers.  The source checks the flag at every buffer refill, which
/// is the single suspension point of the decoder.
#[derive(Debug, Default)]
pub struct Feedback {
    cancelled: AtomicBool,
    progress: AtomicU64,
}

impl Feedback {
    pub fn new() -> Arc<Feedback> {
        Arc::new(Feedback::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Absolute stream offset the source has fetched up to.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    fn set_progress(&self, offset: u64) {
        self.progress.store(offset, Ordering::Relaxed);
    }
}

/// Per-stream string charset, locked by the first non-empty string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StringEncoding {
    Utf8,
    Utf16,
}

/// Outcome of probing for a stream header at the current position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Header {
    /// Magic found and consumed together with its version bytes.
    Stream { major: u8, minor: u8 },
    /// Bytes available but they do not start with the magic.
    Absent,
    /// Clean end of the channel, nothing left to read.
    Eof,
}

/// Buffered big-endian decoder over a readable byte channel.
///
/// Tracks the absolute stream offset of the next unread byte (`mark`),
/// maintains an optional SHA-256 digest over a window of consumed bytes and
/// detects the `BIGV` stream header.  All reads fail with
/// [`ReadError::UnexpectedEof`] when the channel runs dry mid-value.
pub struct BinarySource {
    channel: Box<dyn Read + Send>,
    buf: Box<[u8]>,
    /// Index of the next unread byte in `buf`.
    start: usize,
    /// Index one past the last valid byte in `buf`.
    end: usize,
    /// Absolute stream offset of `buf[0]`.
    base: u64,
    digest: Option<Sha256>,
    /// Index in `buf` of the first digested-but-not-yet-hashed byte.
    /// Invariant: `digest_from <= start` whenever a digest is active.
    digest_from: usize,
    encoding: Option<StringEncoding>,
    feedback: Option<Arc<Feedback>>,
}

impl BinarySource {
    pub fn new(channel: Box<dyn Read + Send>) -> Self {
        Self::new_at(channel, 0)
    }

    /// A source whose first byte sits at absolute offset `base` of the
    /// original stream.  Used when decoding an indexed sub-range, so that
    /// reported offsets stay meaningful.
    pub fn new_at(channel: Box<dyn Read + Send>, base: u64) -> Self {
        Self::with_capacity(channel, base, BUFFER_CAPACITY)
    }

    pub(crate) fn with_capacity(channel: Box<dyn Read + Send>, base: u64, capacity: usize) -> Self {
        BinarySource {
            channel,
            buf: vec![0u8; capacity.max(16)].into_boxed_slice(),
            start: 0,
            end: 0,
            base,
            digest: None,
            digest_from: 0,
            encoding: None,
            feedback: None,
        }
    }

    pub fn set_feedback(&mut self, feedback: Arc<Feedback>) {
        self.feedback = Some(feedback);
    }

    /// Absolute offset of the next unread byte; equals the number of bytes
    /// consumed so far for a source created with `new`.
    pub fn mark(&self) -> u64 {
        self.base + self.start as u64
    }

    fn available(&self) -> usize {
        self.end - self.start
    }

    /// Pulls more bytes from the channel, first hashing and discarding the
    /// consumed prefix of the buffer.  Returns the number of fresh bytes, 0
    /// on end of channel.  This is the single cancellation point.
    fn fill(&mut self) -> Result<usize, ReadError> {
        if let Some(feedback) = &self.feedback
            && feedback.is_cancelled()
        {
            return Err(ReadError::Interrupted);
        }
        if self.start > 0 {
            if let Some(digest) = self.digest.as_mut() {
                digest.update(&self.buf[self.digest_from..self.start]);
            }
            self.buf.copy_within(self.start..self.end, 0);
            self.base += self.start as u64;
            self.end -= self.start;
            self.start = 0;
            self.digest_from = 0;
        }
        let n = self.channel.read(&mut self.buf[self.end..])?;
        self.end += n;
        if let Some(feedback) = &self.feedback {
            feedback.set_progress(self.base + self.end as u64);
        }
        Ok(n)
    }

    /// Makes at least `n` bytes available in the buffer.  `n` must not
    /// exceed the buffer capacity; larger transfers go through
    /// [`Self::read_vec`].
    fn ensure(&mut self, n: usize) -> Result<(), ReadError> {
        while self.available() < n {
            if self.fill()? == 0 {
                return Err(ReadError::UnexpectedEof {
                    offset: self.base + self.end as u64,
                });
            }
        }
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ReadError> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.start..self.start + N]);
        self.start += N;
        Ok(out)
    }

    pub fn read_byte(&mut self) -> Result<u8, ReadError> {
        Ok(self.take::<1>()?[0])
    }

    /// Reads one byte, treating a clean end of channel as `None`.  Used at
    /// record boundaries, where EOF is the legitimate terminator.
    pub fn try_read_byte(&mut self) -> Result<Option<u8>, ReadError> {
        while self.available() < 1 {
            if self.fill()? == 0 {
                return Ok(None);
            }
        }
        let b = self.buf[self.start];
        self.start += 1;
        Ok(Some(b))
    }

    pub fn read_short(&mut self) -> Result<i16, ReadError> {
        Ok(i16::from_be_bytes(self.take()?))
    }

    pub fn read_ushort(&mut self) -> Result<u16, ReadError> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    pub fn read_int(&mut self) -> Result<i32, ReadError> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    pub fn read_long(&mut self) -> Result<i64, ReadError> {
        Ok(i64::from_be_bytes(self.take()?))
    }

    pub fn read_float(&mut self) -> Result<f32, ReadError> {
        Ok(f32::from_be_bytes(self.take()?))
    }

    pub fn read_double(&mut self) -> Result<f64, ReadError> {
        Ok(f64::from_be_bytes(self.take()?))
    }

    /// Reads exactly `n` bytes, draining through the buffer so that `n` may
    /// exceed the buffer capacity.
    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>, ReadError> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.available() == 0 && self.fill()? == 0 {
                return Err(ReadError::UnexpectedEof { offset: self.mark() });
            }
            let take = (n - out.len()).min(self.available());
            out.extend_from_slice(&self.buf[self.start..self.start + take]);
            self.start += take;
        }
        Ok(out)
    }

    /// Length-prefixed blob; a negative length is the null marker.
    pub fn read_bytes(&mut self) -> Result<Option<Vec<u8>>, ReadError> {
        let len = self.read_int()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.read_vec(len as usize)?))
    }

    /// Length-prefixed string.  The charset is locked per stream by the
    /// first non-empty string: a leading zero byte selects UTF-16BE,
    /// anything else UTF-8.  A zero length is always the empty string and
    /// never participates in detection.
    pub fn read_string(&mut self) -> Result<String, ReadError> {
        let offset = self.mark();
        let len = self.read_int()?;
        if len < 0 {
            return Err(ReadError::protocol(offset, "negative string length"));
        }
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.read_vec(len as usize)?;
        let encoding = *self.encoding.get_or_insert(if bytes[0] == 0 {
            StringEncoding::Utf16
        } else {
            StringEncoding::Utf8
        });
        match encoding {
            StringEncoding::Utf8 => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            StringEncoding::Utf16 => {
                if bytes.len() % 2 != 0 {
                    return Err(ReadError::protocol(offset, "odd UTF-16 byte length"));
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(char::decode_utf16(units)
                    .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect())
            }
        }
    }

    /// Length-prefixed `i32` array rendered as `[a, b, c]`.
    pub fn read_ints_to_string(&mut self) -> Result<String, ReadError> {
        let offset = self.mark();
        let len = self.read_int()?;
        if len < 0 {
            return Err(ReadError::protocol(offset, "negative array length"));
        }
        let mut values = Vec::with_capacity(len as usize);
        for _ in 0..len {
            values.push(self.read_int()?);
        }
        Ok(format!("[{}]", values.iter().join(", ")))
    }

    /// Length-prefixed `f64` array rendered as `[a, b, c]`.
    pub fn read_doubles_to_string(&mut self) -> Result<String, ReadError> {
        let offset = self.mark();
        let len = self.read_int()?;
        if len < 0 {
            return Err(ReadError::protocol(offset, "negative array length"));
        }
        let mut values = Vec::with_capacity(len as usize);
        for _ in 0..len {
            values.push(self.read_double()?);
        }
        Ok(format!("[{}]", values.iter().join(", ")))
    }

    /// Probes for the stream magic at the current position.  Consumes the
    /// magic and the version bytes when present, re-arming charset
    /// detection for the new stream; otherwise consumes nothing.
    pub fn read_header(&mut self) -> Result<Header, ReadError> {
        while self.available() < MAGIC.len() {
            if self.fill()? == 0 {
                break;
            }
        }
        if self.available() == 0 {
            return Ok(Header::Eof);
        }
        if self.available() < MAGIC.len()
            || self.buf[self.start..self.start + MAGIC.len()] != MAGIC[..]
        {
            return Ok(Header::Absent);
        }
        self.start += MAGIC.len();
        let major = self.read_byte()?;
        let minor = self.read_byte()?;
        if (major, minor) > (MAJOR_VERSION, MINOR_VERSION) {
            return Err(ReadError::VersionMismatch {
                major,
                minor,
                max_major: MAJOR_VERSION,
                max_minor: MINOR_VERSION,
            });
        }
        self.encoding = None;
        Ok(Header::Stream { major, minor })
    }

    /// Consumes and discards bytes until `mark` reaches `target`.
    pub fn skip_to(&mut self, target: u64) -> Result<(), ReadError> {
        if target < self.mark() {
            return Err(ReadError::protocol(
                self.mark(),
                format!("cannot seek backwards to offset {target}"),
            ));
        }
        while self.mark() < target {
            if self.available() == 0 && self.fill()? == 0 {
                return Err(ReadError::UnexpectedEof { offset: self.mark() });
            }
            let take = ((target - self.mark()) as usize).min(self.available());
            self.start += take;
        }
        Ok(())
    }

    /// Starts a digest window at the current position.
    pub fn start_digest(&mut self) {
        self.digest = Some(Sha256::new());
        self.digest_from = self.start;
    }

    /// Finishes the digest window, hashing every byte consumed since
    /// [`Self::start_digest`].
    pub fn finish_digest(&mut self) -> ContentDigest {
        let mut digest = self.digest.take().unwrap_or_default();
        digest.update(&self.buf[self.digest_from..self.start]);
        self.digest_from = self.start;
        digest.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source(bytes: Vec<u8>) -> BinarySource {
        BinarySource::new(Box::new(Cursor::new(bytes)))
    }

    fn tiny_source(bytes: Vec<u8>, capacity: usize) -> BinarySource {
        BinarySource::with_capacity(Box::new(Cursor::new(bytes)), 0, capacity)
    }

    #[test]
    fn primitives_are_big_endian() {
        let mut bytes = vec![0x2a];
        bytes.extend(0x1234i16.to_be_bytes());
        bytes.extend(0x1234_5678i32.to_be_bytes());
        bytes.extend(0x1234_5678_9abc_def0u64.to_be_bytes());
        bytes.extend(1.5f32.to_be_bytes());
        bytes.extend((-2.5f64).to_be_bytes());
        let mut src = source(bytes);
        assert_eq!(src.read_byte().unwrap(), 0x2a);
        assert_eq!(src.read_short().unwrap(), 0x1234);
        assert_eq!(src.read_int().unwrap(), 0x1234_5678);
        assert_eq!(src.read_long().unwrap(), 0x1234_5678_9abc_def0u64 as i64);
        assert_eq!(src.read_float().unwrap(), 1.5);
        assert_eq!(src.read_double().unwrap(), -2.5);
        assert_eq!(src.mark(), 1 + 2 + 4 + 8 + 4 + 8);
    }

    #[test]
    fn eof_mid_value_fails() {
        let mut src = source(vec![0x00, 0x01]);
        let err = src.read_int().unwrap_err();
        assert!(matches!(err, ReadError::UnexpectedEof { .. }));
    }

    #[test]
    fn boundary_eof_is_clean() {
        let mut src = source(vec![0x07]);
        assert_eq!(src.try_read_byte().unwrap(), Some(0x07));
        assert_eq!(src.try_read_byte().unwrap(), None);
    }

    #[test]
    fn negative_blob_length_is_null() {
        let mut bytes = (-1i32).to_be_bytes().to_vec();
        bytes.extend(2i32.to_be_bytes());
        bytes.extend([0xaa, 0xbb]);
        let mut src = source(bytes);
        assert_eq!(src.read_bytes().unwrap(), None);
        assert_eq!(src.read_bytes().unwrap(), Some(vec![0xaa, 0xbb]));
    }

    fn utf8_string(s: &str) -> Vec<u8> {
        let mut out = (s.len() as i32).to_be_bytes().to_vec();
        out.extend(s.as_bytes());
        out
    }

    fn utf16_string(s: &str) -> Vec<u8> {
        let units: Vec<u16> = s.encode_utf16().collect();
        let mut out = ((units.len() * 2) as i32).to_be_bytes().to_vec();
        for unit in units {
            out.extend(unit.to_be_bytes());
        }
        out
    }

    #[test]
    fn utf8_detected_and_locked() {
        let mut bytes = utf8_string("hello");
        bytes.extend(utf8_string("world"));
        let mut src = source(bytes);
        assert_eq!(src.read_string().unwrap(), "hello");
        assert_eq!(src.read_string().unwrap(), "world");
    }

    #[test]
    fn utf16_detected_by_leading_zero_and_locked() {
        // First non-empty string is UTF-16 ("A" = 0x00 0x41); the second
        // string has a non-zero leading byte but must still decode UTF-16.
        let mut bytes = utf16_string("A");
        bytes.extend(utf16_string("\u{4e16}\u{754c}"));
        let mut src = source(bytes);
        assert_eq!(src.read_string().unwrap(), "A");
        assert_eq!(src.read_string().unwrap(), "\u{4e16}\u{754c}");
    }

    #[test]
    fn empty_string_does_not_lock_encoding() {
        let mut bytes = 0i32.to_be_bytes().to_vec();
        bytes.extend(utf16_string("A"));
        let mut src = source(bytes);
        assert_eq!(src.read_string().unwrap(), "");
        assert_eq!(src.read_string().unwrap(), "A");
    }

    #[test]
    fn int_and_double_arrays_render_bracketed() {
        let mut bytes = 3i32.to_be_bytes().to_vec();
        for v in [1i32, -2, 3] {
            bytes.extend(v.to_be_bytes());
        }
        bytes.extend(2i32.to_be_bytes());
        for v in [0.5f64, 2.0] {
            bytes.extend(v.to_be_bytes());
        }
        let mut src = source(bytes);
        assert_eq!(src.read_ints_to_string().unwrap(), "[1, -2, 3]");
        assert_eq!(src.read_doubles_to_string().unwrap(), "[0.5, 2]");
    }

    #[test]
    fn header_consumed_and_version_checked() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend([1, 0]);
        bytes.push(0x02);
        let mut src = source(bytes);
        assert_eq!(
            src.read_header().unwrap(),
            Header::Stream { major: 1, minor: 0 }
        );
        assert_eq!(src.mark(), 6);
        assert_eq!(src.read_header().unwrap(), Header::Absent);
        assert_eq!(src.read_byte().unwrap(), 0x02);
        assert_eq!(src.read_header().unwrap(), Header::Eof);
    }

    #[test]
    fn future_version_rejected() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend([MAJOR_VERSION, MINOR_VERSION + 1]);
        let mut src = source(bytes);
        assert!(matches!(
            src.read_header().unwrap_err(),
            ReadError::VersionMismatch { .. }
        ));
    }

    #[test]
    fn new_header_rearms_encoding_detection() {
        let mut bytes = utf16_string("A");
        bytes.extend(MAGIC.to_vec());
        bytes.extend([1, 0]);
        bytes.extend(utf8_string("plain"));
        let mut src = source(bytes);
        assert_eq!(src.read_string().unwrap(), "A");
        assert!(matches!(src.read_header().unwrap(), Header::Stream { .. }));
        assert_eq!(src.read_string().unwrap(), "plain");
    }

    #[test]
    fn digest_survives_buffer_refills() {
        let payload: Vec<u8> = (0..200u8).collect();
        let mut all = vec![0xff, 0xfe];
        all.extend(&payload);
        all.push(0x55);

        // Tiny buffer forces several compactions inside the digest window.
        let mut src = tiny_source(all, 16);
        src.read_byte().unwrap();
        src.read_byte().unwrap();
        src.start_digest();
        for expected in &payload {
            assert_eq!(src.read_byte().unwrap(), *expected);
        }
        let digest = src.finish_digest();
        assert_eq!(src.read_byte().unwrap(), 0x55);

        let mut reference = Sha256::new();
        reference.update(&payload);
        let expected: ContentDigest = reference.finalize().into();
        assert_eq!(digest, expected);
    }

    #[test]
    fn skip_to_advances_and_rejects_backwards() {
        let mut src = tiny_source((0..100u8).collect(), 8);
        src.skip_to(50).unwrap();
        assert_eq!(src.mark(), 50);
        assert_eq!(src.read_byte().unwrap(), 50);
        assert!(src.skip_to(10).is_err());
    }

    #[test]
    fn cancellation_observed_at_refill() {
        let feedback = Feedback::new();
        let mut src = tiny_source((0..64u8).collect(), 8);
        src.set_feedback(feedback.clone());
        src.read_byte().unwrap();
        feedback.cancel();
        // Remaining buffered bytes still read fine; the next refill fails.
        let mut result = Ok(0u8);
        for _ in 0..16 {
            result = src.read_byte();
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(ReadError::Interrupted)));
    }
}
