use memmap2::Mmap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

enum Backing {
    Mapped(Arc<Mmap>),
    Memory(Arc<Vec<u8>>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => map,
            Backing::Memory(bytes) => bytes,
        }
    }
}

impl Clone for Backing {
    fn clone(&self) -> Self {
        match self {
            Backing::Mapped(map) => Backing::Mapped(map.clone()),
            Backing::Memory(bytes) => Backing::Memory(bytes.clone()),
        }
    }
}

/// Random-access view of a stored dump, handing out independent sub-range
/// channels for lazy loads.  File-backed contents are memory-mapped, so a
/// sub-channel is a window, not a copy; every load gets its own cursor and
/// no cross-load locking is needed.
#[derive(Clone)]
pub struct CachedContent {
    backing: Backing,
}

impl CachedContent {
    /// Maps a dump file read-only.
    pub fn open(path: impl AsRef<Path>) -> io::Result<CachedContent> {
        let file = File::open(path)?;
        // Mapping is sound as long as the file is not truncated while
        // mapped; dump files are append-only.
        let map = unsafe { Mmap::map(&file)? };
        Ok(CachedContent {
            backing: Backing::Mapped(Arc::new(map)),
        })
    }

    /// Wraps an in-memory dump, mainly for tests and small inputs.
    pub fn from_bytes(bytes: Vec<u8>) -> CachedContent {
        CachedContent {
            backing: Backing::Memory(Arc::new(bytes)),
        }
    }

    pub fn len(&self) -> u64 {
        self.backing.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.backing.bytes().is_empty()
    }

    /// Reader over `[start, end)`, clamped to the stored length.
    pub fn sub_channel(&self, start: u64, end: u64) -> SubChannel {
        let len = self.len();
        let start = start.min(len) as usize;
        let end = end.clamp(start as u64, len) as usize;
        SubChannel {
            backing: self.backing.clone(),
            pos: start,
            end,
        }
    }

    /// Reader over the whole content.
    pub fn channel(&self) -> SubChannel {
        self.sub_channel(0, self.len())
    }
}

/// Cursor over a sub-range of a [`CachedContent`].
pub struct SubChannel {
    backing: Backing,
    pos: usize,
    end: usize,
}

impl Read for SubChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.backing.bytes()[self.pos..self.end];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sub_channels_are_independent_windows() {
        let content = CachedContent::from_bytes((0..32u8).collect());
        let mut a = content.sub_channel(4, 8);
        let mut b = content.sub_channel(4, 8);
        let mut buf = Vec::new();
        a.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, [4, 5, 6, 7]);
        buf.clear();
        b.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, [4, 5, 6, 7]);
    }

    #[test]
    fn out_of_range_is_clamped() {
        let content = CachedContent::from_bytes(vec![1, 2, 3]);
        let mut chan = content.sub_channel(2, 100);
        let mut buf = Vec::new();
        chan.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, [3]);
    }

    #[test]
    fn mapped_file_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"BIGVdata").unwrap();
        file.flush().unwrap();
        let content = CachedContent::open(file.path()).unwrap();
        assert_eq!(content.len(), 8);
        let mut buf = Vec::new();
        content.sub_channel(4, 8).read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"data");
    }
}
