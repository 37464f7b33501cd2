//! Read-path assembly for one audio object.
//!
//! The chunk store holds the object exactly as the CDN serves it:
//! encrypted. The head endpoint, by contrast, serves an already decrypted
//! prefix. [`HeadStitch`] splices the two: reads inside the head prefix
//! come from memory immediately, reads past it fall through to the
//! decrypting stream, so the decoder can sniff and start while the first
//! ranged fetches are still in flight.

use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;

/// A decrypted head prefix in front of a decrypting inner stream.
pub struct HeadStitch<R> {
    head: Bytes,
    inner: R,
    /// Logical read position.
    position: u64,
    /// Position the inner stream is currently at, lazily synced.
    inner_position: u64,
    len: u64,
}

impl<R: Read + Seek> HeadStitch<R> {
    pub fn new(head: Bytes, inner: R, len: u64) -> Self {
        Self {
            head,
            inner,
            position: 0,
            inner_position: 0,
            len,
        }
    }

    /// No head available; the stream is pure pass-through.
    pub fn without_head(inner: R, len: u64) -> Self {
        Self::new(Bytes::new(), inner, len)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<R: Read + Seek> Read for HeadStitch<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.len || buf.is_empty() {
            return Ok(0);
        }

        // Serve from the in-memory head while inside it.
        if self.position < self.head.len() as u64 {
            let start = self.position as usize;
            let take = (self.head.len() - start).min(buf.len());
            buf[..take].copy_from_slice(&self.head[start..start + take]);
            self.position += take as u64;
            return Ok(take);
        }

        if self.inner_position != self.position {
            self.inner.seek(SeekFrom::Start(self.position))?;
            self.inner_position = self.position;
        }
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        self.inner_position = self.position;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for HeadStitch<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => self.len as i64 + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn body() -> Vec<u8> {
        (0..100u8).collect()
    }

    #[test]
    fn head_serves_the_prefix_inner_serves_the_tail() {
        let data = body();
        let head = Bytes::copy_from_slice(&data[..30]);
        let mut stitched = HeadStitch::new(head, Cursor::new(data.clone()), 100);

        let mut out = Vec::new();
        stitched.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn seeks_cross_the_boundary_both_ways() {
        let data = body();
        let head = Bytes::copy_from_slice(&data[..30]);
        let mut stitched = HeadStitch::new(head, Cursor::new(data.clone()), 100);

        stitched.seek(SeekFrom::Start(50)).unwrap();
        let mut four = [0u8; 4];
        stitched.read_exact(&mut four).unwrap();
        assert_eq!(four, data[50..54]);

        stitched.seek(SeekFrom::Start(10)).unwrap();
        stitched.read_exact(&mut four).unwrap();
        assert_eq!(four, data[10..14]);

        stitched.seek(SeekFrom::End(-4)).unwrap();
        stitched.read_exact(&mut four).unwrap();
        assert_eq!(four, data[96..100]);
    }

    #[test]
    fn reads_straddling_the_boundary() {
        let data = body();
        let head = Bytes::copy_from_slice(&data[..30]);
        let mut stitched = HeadStitch::new(head, Cursor::new(data.clone()), 100);

        stitched.seek(SeekFrom::Start(28)).unwrap();
        let mut out = [0u8; 6];
        stitched.read_exact(&mut out).unwrap();
        assert_eq!(out, data[28..34]);
    }
}
