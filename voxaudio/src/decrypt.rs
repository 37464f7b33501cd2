//! # Streaming audio decryption
//!
//! Audio objects are encrypted whole (proprietary header included) with
//! AES-128 in counter mode. The counter starts at a fixed IV and advances
//! big-endian by one per 16-byte block, so the keystream for any byte
//! offset is computable directly and the wrapper can seek freely: the
//! keystream block for offset `o` is `AES(key, IV + o/16)` and the byte is
//! XORed with lane `o % 16` of that block.
//!
//! [`HeaderSkip`] then hides the 167-byte proprietary header from the
//! decoder, offsetting reads and seeks accordingly.

use std::io::{self, Read, Seek, SeekFrom};

use aes::{
    cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
    Aes128,
};

/// Fixed initial counter value shared by every audio object.
pub const AUDIO_IV: [u8; 16] = [
    0x72, 0xe0, 0x67, 0xfb, 0xdd, 0xcb, 0xcf, 0x77, 0xeb, 0xe8, 0xbc, 0x64, 0x3f, 0x63, 0x0d,
    0x93,
];

/// Size of the proprietary header preceding the audio payload.
pub const AUDIO_HEADER_LEN: u64 = 167;

const BLOCK: u64 = 16;

/// Seekable on-the-fly AES-CTR decryption over a raw (encrypted) stream.
pub struct AudioDecrypt<R> {
    cipher: Aes128,
    inner: R,
    position: u64,
}

impl<R> AudioDecrypt<R> {
    pub fn new(key: &[u8; 16], inner: R) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            inner,
            position: 0,
        }
    }

    /// Keystream block for a given 16-byte block index.
    fn keystream_block(&self, block_index: u64) -> [u8; 16] {
        let counter = u128::from_be_bytes(AUDIO_IV).wrapping_add(block_index as u128);
        let mut block = GenericArray::from(counter.to_be_bytes());
        self.cipher.encrypt_block(&mut block);
        block.into()
    }

    /// Applies the keystream to `buf`, which starts at stream offset `pos`.
    fn apply_keystream(&self, pos: u64, buf: &mut [u8]) {
        let mut offset = 0usize;
        while offset < buf.len() {
            let absolute = pos + offset as u64;
            let keystream = self.keystream_block(absolute / BLOCK);
            let lane = (absolute % BLOCK) as usize;
            let take = (BLOCK as usize - lane).min(buf.len() - offset);
            for i in 0..take {
                buf[offset + i] ^= keystream[lane + i];
            }
            offset += take;
        }
    }
}

impl<R: Read> Read for AudioDecrypt<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.apply_keystream(self.position, &mut buf[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Seek> Seek for AudioDecrypt<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        // Seeks map 1:1 onto the inner stream; the counter is recomputed
        // from the new absolute position on the next read.
        self.position = self.inner.seek(pos)?;
        Ok(self.position)
    }
}

/// Hides the first `skip` bytes of an inner stream.
///
/// Reported length is `max(0, inner_length - skip)`; seeking from the end
/// past the logical start clamps to offset zero.
pub struct HeaderSkip<R> {
    inner: R,
    skip: u64,
    /// Logical length after the skip.
    len: u64,
    position: u64,
}

impl<R: Read + Seek> HeaderSkip<R> {
    /// Builds the wrapper and positions the inner stream at `skip`.
    pub fn new(mut inner: R, skip: u64) -> io::Result<Self> {
        let inner_len = inner.seek(SeekFrom::End(0))?;
        let len = inner_len.saturating_sub(skip);
        inner.seek(SeekFrom::Start(skip))?;
        Ok(Self {
            inner,
            skip,
            len,
            position: 0,
        })
    }

    /// Hides the standard 167-byte audio header.
    pub fn over_audio_header(inner: R) -> io::Result<Self> {
        Self::new(inner, AUDIO_HEADER_LEN)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<R: Read + Seek> Read for HeaderSkip<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for HeaderSkip<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => self.len as i64 + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        }
        .max(0) as u64;

        let landed = self.inner.seek(SeekFrom::Start(target + self.skip))?;
        self.position = landed - self.skip;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
        0x0e, 0x0f,
    ];

    /// Reference: encrypt a plaintext with the same CTR construction.
    fn encrypt(plaintext: &[u8]) -> Vec<u8> {
        let decryptor = AudioDecrypt::new(&KEY, Cursor::new(Vec::<u8>::new()));
        let mut data = plaintext.to_vec();
        decryptor.apply_keystream(0, &mut data);
        data
    }

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 13) as u8).collect()
    }

    #[test]
    fn decrypts_full_stream() {
        let clear = plaintext(1000);
        let mut stream = AudioDecrypt::new(&KEY, Cursor::new(encrypt(&clear)));
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, clear);
    }

    #[test]
    fn seek_recomputes_the_counter() {
        let clear = plaintext(1000);
        let mut stream = AudioDecrypt::new(&KEY, Cursor::new(encrypt(&clear)));

        // Unaligned offset, read crossing several block boundaries.
        stream.seek(SeekFrom::Start(333)).unwrap();
        let mut out = vec![0u8; 100];
        stream.read_exact(&mut out).unwrap();
        assert_eq!(out, &clear[333..433]);

        // Backwards seek.
        stream.seek(SeekFrom::Start(5)).unwrap();
        let mut out = vec![0u8; 16];
        stream.read_exact(&mut out).unwrap();
        assert_eq!(out, &clear[5..21]);
    }

    #[test]
    fn header_bytes_are_decrypted_too() {
        let clear = plaintext(200);
        let mut stream = AudioDecrypt::new(&KEY, Cursor::new(encrypt(&clear)));
        let mut header = vec![0u8; AUDIO_HEADER_LEN as usize];
        stream.read_exact(&mut header).unwrap();
        assert_eq!(header, &clear[..AUDIO_HEADER_LEN as usize]);
    }

    #[test]
    fn tiny_reads_match_bulk_reads() {
        let clear = plaintext(64);
        let encrypted = encrypt(&clear);

        let mut bulk = AudioDecrypt::new(&KEY, Cursor::new(encrypted.clone()));
        let mut expected = Vec::new();
        bulk.read_to_end(&mut expected).unwrap();

        let mut byte_wise = AudioDecrypt::new(&KEY, Cursor::new(encrypted));
        let mut actual = Vec::new();
        let mut one = [0u8; 1];
        while byte_wise.read(&mut one).unwrap() == 1 {
            actual.push(one[0]);
        }
        assert_eq!(actual, expected);
        assert_eq!(actual, clear);
    }

    #[test]
    fn header_skip_reports_logical_length() {
        let body = plaintext(300);
        let skip = HeaderSkip::over_audio_header(Cursor::new(body.clone())).unwrap();
        assert_eq!(skip.len(), 300 - AUDIO_HEADER_LEN);

        let short = HeaderSkip::over_audio_header(Cursor::new(vec![0u8; 100])).unwrap();
        assert_eq!(short.len(), 0);
        assert!(short.is_empty());
    }

    #[test]
    fn header_skip_offsets_reads_and_seeks() {
        let body = plaintext(300);
        let mut skip = HeaderSkip::over_audio_header(Cursor::new(body.clone())).unwrap();

        let mut head = vec![0u8; 10];
        skip.read_exact(&mut head).unwrap();
        assert_eq!(head, &body[167..177]);

        skip.seek(SeekFrom::Start(50)).unwrap();
        let mut mid = vec![0u8; 4];
        skip.read_exact(&mut mid).unwrap();
        assert_eq!(mid, &body[217..221]);

        // Seeking before the logical start from the end clamps to zero.
        let pos = skip.seek(SeekFrom::End(-10_000)).unwrap();
        assert_eq!(pos, 0);
        let mut again = vec![0u8; 4];
        skip.read_exact(&mut again).unwrap();
        assert_eq!(again, &body[167..171]);
    }
}
