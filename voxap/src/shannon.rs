//! # Shannon stream cipher
//!
//! The access point frames every packet with the Shannon stream cipher, a
//! 32-bit word oriented cipher with an integrated MAC. The cipher keeps a
//! 16-word shift register plus a parallel CRC register; the MAC always
//! covers the plaintext, so `encrypt` folds each word into the MAC before
//! applying the keystream and `decrypt` does so after removing it.
//!
//! Usage is strictly per packet: call [`Shannon::nonce_u32`] with the packet
//! counter, process the packet bytes, then close the packet with
//! [`Shannon::finish`] or [`Shannon::check_mac`].

use thiserror::Error;

/// Number of 32-bit words in the shift register.
const N: usize = 16;

/// Cycles applied when diffusing register state.
const FOLD: usize = N;

/// Initialization constant for the key schedule.
const INITKONST: u32 = 0x6996_c53a;

/// Register index where key and MAC material is folded in.
const KEYP: usize = 13;

/// Required key length for the AP channel.
pub const KEY_LEN: usize = 32;

/// Length of the packet MAC.
pub const MAC_LEN: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShannonError {
    #[error("invalid cipher key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("MAC mismatch")]
    MacMismatch,
}

/// Shannon cipher state for one direction of the AP channel.
#[derive(Clone, Debug)]
pub struct Shannon {
    r: [u32; N],
    crc: [u32; N],
    init_r: [u32; N],
    konst: u32,
    sbuf: u32,
    mbuf: u32,
    nbuf: u32,
}

fn sbox1(mut w: u32) -> u32 {
    w ^= w.rotate_left(5) | w.rotate_left(7);
    w ^= w.rotate_left(19) | w.rotate_left(22);
    w
}

fn sbox2(mut w: u32) -> u32 {
    w ^= w.rotate_left(7) | w.rotate_left(22);
    w ^= w.rotate_left(5) | w.rotate_left(19);
    w
}

impl Shannon {
    /// Initializes the cipher from a 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self, ShannonError> {
        if key.len() != KEY_LEN {
            return Err(ShannonError::InvalidKeyLength(key.len()));
        }

        let mut cipher = Self {
            r: [0; N],
            crc: [0; N],
            init_r: [0; N],
            konst: INITKONST,
            sbuf: 0,
            mbuf: 0,
            nbuf: 0,
        };

        cipher.init_state();
        cipher.load_key(key);
        cipher.konst = cipher.r[0];
        cipher.init_r = cipher.r;
        cipher.nbuf = 0;

        Ok(cipher)
    }

    /// Resets per-packet state from a big-endian 32-bit packet counter.
    ///
    /// Must be called before each packet's `encrypt`/`decrypt` + `finish`.
    pub fn nonce_u32(&mut self, n: u32) {
        self.nonce(&n.to_be_bytes());
    }

    /// Resets per-packet state from an arbitrary nonce.
    pub fn nonce(&mut self, nonce: &[u8]) {
        self.r = self.init_r;
        self.konst = INITKONST;
        self.load_key(nonce);
        self.konst = self.r[0];
        self.nbuf = 0;
    }

    /// Folds `buf` into the MAC, then XORs the keystream into it in place.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        let mut i = 0;

        // Finish any partially processed word from a previous call.
        if self.nbuf != 0 {
            while self.nbuf != 0 && i < buf.len() {
                self.mbuf ^= (buf[i] as u32) << (32 - self.nbuf);
                buf[i] ^= ((self.sbuf >> (32 - self.nbuf)) & 0xff) as u8;
                i += 1;
                self.nbuf -= 8;
            }
            if self.nbuf != 0 {
                return;
            }
            // The register was already cycled when the word was started.
            let m = self.mbuf;
            self.mac_word(m);
        }

        // Whole words.
        let whole_end = i + ((buf.len() - i) & !0x3);
        while i < whole_end {
            self.cycle();
            let mut t = u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
            self.mac_word(t);
            t ^= self.sbuf;
            buf[i..i + 4].copy_from_slice(&t.to_le_bytes());
            i += 4;
        }

        // Trailing bytes open a fresh buffered word.
        if i < buf.len() {
            self.cycle();
            self.mbuf = 0;
            self.nbuf = 32;
            while self.nbuf != 0 && i < buf.len() {
                self.mbuf ^= (buf[i] as u32) << (32 - self.nbuf);
                buf[i] ^= ((self.sbuf >> (32 - self.nbuf)) & 0xff) as u8;
                i += 1;
                self.nbuf -= 8;
            }
        }
    }

    /// XORs the keystream into `buf` in place, then folds the recovered
    /// plaintext into the MAC.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        let mut i = 0;

        if self.nbuf != 0 {
            while self.nbuf != 0 && i < buf.len() {
                buf[i] ^= ((self.sbuf >> (32 - self.nbuf)) & 0xff) as u8;
                self.mbuf ^= (buf[i] as u32) << (32 - self.nbuf);
                i += 1;
                self.nbuf -= 8;
            }
            if self.nbuf != 0 {
                return;
            }
            let m = self.mbuf;
            self.mac_word(m);
        }

        let whole_end = i + ((buf.len() - i) & !0x3);
        while i < whole_end {
            self.cycle();
            let mut t = u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
            t ^= self.sbuf;
            self.mac_word(t);
            buf[i..i + 4].copy_from_slice(&t.to_le_bytes());
            i += 4;
        }

        if i < buf.len() {
            self.cycle();
            self.mbuf = 0;
            self.nbuf = 32;
            while self.nbuf != 0 && i < buf.len() {
                buf[i] ^= ((self.sbuf >> (32 - self.nbuf)) & 0xff) as u8;
                self.mbuf ^= (buf[i] as u32) << (32 - self.nbuf);
                i += 1;
                self.nbuf -= 8;
            }
        }
    }

    /// Closes the packet and writes its MAC into `out`.
    pub fn finish(&mut self, out: &mut [u8]) {
        // Flush a pending partial word into the MAC.
        if self.nbuf != 0 {
            let m = self.mbuf;
            self.mac_word(m);
        }

        // Perturb the MAC to mark end of input. Only the stream register is
        // touched, not the CRC, which defeats extension attacks.
        self.cycle();
        self.r[KEYP] ^= INITKONST ^ (self.nbuf << 3);
        self.nbuf = 0;

        for i in 0..N {
            self.r[i] ^= self.crc[i];
        }
        self.diffuse();

        let mut i = 0;
        while i < out.len() {
            self.cycle();
            let word = self.sbuf.to_le_bytes();
            let take = (out.len() - i).min(4);
            out[i..i + take].copy_from_slice(&word[..take]);
            i += take;
        }
    }

    /// Closes the packet and verifies its MAC against `expected`.
    pub fn check_mac(&mut self, expected: &[u8; MAC_LEN]) -> Result<(), ShannonError> {
        let mut actual = [0u8; MAC_LEN];
        self.finish(&mut actual);
        if &actual == expected {
            Ok(())
        } else {
            Err(ShannonError::MacMismatch)
        }
    }

    fn init_state(&mut self) {
        self.r[0] = 1;
        self.r[1] = 1;
        for i in 2..N {
            self.r[i] = self.r[i - 1].wrapping_add(self.r[i - 2]);
        }
        self.konst = INITKONST;
    }

    fn load_key(&mut self, key: &[u8]) {
        // Fold the key in one little-endian word at a time, zero padding
        // the final partial word.
        for word in key.chunks(4) {
            let mut padded = [0u8; 4];
            padded[..word.len()].copy_from_slice(word);
            self.r[KEYP] ^= u32::from_le_bytes(padded);
            self.cycle();
        }

        // Fold in the key length as well.
        self.r[KEYP] ^= key.len() as u32;
        self.cycle();

        // Save, diffuse and XOR the copy back so key loading cannot be
        // reversed from the register state.
        self.crc = self.r;
        self.diffuse();
        for i in 0..N {
            self.r[i] ^= self.crc[i];
        }
    }

    fn cycle(&mut self) {
        let mut t = self.r[12] ^ self.r[13] ^ self.konst;
        t = sbox1(t) ^ self.r[0].rotate_left(1);
        for i in 1..N {
            self.r[i - 1] = self.r[i];
        }
        self.r[N - 1] = t;

        let t = sbox2(self.r[2] ^ self.r[15]);
        self.r[0] ^= t;
        self.sbuf = t ^ self.r[8] ^ self.r[12];
    }

    fn diffuse(&mut self) {
        for _ in 0..FOLD {
            self.cycle();
        }
    }

    fn crc_word(&mut self, word: u32) {
        let t = self.crc[0] ^ self.crc[2] ^ self.crc[15] ^ word;
        for i in 1..N {
            self.crc[i - 1] = self.crc[i];
        }
        self.crc[N - 1] = t;
    }

    fn mac_word(&mut self, word: u32) {
        self.crc_word(word);
        self.r[KEYP] ^= word;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Vec<u8> {
        (0u8..32).collect()
    }

    #[test]
    fn rejects_short_key() {
        assert_eq!(
            Shannon::new(&[0u8; 16]).unwrap_err(),
            ShannonError::InvalidKeyLength(16)
        );
    }

    #[test]
    fn round_trip_with_mac() {
        let plaintext = b"Hello, Shannon Cipher!".to_vec();

        let mut enc = Shannon::new(&test_key()).unwrap();
        enc.nonce_u32(0);
        let mut buf = plaintext.clone();
        enc.encrypt(&mut buf);
        assert_ne!(buf, plaintext);
        let mut mac = [0u8; MAC_LEN];
        enc.finish(&mut mac);

        let mut dec = Shannon::new(&test_key()).unwrap();
        dec.nonce_u32(0);
        dec.decrypt(&mut buf);
        assert_eq!(buf, plaintext);
        dec.check_mac(&mac).unwrap();
    }

    #[test]
    fn corrupted_mac_fails() {
        let mut enc = Shannon::new(&test_key()).unwrap();
        enc.nonce_u32(7);
        let mut buf = b"payload bytes".to_vec();
        enc.encrypt(&mut buf);
        let mut mac = [0u8; MAC_LEN];
        enc.finish(&mut mac);

        for bit in 0..32 {
            let mut bad = mac;
            bad[bit / 8] ^= 1 << (bit % 8);

            let mut dec = Shannon::new(&test_key()).unwrap();
            dec.nonce_u32(7);
            let mut work = buf.clone();
            dec.decrypt(&mut work);
            assert_eq!(dec.check_mac(&bad), Err(ShannonError::MacMismatch));
        }
    }

    #[test]
    fn nonce_separates_packets() {
        let mut a = Shannon::new(&test_key()).unwrap();
        let mut b = Shannon::new(&test_key()).unwrap();

        let mut buf_a = b"same plaintext".to_vec();
        let mut buf_b = buf_a.clone();
        a.nonce_u32(1);
        b.nonce_u32(2);
        a.encrypt(&mut buf_a);
        b.encrypt(&mut buf_b);
        assert_ne!(buf_a, buf_b);
    }

    #[test]
    fn unaligned_chunks_match_single_pass() {
        // Encrypting in odd-sized slices must be equivalent to one pass.
        let data: Vec<u8> = (0u8..41).collect();

        let mut whole = Shannon::new(&test_key()).unwrap();
        whole.nonce_u32(3);
        let mut expected = data.clone();
        whole.encrypt(&mut expected);
        let mut expected_mac = [0u8; MAC_LEN];
        whole.finish(&mut expected_mac);

        let mut split = Shannon::new(&test_key()).unwrap();
        split.nonce_u32(3);
        let mut actual = data.clone();
        let (head, rest) = actual.split_at_mut(5);
        split.encrypt(head);
        let (mid, tail) = rest.split_at_mut(17);
        split.encrypt(mid);
        split.encrypt(tail);
        let mut actual_mac = [0u8; MAC_LEN];
        split.finish(&mut actual_mac);

        assert_eq!(actual, expected);
        assert_eq!(actual_mac, expected_mac);
    }

    #[test]
    fn mac_covers_plaintext_on_both_sides() {
        // The MAC computed while encrypting equals the MAC computed while
        // decrypting the resulting ciphertext.
        let mut enc = Shannon::new(&test_key()).unwrap();
        enc.nonce_u32(9);
        let mut buf = vec![0xA5u8; 100];
        enc.encrypt(&mut buf);
        let mut enc_mac = [0u8; MAC_LEN];
        enc.finish(&mut enc_mac);

        let mut dec = Shannon::new(&test_key()).unwrap();
        dec.nonce_u32(9);
        dec.decrypt(&mut buf);
        let mut dec_mac = [0u8; MAC_LEN];
        dec.finish(&mut dec_mac);

        assert_eq!(enc_mac, dec_mac);
    }
}
