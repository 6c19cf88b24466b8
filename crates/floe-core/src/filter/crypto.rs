//! Framed authenticated encryption for container streams.
//!
//! Stream layout:
//! `[magic 8][version 1][cipher 1][m_cost 4][t_cost 4][p_cost 4][salt 16]`
//! followed by frames `[last 1][len 4][nonce 12][ciphertext+tag]`.
//! Each frame is sealed with the frame index and the last flag as AAD, so
//! dropped, reordered or truncated frames fail to open.

use std::io::{self, Read, Write};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;

use floe_types::{FloeError, Result};

use super::key::{KdfParams, PassphraseKey, SALT_LEN};
use crate::config::CipherKind;

const MAGIC: &[u8; 8] = b"FLOE-ENC";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 8 + 1 + 1 + 12 + SALT_LEN;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
pub const FRAME_SIZE: usize = 1024 * 1024;

const CIPHER_AES: u8 = 1;
const CIPHER_CHACHA: u8 = 2;

enum FrameCipher {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl FrameCipher {
    fn new(kind: CipherKind, key: &[u8; 32]) -> Result<Self> {
        match kind {
            CipherKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map(|c| FrameCipher::Aes(Box::new(c)))
                .map_err(|e| FloeError::KeyDerivation(format!("cipher init: {e}"))),
            CipherKind::Chacha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map(|c| FrameCipher::ChaCha(Box::new(c)))
                .map_err(|e| FloeError::KeyDerivation(format!("cipher init: {e}"))),
        }
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], aad: &[u8], msg: &[u8]) -> io::Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        let out = match self {
            FrameCipher::Aes(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            FrameCipher::ChaCha(c) => {
                c.encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        };
        out.map_err(|e| io::Error::other(FloeError::Other(format!("frame encrypt: {e}"))))
    }

    fn open(&self, nonce: &[u8], aad: &[u8], msg: &[u8]) -> io::Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        let out = match self {
            FrameCipher::Aes(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            FrameCipher::ChaCha(c) => {
                c.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        };
        out.map_err(|_| decryption_failed())
    }
}

fn decryption_failed() -> io::Error {
    io::Error::other(FloeError::DecryptionFailed)
}

fn frame_aad(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_le_bytes());
    aad[8] = u8::from(last);
    aad
}

fn encode_header(kind: CipherKind, params: &KdfParams, salt: &[u8; SALT_LEN]) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[..8].copy_from_slice(MAGIC);
    h[8] = VERSION;
    h[9] = match kind {
        CipherKind::Aes256Gcm => CIPHER_AES,
        CipherKind::Chacha20Poly1305 => CIPHER_CHACHA,
    };
    h[10..14].copy_from_slice(&params.memory_cost.to_le_bytes());
    h[14..18].copy_from_slice(&params.time_cost.to_le_bytes());
    h[18..22].copy_from_slice(&params.parallelism.to_le_bytes());
    h[22..].copy_from_slice(salt);
    h
}

fn decode_header(h: &[u8; HEADER_LEN]) -> Result<(CipherKind, KdfParams, [u8; SALT_LEN])> {
    if &h[..8] != MAGIC {
        return Err(FloeError::DecryptionFailed);
    }
    if h[8] != VERSION {
        return Err(FloeError::Other(format!(
            "unsupported encryption format version {}",
            h[8]
        )));
    }
    let kind = match h[9] {
        CIPHER_AES => CipherKind::Aes256Gcm,
        CIPHER_CHACHA => CipherKind::Chacha20Poly1305,
        other => return Err(FloeError::Other(format!("unknown cipher id {other}"))),
    };
    let u32_at = |i: usize| u32::from_le_bytes([h[i], h[i + 1], h[i + 2], h[i + 3]]);
    let params = KdfParams {
        memory_cost: u32_at(10),
        time_cost: u32_at(14),
        parallelism: u32_at(18),
    };
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&h[22..]);
    Ok((kind, params, salt))
}

/// Seals everything written to it. Call [`EncryptWriter::finish`] to emit the
/// final frame; a stream dropped without it reads back as truncated.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: FrameCipher,
    buf: Vec<u8>,
    index: u64,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(mut inner: W, key: &PassphraseKey) -> Result<Self> {
        let sealing = key.sealing_key()?;
        let cipher = FrameCipher::new(key.cipher(), &sealing)?;
        inner.write_all(&encode_header(
            key.cipher(),
            &key.params(),
            &key.session_salt(),
        ))?;
        Ok(Self {
            inner,
            cipher,
            buf: Vec::with_capacity(FRAME_SIZE),
            index: 0,
        })
    }

    fn emit(&mut self, last: bool) -> io::Result<()> {
        let take = self.buf.len().min(FRAME_SIZE);
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .seal(&nonce, &frame_aad(self.index, last), &self.buf[..take])?;
        self.inner.write_all(&[u8::from(last)])?;
        self.inner.write_all(&(sealed.len() as u32).to_le_bytes())?;
        self.inner.write_all(&nonce)?;
        self.inner.write_all(&sealed)?;
        self.buf.drain(..take);
        self.index += 1;
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<W> {
        while self.buf.len() > FRAME_SIZE {
            self.emit(false)?;
        }
        self.emit(true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        // A full frame is only sealed once more data follows it.
        while self.buf.len() > FRAME_SIZE {
            self.emit(false)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Opens a stream written by [`EncryptWriter`].
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: FrameCipher,
    plain: Vec<u8>,
    pos: usize,
    index: u64,
    done: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(mut inner: R, key: &PassphraseKey) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        inner.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => FloeError::DecryptionFailed,
            _ => FloeError::Io(e),
        })?;
        let (kind, params, salt) = decode_header(&header)?;
        let derived = key.key_for(&salt, &params)?;
        let cipher = FrameCipher::new(kind, &derived)?;
        Ok(Self {
            inner,
            cipher,
            plain: Vec::new(),
            pos: 0,
            index: 0,
            done: false,
        })
    }

    fn next_frame(&mut self) -> io::Result<()> {
        let mut flag = [0u8; 1];
        if let Err(e) = self.inner.read_exact(&mut flag) {
            return Err(match e.kind() {
                io::ErrorKind::UnexpectedEof => decryption_failed(),
                _ => e,
            });
        }
        let last = match flag[0] {
            0 => false,
            1 => true,
            _ => return Err(decryption_failed()),
        };
        let mut len = [0u8; 4];
        let mut nonce = [0u8; NONCE_LEN];
        self.read_frame_part(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        if !(TAG_LEN..=FRAME_SIZE + TAG_LEN).contains(&len) {
            return Err(decryption_failed());
        }
        self.read_frame_part(&mut nonce)?;
        let mut sealed = vec![0u8; len];
        self.read_frame_part(&mut sealed)?;

        self.plain = self
            .cipher
            .open(&nonce, &frame_aad(self.index, last), &sealed)?;
        self.pos = 0;
        self.index += 1;

        if last {
            self.done = true;
            let mut probe = [0u8; 1];
            if self.inner.read(&mut probe)? != 0 {
                return Err(decryption_failed());
            }
        }
        Ok(())
    }

    fn read_frame_part(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => decryption_failed(),
            _ => e,
        })
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.next_frame()?;
        }
        let n = out.len().min(self.plain.len() - self.pos);
        out[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::key::test_params;
    use crate::filter::lift_io_error;
    use zeroize::Zeroizing;

    fn key(kind: CipherKind) -> PassphraseKey {
        PassphraseKey::with_params(Zeroizing::new("correct horse".into()), kind, test_params())
    }

    fn seal(key: &PassphraseKey, data: &[u8]) -> Vec<u8> {
        let mut w = EncryptWriter::new(Vec::new(), key).unwrap();
        w.write_all(data).unwrap();
        w.finish().unwrap()
    }

    fn open(key: &PassphraseKey, sealed: &[u8]) -> Result<Vec<u8>> {
        let mut r = DecryptReader::new(sealed, key)?;
        let mut out = Vec::new();
        r.read_to_end(&mut out).map_err(lift_io_error)?;
        Ok(out)
    }

    #[test]
    fn multi_frame_stream_opens_with_both_ciphers() {
        let data: Vec<u8> = (0..FRAME_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        for kind in [CipherKind::Aes256Gcm, CipherKind::Chacha20Poly1305] {
            let k = key(kind);
            let sealed = seal(&k, &data);
            assert_eq!(open(&k, &sealed).unwrap(), data);
        }
    }

    #[test]
    fn empty_stream_has_final_frame() {
        let k = key(CipherKind::Aes256Gcm);
        let sealed = seal(&k, b"");
        assert!(sealed.len() > HEADER_LEN);
        assert!(open(&k, &sealed).unwrap().is_empty());
    }

    #[test]
    fn wrong_passphrase_fails() {
        let sealed = seal(&key(CipherKind::Aes256Gcm), b"secret data");
        let other = PassphraseKey::with_params(
            Zeroizing::new("wrong".into()),
            CipherKind::Aes256Gcm,
            test_params(),
        );
        assert!(matches!(open(&other, &sealed), Err(FloeError::DecryptionFailed)));
    }

    #[test]
    fn truncation_is_detected() {
        let k = key(CipherKind::Aes256Gcm);
        let data = vec![9u8; FRAME_SIZE + 100];
        let sealed = seal(&k, &data);
        // Cut after the first full frame: the final frame is missing.
        let first_frame = HEADER_LEN + 1 + 4 + NONCE_LEN + FRAME_SIZE + TAG_LEN;
        assert!(matches!(
            open(&k, &sealed[..first_frame]),
            Err(FloeError::DecryptionFailed)
        ));
    }

    #[test]
    fn flipped_bit_is_detected() {
        let k = key(CipherKind::Chacha20Poly1305);
        let mut sealed = seal(&k, b"some plaintext");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(open(&k, &sealed), Err(FloeError::DecryptionFailed)));
    }

    #[test]
    fn unencrypted_input_is_rejected() {
        let k = key(CipherKind::Aes256Gcm);
        let junk = vec![0u8; 64];
        assert!(matches!(open(&k, &junk), Err(FloeError::DecryptionFailed)));
    }
}
