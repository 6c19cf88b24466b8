//! Compression and encryption stages applied to an atom's container stream.
//!
//! Writing goes tar → compress → encrypt → sink; reading reverses it.

pub mod compress;
pub mod crypto;
pub mod key;

use std::io::{self, Read, Write};

use floe_types::{FloeError, Result};

use crate::branch::BehaviorFlags;
use crate::config::{CompressionAlgorithm, CompressionConfig};

pub use compress::{CompressWriter, DecompressReader};
pub use crypto::{DecryptReader, EncryptWriter};
pub use key::PassphraseKey;

/// Which stages apply to one atom, resolved from its branch flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterSpec {
    pub compression: Option<CompressionAlgorithm>,
    pub level: Option<i32>,
    pub encrypt: bool,
}

impl FilterSpec {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn for_branch(flags: BehaviorFlags, compression: &CompressionConfig) -> Self {
        Self {
            compression: flags.compress.then_some(compression.algorithm),
            level: compression.level,
            encrypt: flags.encrypt,
        }
    }

    /// Plain atoms are stored as loose files in the bag.
    pub fn is_plain(&self) -> bool {
        self.compression.is_none() && !self.encrypt
    }

    /// Suffix of the single inner entry a filtered atom becomes.
    pub fn entry_suffix(&self) -> String {
        let mut s = String::from(".tar");
        match self.compression {
            Some(CompressionAlgorithm::Gzip) => s.push_str(".gz"),
            Some(CompressionAlgorithm::Zstd) => s.push_str(".zst"),
            None => {}
        }
        if self.encrypt {
            s.push_str(".enc");
        }
        s
    }

    /// Split a filtered entry name into its stem and the stages it went through.
    pub fn parse_entry_name(name: &str) -> Option<(&str, FilterSpec)> {
        let (rest, encrypt) = match name.strip_suffix(".enc") {
            Some(r) => (r, true),
            None => (name, false),
        };
        let (rest, compression) = if let Some(r) = rest.strip_suffix(".gz") {
            (r, Some(CompressionAlgorithm::Gzip))
        } else if let Some(r) = rest.strip_suffix(".zst") {
            (r, Some(CompressionAlgorithm::Zstd))
        } else {
            (rest, None)
        };
        let stem = rest.strip_suffix(".tar")?;
        Some((
            stem,
            FilterSpec {
                compression,
                level: None,
                encrypt,
            },
        ))
    }
}

/// Encryption stage, or a pass-through.
pub enum Sink<W: Write> {
    Plain(W),
    Sealed(EncryptWriter<W>),
}

impl<W: Write> Sink<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Sink::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Sink::Sealed(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for Sink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Sealed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Sealed(w) => w.flush(),
        }
    }
}

/// Write side of the pipeline. [`FilterWriter::finish`] must be called.
pub struct FilterWriter<W: Write> {
    stage: CompressWriter<Sink<W>>,
}

impl<W: Write> FilterWriter<W> {
    pub fn new(inner: W, spec: FilterSpec, key: Option<&PassphraseKey>) -> Result<Self> {
        let sink = if spec.encrypt {
            let key = key.ok_or_else(|| {
                FloeError::Config("encryption requested but no passphrase is configured".into())
            })?;
            Sink::Sealed(EncryptWriter::new(inner, key)?)
        } else {
            Sink::Plain(inner)
        };
        let stage = CompressWriter::new(sink, spec.compression, spec.level)?;
        Ok(Self { stage })
    }

    pub fn finish(self) -> Result<W> {
        let sink = self.stage.finish().map_err(lift_io_error)?;
        sink.finish().map_err(lift_io_error)
    }
}

impl<W: Write> Write for FilterWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stage.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stage.flush()
    }
}

/// Decryption stage, or a pass-through.
pub enum Source<R: Read> {
    Plain(R),
    Sealed(DecryptReader<R>),
}

impl<R: Read> Read for Source<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Plain(r) => r.read(buf),
            Source::Sealed(r) => r.read(buf),
        }
    }
}

/// Read side of the pipeline, yielding the inner tar stream.
pub struct FilterReader<R: Read> {
    stage: DecompressReader<Source<R>>,
}

impl<R: Read> FilterReader<R> {
    pub fn new(inner: R, spec: FilterSpec, key: Option<&PassphraseKey>) -> Result<Self> {
        let source = if spec.encrypt {
            let key = key.ok_or_else(|| {
                FloeError::Config("bag is encrypted but no passphrase is configured".into())
            })?;
            Source::Sealed(DecryptReader::new(inner, key)?)
        } else {
            Source::Plain(inner)
        };
        let stage = DecompressReader::new(source, spec.compression)
            .map_err(|e| FloeError::Decompression(e.to_string()))?;
        Ok(Self { stage })
    }
}

impl<R: Read> Read for FilterReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stage.read(buf)
    }
}

/// Recover a [`FloeError`] that travelled through an `io::Error`.
pub fn lift_io_error(e: io::Error) -> FloeError {
    let ours = e
        .get_ref()
        .is_some_and(|inner| inner.is::<FloeError>());
    if !ours {
        return FloeError::Io(e);
    }
    match e.into_inner().map(|inner| inner.downcast::<FloeError>()) {
        Some(Ok(err)) => *err,
        Some(Err(other)) => FloeError::Other(other.to_string()),
        None => FloeError::Other("I/O failure without detail".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CipherKind;
    use zeroize::Zeroizing;

    fn key() -> PassphraseKey {
        PassphraseKey::with_params(
            Zeroizing::new("pw".into()),
            CipherKind::Aes256Gcm,
            key::test_params(),
        )
    }

    #[test]
    fn suffix_matches_parse() {
        let spec = FilterSpec {
            compression: Some(CompressionAlgorithm::Zstd),
            level: None,
            encrypt: true,
        };
        let name = format!("photos/2019{}", spec.entry_suffix());
        assert_eq!(name, "photos/2019.tar.zst.enc");
        let (stem, parsed) = FilterSpec::parse_entry_name(&name).unwrap();
        assert_eq!(stem, "photos/2019");
        assert_eq!(parsed, spec);
        assert!(FilterSpec::parse_entry_name("photos/readme.txt").is_none());
    }

    #[test]
    fn branch_flags_select_stages() {
        let flags = BehaviorFlags {
            compress: true,
            ..Default::default()
        };
        let spec = FilterSpec::for_branch(flags, &CompressionConfig::default());
        assert_eq!(spec.compression, Some(CompressionAlgorithm::Gzip));
        assert!(!spec.encrypt);
        assert!(FilterSpec::for_branch(BehaviorFlags::default(), &CompressionConfig::default())
            .is_plain());
    }

    #[test]
    fn full_pipeline_reverses() {
        let spec = FilterSpec {
            compression: Some(CompressionAlgorithm::Gzip),
            level: Some(9),
            encrypt: true,
        };
        let k = key();
        let data = b"tar bytes ".repeat(5000);
        let mut w = FilterWriter::new(Vec::new(), spec, Some(&k)).unwrap();
        w.write_all(&data).unwrap();
        let sealed = w.finish().unwrap();
        assert!(sealed.len() < data.len());

        let mut r = FilterReader::new(&sealed[..], spec, Some(&k)).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn encryption_without_key_is_config_error() {
        let spec = FilterSpec {
            compression: None,
            level: None,
            encrypt: true,
        };
        assert!(matches!(
            FilterWriter::new(Vec::new(), spec, None),
            Err(FloeError::Config(_))
        ));
    }

    #[test]
    fn lift_recovers_wrapped_error() {
        let wrapped = io::Error::other(FloeError::DecryptionFailed);
        assert!(matches!(lift_io_error(wrapped), FloeError::DecryptionFailed));
        let plain = io::Error::new(io::ErrorKind::NotFound, "x");
        assert!(matches!(lift_io_error(plain), FloeError::Io(_)));
    }
}
