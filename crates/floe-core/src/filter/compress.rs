use std::io::{self, BufReader, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::config::CompressionAlgorithm;

pub const DEFAULT_GZIP_LEVEL: i32 = 6;
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

pub fn default_level(algorithm: CompressionAlgorithm) -> i32 {
    match algorithm {
        CompressionAlgorithm::Gzip => DEFAULT_GZIP_LEVEL,
        CompressionAlgorithm::Zstd => DEFAULT_ZSTD_LEVEL,
    }
}

/// Optional compression stage over any writer.
pub enum CompressWriter<W: Write> {
    Raw(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CompressWriter<W> {
    pub fn new(inner: W, algorithm: Option<CompressionAlgorithm>, level: Option<i32>) -> io::Result<Self> {
        Ok(match algorithm {
            None => CompressWriter::Raw(inner),
            Some(CompressionAlgorithm::Gzip) => {
                let level = level.unwrap_or(DEFAULT_GZIP_LEVEL).clamp(0, 9) as u32;
                CompressWriter::Gzip(GzEncoder::new(inner, flate2::Compression::new(level)))
            }
            Some(CompressionAlgorithm::Zstd) => {
                let level = level.unwrap_or(DEFAULT_ZSTD_LEVEL);
                CompressWriter::Zstd(zstd::stream::write::Encoder::new(inner, level)?)
            }
        })
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressWriter::Raw(mut w) => {
                w.flush()?;
                Ok(w)
            }
            CompressWriter::Gzip(enc) => enc.finish(),
            CompressWriter::Zstd(enc) => enc.finish(),
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressWriter::Raw(w) => w.write(buf),
            CompressWriter::Gzip(w) => w.write(buf),
            CompressWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressWriter::Raw(w) => w.flush(),
            CompressWriter::Gzip(w) => w.flush(),
            CompressWriter::Zstd(w) => w.flush(),
        }
    }
}

/// Reverse of [`CompressWriter`].
pub enum DecompressReader<R: Read> {
    Raw(R),
    Gzip(GzDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> DecompressReader<R> {
    pub fn new(inner: R, algorithm: Option<CompressionAlgorithm>) -> io::Result<Self> {
        Ok(match algorithm {
            None => DecompressReader::Raw(inner),
            Some(CompressionAlgorithm::Gzip) => DecompressReader::Gzip(GzDecoder::new(inner)),
            Some(CompressionAlgorithm::Zstd) => {
                DecompressReader::Zstd(zstd::stream::read::Decoder::new(inner)?)
            }
        })
    }
}

impl<R: Read> Read for DecompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressReader::Raw(r) => r.read(buf),
            DecompressReader::Gzip(r) => r.read(buf),
            DecompressReader::Zstd(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn squeeze(algorithm: Option<CompressionAlgorithm>, data: &[u8]) -> Vec<u8> {
        let mut w = CompressWriter::new(Vec::new(), algorithm, None).unwrap();
        w.write_all(data).unwrap();
        w.finish().unwrap()
    }

    fn expand(algorithm: Option<CompressionAlgorithm>, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut r = DecompressReader::new(data, algorithm)?;
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn repetitive_data_shrinks() {
        let data = b"archive ".repeat(10_000);
        for algo in [CompressionAlgorithm::Gzip, CompressionAlgorithm::Zstd] {
            let packed = squeeze(Some(algo), &data);
            assert!(packed.len() < data.len() / 10, "{algo:?}");
            assert_eq!(expand(Some(algo), &packed).unwrap(), data);
        }
    }

    #[test]
    fn gzip_output_has_gzip_magic() {
        let packed = squeeze(Some(CompressionAlgorithm::Gzip), b"hello");
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn raw_passes_through() {
        assert_eq!(squeeze(None, b"abc"), b"abc");
    }

    #[test]
    fn garbage_fails_to_decompress() {
        assert!(expand(Some(CompressionAlgorithm::Gzip), b"definitely not gzip").is_err());
        assert!(expand(Some(CompressionAlgorithm::Zstd), b"definitely not zstd").is_err());
    }
}
