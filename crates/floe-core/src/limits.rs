use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use floe_storage::{
    ObjectHead, ObjectInfo, ObjectStore, RestoreRequest, RestoreTier, StorageClass,
};
use floe_types::Result;

use crate::config::LimitsConfig;

const BYTES_PER_MIB: u64 = 1024 * 1024;

fn mib_per_sec_to_bytes_per_sec(mib_per_sec: u64) -> u64 {
    mib_per_sec.saturating_mul(BYTES_PER_MIB)
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every transfer in the process. The bucket holds
/// at most one second of budget, so bursts stay short.
#[derive(Debug)]
pub struct ByteRateLimiter {
    bytes_per_sec: u64,
    state: Mutex<BucketState>,
}

impl ByteRateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            state: Mutex::new(BucketState {
                tokens: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_mib_per_sec(mib_per_sec: u64) -> Option<Arc<Self>> {
        if mib_per_sec == 0 {
            None
        } else {
            Some(Arc::new(Self::new(mib_per_sec_to_bytes_per_sec(
                mib_per_sec,
            ))))
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Take `bytes` from the bucket, sleeping until they are available.
    pub fn consume(&self, bytes: usize) {
        if bytes == 0 || self.bytes_per_sec == 0 {
            return;
        }
        let rate = self.bytes_per_sec as f64;
        let wait = {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * rate).min(rate);
            state.last_refill = now;
            state.tokens -= bytes as f64;
            if state.tokens < 0.0 {
                Duration::from_secs_f64(-state.tokens / rate)
            } else {
                Duration::ZERO
            }
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

pub struct ThrottledReader<'a> {
    inner: &'a mut dyn Read,
    limiter: &'a ByteRateLimiter,
}

impl Read for ThrottledReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.limiter.consume(n);
        Ok(n)
    }
}

pub struct ThrottledWriter<'a> {
    inner: &'a mut dyn Write,
    limiter: &'a ByteRateLimiter,
}

impl Write for ThrottledWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.limiter.consume(buf.len());
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Apply the configured ceilings to a store. Returns the store unchanged when
/// both are unlimited.
pub fn wrap_store(inner: Arc<dyn ObjectStore>, limits: &LimitsConfig) -> Arc<dyn ObjectStore> {
    let upload = ByteRateLimiter::from_mib_per_sec(limits.upload_mib_per_sec);
    let download = ByteRateLimiter::from_mib_per_sec(limits.download_mib_per_sec);
    if upload.is_none() && download.is_none() {
        return inner;
    }
    Arc::new(ThrottledStore {
        inner,
        upload,
        download,
    })
}

struct ThrottledStore {
    inner: Arc<dyn ObjectStore>,
    upload: Option<Arc<ByteRateLimiter>>,
    download: Option<Arc<ByteRateLimiter>>,
}

impl ObjectStore for ThrottledStore {
    fn put_bytes(&self, key: &str, data: &[u8], class: &StorageClass) -> Result<String> {
        if let Some(limiter) = self.upload.as_ref() {
            limiter.consume(data.len());
        }
        self.inner.put_bytes(key, data, class)
    }

    fn put_reader(
        &self,
        key: &str,
        reader: &mut dyn Read,
        len: u64,
        class: &StorageClass,
    ) -> Result<String> {
        match self.upload.as_deref() {
            Some(limiter) => {
                let mut throttled = ThrottledReader {
                    inner: reader,
                    limiter,
                };
                self.inner.put_reader(key, &mut throttled, len, class)
            }
            None => self.inner.put_reader(key, reader, len, class),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let out = self.inner.get(key)?;
        if let (Some(limiter), Some(data)) = (self.download.as_ref(), out.as_ref()) {
            limiter.consume(data.len());
        }
        Ok(out)
    }

    fn get_to_writer(&self, key: &str, writer: &mut dyn Write) -> Result<u64> {
        match self.download.as_deref() {
            Some(limiter) => {
                let mut throttled = ThrottledWriter {
                    inner: writer,
                    limiter,
                };
                self.inner.get_to_writer(key, &mut throttled)
            }
            None => self.inner.get_to_writer(key, writer),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list(prefix)
    }

    fn head(&self, key: &str) -> Result<Option<ObjectHead>> {
        self.inner.head(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn request_restore(&self, key: &str, days: u32, tier: RestoreTier) -> Result<RestoreRequest> {
        self.inner.request_restore(key, days, tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_is_none() {
        assert!(ByteRateLimiter::from_mib_per_sec(0).is_none());
        assert_eq!(
            ByteRateLimiter::from_mib_per_sec(2).unwrap().bytes_per_sec(),
            2 * BYTES_PER_MIB
        );
    }

    #[test]
    fn bucket_paces_after_burst() {
        let limiter = ByteRateLimiter::new(10_000);
        let start = Instant::now();
        // First second of budget is free, the next 5_000 bytes cost ~0.5s.
        limiter.consume(10_000);
        limiter.consume(5_000);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    }

    #[test]
    fn throttled_reader_passes_bytes() {
        let limiter = ByteRateLimiter::new(u64::MAX / 2);
        let mut src: &[u8] = b"payload";
        let mut r = ThrottledReader {
            inner: &mut src,
            limiter: &limiter,
        };
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"payload");
    }
}
