//! Every call against the object service goes through here: uploads, deletes
//! and thaw requests are retried, throttled by the store wrapper, recorded in
//! the ledger and suppressed entirely in dry-run mode.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use floe_storage::{
    retry_with_backoff, ObjectHead, ObjectInfo, ObjectStore, RestoreRequest, RestoreTier,
    RetryConfig, StorageClass,
};
use floe_types::{BagId, FloeError, Result};

use crate::ledger::{Ledger, LedgerAction};

/// A built bag waiting for upload.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub bag: BagId,
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
    pub class: StorageClass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub bag: BagId,
    pub key: String,
    pub size: u64,
    /// `None` in dry-run mode.
    pub etag: Option<String>,
}

pub struct TransferCoordinator {
    store: Arc<dyn ObjectStore>,
    retry: RetryConfig,
    ledger: Arc<Ledger>,
    concurrency: usize,
    min_retention: Duration,
    in_flight: Mutex<HashSet<BagId>>,
    shutdown: Option<Arc<AtomicBool>>,
}

/// Releases an in-flight claim on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<BagId>>,
    bag: BagId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.bag);
    }
}

impl TransferCoordinator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        retry: RetryConfig,
        ledger: Arc<Ledger>,
        concurrency: usize,
        min_retention_days: u32,
    ) -> Self {
        Self {
            store,
            retry,
            ledger,
            concurrency: concurrency.max(1),
            min_retention: Duration::days(i64::from(min_retention_days)),
            in_flight: Mutex::new(HashSet::new()),
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, flag: Option<Arc<AtomicBool>>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.ledger.is_dry_run()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn min_retention(&self) -> Duration {
        self.min_retention
    }

    pub fn check_interrupted(&self) -> Result<()> {
        if self
            .shutdown
            .as_ref()
            .is_some_and(|f| f.load(Ordering::Relaxed))
        {
            return Err(FloeError::Interrupted);
        }
        Ok(())
    }

    fn claim(&self, bag: BagId) -> Result<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(bag) {
            return Err(FloeError::Consistency(format!(
                "{bag} is already being uploaded"
            )));
        }
        Ok(InFlight {
            set: &self.in_flight,
            bag,
        })
    }

    /// Upload one bag file. The file is reopened on every retry attempt.
    pub fn upload_bag(&self, job: &UploadJob) -> Result<UploadOutcome> {
        let _claim = self.claim(job.bag)?;
        self.check_interrupted()?;

        if self.is_dry_run() {
            self.ledger.record(
                LedgerAction::Upload,
                &job.key,
                job.size,
                None,
                Some(format!("{} as {}", job.bag, job.class)),
            );
            return Ok(UploadOutcome {
                bag: job.bag,
                key: job.key.clone(),
                size: job.size,
                etag: None,
            });
        }

        let op = format!("PUT {}", job.key);
        let etag = retry_with_backoff(&self.retry, &op, || {
            let mut reader = BufReader::new(File::open(&job.path)?);
            self.store
                .put_reader(&job.key, &mut reader, job.size, &job.class)
        })?;
        self.ledger.record(
            LedgerAction::Upload,
            &job.key,
            job.size,
            Some(&etag),
            Some(format!("{} as {}", job.bag, job.class)),
        );
        Ok(UploadOutcome {
            bag: job.bag,
            key: job.key.clone(),
            size: job.size,
            etag: Some(etag),
        })
    }

    /// Upload independent bags on a worker pool. Results come back in job
    /// order; the first failure is returned once in-flight uploads settle.
    pub fn upload_all(&self, jobs: &[UploadJob]) -> Result<Vec<UploadOutcome>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let workers = self.concurrency.min(jobs.len());
        if workers == 1 {
            return jobs.iter().map(|job| self.upload_bag(job)).collect();
        }

        let mut slots: Vec<Option<Result<UploadOutcome>>> = Vec::with_capacity(jobs.len());
        slots.resize_with(jobs.len(), || None);
        let failed = AtomicBool::new(false);

        std::thread::scope(|s| {
            let (work_tx, work_rx) = crossbeam_channel::bounded::<usize>(jobs.len());
            let (result_tx, result_rx) =
                crossbeam_channel::bounded::<(usize, Result<UploadOutcome>)>(jobs.len());

            for idx in 0..jobs.len() {
                // Capacity equals job count.
                let _ = work_tx.send(idx);
            }
            drop(work_tx);

            let failed_ref = &failed;
            for _ in 0..workers {
                let rx = work_rx.clone();
                let tx = result_tx.clone();
                s.spawn(move || {
                    for idx in rx {
                        let result = if failed_ref.load(Ordering::Relaxed) {
                            Err(FloeError::Other(SKIPPED.into()))
                        } else {
                            self.upload_bag(&jobs[idx])
                        };
                        if result.is_err() {
                            failed_ref.store(true, Ordering::Relaxed);
                        }
                        if tx.send((idx, result)).is_err() {
                            return;
                        }
                    }
                });
            }
            drop(work_rx);
            drop(result_tx);

            for (idx, result) in &result_rx {
                slots[idx] = Some(result);
            }
        });

        let mut outcomes = Vec::with_capacity(jobs.len());
        let mut errors = Vec::new();
        for slot in slots {
            match slot {
                Some(Ok(outcome)) => outcomes.push(outcome),
                Some(Err(e)) => errors.push(e),
                None => errors.push(FloeError::Other("upload worker exited early".into())),
            }
        }
        if errors.is_empty() {
            return Ok(outcomes);
        }
        // Report the real cause, not a skip placeholder.
        let pos = errors.iter().position(|e| !is_skip(e)).unwrap_or(0);
        Err(errors.swap_remove(pos))
    }

    /// Small object in an immediately readable class: manifests and system
    /// artifacts.
    pub fn put_small(&self, key: &str, data: &[u8], class: &StorageClass) -> Result<Option<String>> {
        if self.is_dry_run() {
            self.ledger
                .record(LedgerAction::Upload, key, data.len() as u64, None, None);
            return Ok(None);
        }
        let op = format!("PUT {key}");
        let etag = retry_with_backoff(&self.retry, &op, || self.store.put_bytes(key, data, class))?;
        self.ledger
            .record(LedgerAction::Upload, key, data.len() as u64, Some(&etag), None);
        Ok(Some(etag))
    }

    /// Time left before `uploaded_at` clears the minimum retention period.
    pub fn retention_remaining(&self, uploaded_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
        let clears = uploaded_at + self.min_retention;
        (clears > now).then(|| clears - now)
    }

    /// Delete a bag. Bags younger than the minimum retention are refused
    /// before any call unless `allow_early` is set.
    pub fn delete_bag(
        &self,
        key: &str,
        bytes: u64,
        uploaded_at: DateTime<Utc>,
        now: DateTime<Utc>,
        allow_early: bool,
    ) -> Result<()> {
        if let Some(left) = self.retention_remaining(uploaded_at, now) {
            if !allow_early {
                return Err(FloeError::PolicyViolation(format!(
                    "{key} is younger than the minimum retention ({} days left)",
                    left.num_days() + 1
                )));
            }
            info!("deleting {key} {} days early", left.num_days() + 1);
        }
        self.delete_object(key, bytes)
    }

    /// Delete an object that carries no retention commitment.
    pub fn delete_object(&self, key: &str, bytes: u64) -> Result<()> {
        self.check_interrupted()?;
        if !self.is_dry_run() {
            let op = format!("DELETE {key}");
            retry_with_backoff(&self.retry, &op, || self.store.delete(key))?;
        }
        self.ledger.record(LedgerAction::Delete, key, bytes, None, None);
        Ok(())
    }

    /// Note an object the run deliberately left in place.
    pub fn keep(&self, key: &str, bytes: u64, reason: &str) {
        self.ledger
            .record(LedgerAction::Keep, key, bytes, None, Some(reason.to_string()));
    }

    pub fn skip_young(&self, key: &str, bytes: u64, days_left: i64) {
        self.ledger.record(
            LedgerAction::SkipYoung,
            key,
            bytes,
            None,
            Some(format!("{days_left} days of retention left")),
        );
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let op = format!("LIST {prefix}");
        retry_with_backoff(&self.retry, &op, || self.store.list(prefix))
    }

    pub fn head(&self, key: &str) -> Result<Option<ObjectHead>> {
        let op = format!("HEAD {key}");
        retry_with_backoff(&self.retry, &op, || self.store.head(key))
    }

    pub fn get_small(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let op = format!("GET {key}");
        retry_with_backoff(&self.retry, &op, || self.store.get(key))
    }

    pub fn request_thaw(&self, key: &str, days: u32, tier: RestoreTier) -> Result<RestoreRequest> {
        if self.is_dry_run() {
            self.ledger.record(
                LedgerAction::ThawRequest,
                key,
                0,
                None,
                Some(format!("{tier} for {days} days")),
            );
            return Ok(RestoreRequest::Accepted);
        }
        let op = format!("RESTORE {key}");
        let outcome = retry_with_backoff(&self.retry, &op, || self.store.request_restore(key, days, tier))?;
        self.ledger.record(
            LedgerAction::ThawRequest,
            key,
            0,
            None,
            Some(format!("{tier} for {days} days: {outcome:?}")),
        );
        Ok(outcome)
    }

    /// Stream an object into `dest`, replacing any partial earlier download.
    pub fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        self.check_interrupted()?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let op = format!("GET {key}");
        let bytes = retry_with_backoff(&self.retry, &op, || {
            let mut file = std::io::BufWriter::new(File::create(dest)?);
            let n = self.store.get_to_writer(key, &mut file)?;
            std::io::Write::flush(&mut file)?;
            Ok(n)
        })?;
        debug!("downloaded {key} -> {} ({bytes} bytes)", dest.display());
        self.ledger
            .record(LedgerAction::Download, key, bytes, None, None);
        Ok(bytes)
    }
}

const SKIPPED: &str = "skipped after an earlier failure";

fn is_skip(err: &FloeError) -> bool {
    matches!(err, FloeError::Other(m) if m == SKIPPED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryStore;
    use floe_types::RunId;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    fn coordinator(store: Arc<MemoryStore>, dry_run: bool, workers: usize) -> TransferCoordinator {
        let ledger = Arc::new(Ledger::ephemeral(RunId([0, 0, 0, 1]), dry_run));
        TransferCoordinator::new(store, fast_retry(), ledger, workers, 180)
    }

    fn job(dir: &Path, id: u32, body: &[u8]) -> UploadJob {
        let path = dir.join(format!("bag{id}.tar"));
        std::fs::write(&path, body).unwrap();
        UploadJob {
            bag: BagId(id),
            key: format!("p/h_b_bag_{id:05}_00000001.tar"),
            path,
            size: body.len() as u64,
            class: StorageClass::DeepArchive,
        }
    }

    #[test]
    fn upload_retries_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.fail_next_puts(2);
        let tc = coordinator(store.clone(), false, 1);
        let out = tc.upload_bag(&job(dir.path(), 1, b"abc")).unwrap();
        assert!(out.etag.is_some());
        assert_eq!(store.object("p/h_b_bag_00001_00000001.tar").unwrap(), b"abc");
        assert_eq!(store.calls().puts, 3);
    }

    #[test]
    fn parallel_upload_keeps_job_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let tc = coordinator(store.clone(), false, 4);
        let jobs: Vec<_> = (1..=6).map(|i| job(dir.path(), i, &[i as u8; 10])).collect();
        let out = tc.upload_all(&jobs).unwrap();
        let ids: Vec<_> = out.iter().map(|o| o.bag.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(store.len(), 6);
        assert_eq!(tc.ledger().count(LedgerAction::Upload), 6);
    }

    #[test]
    fn dry_run_makes_no_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let tc = coordinator(store.clone(), true, 2);
        let jobs = vec![job(dir.path(), 1, b"x"), job(dir.path(), 2, b"y")];
        let out = tc.upload_all(&jobs).unwrap();
        assert!(out.iter().all(|o| o.etag.is_none()));
        let old = Utc::now() - Duration::days(400);
        tc.delete_bag("p/x.tar", 1, old, Utc::now(), false).unwrap();
        tc.put_small("p/manifests/x.txt", b"m", &StorageClass::Standard)
            .unwrap();
        assert_eq!(store.calls().total(), 0);
        assert_eq!(tc.ledger().entries().len(), 4);
    }

    #[test]
    fn young_bag_delete_is_refused_before_any_call() {
        let store = Arc::new(MemoryStore::new());
        let tc = coordinator(store.clone(), false, 1);
        let now = Utc::now();
        let err = tc
            .delete_bag("p/y.tar", 1, now - Duration::days(10), now, false)
            .unwrap_err();
        assert!(matches!(err, FloeError::PolicyViolation(_)));
        assert_eq!(store.calls().total(), 0);

        tc.delete_bag("p/y.tar", 1, now - Duration::days(10), now, true)
            .unwrap();
        assert_eq!(store.calls().deletes, 1);
    }

    #[test]
    fn poisoned_claim_set_still_admits_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let tc = coordinator(store.clone(), false, 1);
        std::thread::scope(|s| {
            let worker = s.spawn(|| {
                let _held = tc.in_flight.lock().unwrap();
                panic!("worker died holding the claim set");
            });
            assert!(worker.join().is_err());
        });
        assert!(tc.in_flight.is_poisoned());

        tc.upload_bag(&job(dir.path(), 7, b"after")).unwrap();
        assert_eq!(store.len(), 1);
        let set = tc.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        assert!(set.is_empty());
    }

    #[test]
    fn shutdown_flag_interrupts_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let flag = Arc::new(AtomicBool::new(true));
        let tc = coordinator(store.clone(), false, 1).with_shutdown(Some(flag));
        let err = tc.upload_bag(&job(dir.path(), 1, b"a")).unwrap_err();
        assert!(matches!(err, FloeError::Interrupted));
        assert_eq!(store.calls().total(), 0);
    }

    #[test]
    fn permanent_failure_fails_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.fail_next_puts(100);
        let tc = coordinator(store, false, 2);
        let jobs = vec![job(dir.path(), 1, b"x"), job(dir.path(), 2, b"y")];
        let err = tc.upload_all(&jobs).unwrap_err();
        assert!(err.to_string().contains("giving up"), "{err}");
    }
}
