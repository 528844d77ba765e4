// Background job queue
//
// Request handlers enqueue after their writes have committed. Workers pull
// jobs from one shared channel and run storage work on the blocking pool.
// At most one job per dataset runs at a time.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::core::correction::CorrectionParams;
use crate::core::error::{Result, StoreError};
use crate::core::ingest::Ingestor;

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Ingest {
        dataset_id: Uuid,
        source: String,
        files: Vec<PathBuf>,
    },
    Reingest {
        dataset_id: Uuid,
    },
    CorrectSignal {
        signal_id: Uuid,
        params: CorrectionParams,
    },
    CorrectDataset {
        dataset_id: Uuid,
        params: CorrectionParams,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Ingest { .. } => "ingest",
            Job::Reingest { .. } => "reingest",
            Job::CorrectSignal { .. } => "correct_signal",
            Job::CorrectDataset { .. } => "correct_dataset",
        }
    }

    /// Dataset the job mutates. Signal jobs resolve through the catalog.
    fn dataset_key(&self, ingestor: &Ingestor) -> Result<Uuid> {
        match self {
            Job::Ingest { dataset_id, .. }
            | Job::Reingest { dataset_id }
            | Job::CorrectDataset { dataset_id, .. } => Ok(*dataset_id),
            Job::CorrectSignal { signal_id, .. } => Ok(ingestor
                .storage()
                .database()
                .get_signal(*signal_id)?
                .dataset_id),
        }
    }

    fn run(self, ingestor: &Ingestor) -> Result<()> {
        match self {
            Job::Ingest {
                dataset_id,
                source,
                files,
            } => ingestor.ingest(dataset_id, &source, &files).map(|_| ()),
            Job::Reingest { dataset_id } => ingestor.reingest(dataset_id).map(|_| ()),
            Job::CorrectSignal { signal_id, params } => {
                ingestor.storage().correct(signal_id, &params).map(|_| ())
            }
            Job::CorrectDataset { dataset_id, params } => ingestor
                .storage()
                .correct_dataset(dataset_id, &params)
                .map(|_| ()),
        }
    }
}

/// Set of keys currently being worked on.
#[derive(Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<Uuid>>,
    released: Notify,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no one else holds `key`, then holds it until the guard drops.
    pub async fn acquire(self: &Arc<Self>, key: Uuid) -> KeyGuard {
        loop {
            let released = self.released.notified();
            if self.try_insert(key) {
                return KeyGuard {
                    locks: Arc::clone(self),
                    key,
                };
            }
            debug!("Key {} busy, waiting", key);
            released.await;
        }
    }

    pub fn is_held(&self, key: Uuid) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&key)
    }

    fn try_insert(&self, key: Uuid) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key)
    }

    fn release(&self, key: Uuid) {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key);
        self.released.notify_waiters();
    }
}

pub struct KeyGuard {
    locks: Arc<KeyLocks>,
    key: Uuid,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.locks.release(self.key);
    }
}

pub struct JobQueue {
    sender: mpsc::UnboundedSender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl JobQueue {
    /// Spawns `workers` tasks on the current tokio runtime.
    pub fn start(ingestor: Ingestor, workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let locks = Arc::new(KeyLocks::new());

        let handles = (0..workers.max(1))
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let locks = Arc::clone(&locks);
                let ingestor = ingestor.clone();
                tokio::spawn(async move { worker_loop(id, receiver, locks, ingestor).await })
            })
            .collect();
        info!("Started {} workers", workers.max(1));

        Self {
            sender,
            workers: handles,
        }
    }

    pub fn enqueue(&self, job: Job) -> Result<()> {
        debug!("Enqueue {} job", job.name());
        self.sender
            .send(job)
            .map_err(|e| StoreError::QueueClosed(e.0.name().to_string()))
    }

    /// Stops accepting jobs, lets the workers drain the queue and waits
    /// for them.
    pub async fn shutdown(self) {
        drop(self.sender);
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("Worker ended abnormally: {}", e);
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    locks: Arc<KeyLocks>,
    ingestor: Ingestor,
) {
    loop {
        let job = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            debug!("Worker {} stopping", id);
            break;
        };
        let name = job.name();

        let key = {
            let ingestor = ingestor.clone();
            let job = job.clone();
            tokio::task::spawn_blocking(move || job.dataset_key(&ingestor)).await
        };
        let key = match key {
            Ok(Ok(key)) => key,
            Ok(Err(e)) => {
                error!("Worker {}: {} job rejected: {}", id, name, e);
                continue;
            }
            Err(e) => {
                error!("Worker {}: {} job panicked: {}", id, name, e);
                continue;
            }
        };

        let guard = locks.acquire(key).await;
        debug!("Worker {} running {} for dataset {}", id, name, key);
        let ingestor = ingestor.clone();
        let outcome = tokio::task::spawn_blocking(move || job.run(&ingestor)).await;
        drop(guard);

        match outcome {
            Ok(Ok(())) => info!("Worker {}: {} job for dataset {} done", id, name, key),
            Ok(Err(e)) => error!("Worker {}: {} job for dataset {} failed: {}", id, name, key, e),
            Err(e) => error!("Worker {}: {} job for dataset {} panicked: {}", id, name, key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StoreConfig;
    use crate::core::format::to_datetime;
    use crate::core::ingest::SourceRegistry;
    use crate::core::status::IngestionStatus;
    use crate::core::tier::Storage;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn ingestor(dir: &TempDir) -> Ingestor {
        let config = StoreConfig {
            data_root: dir.path().join("chunks"),
            database_path: dir.path().join("catalog.sqlite3"),
            chunk_span_secs: 60,
            ..StoreConfig::default()
        };
        let storage = Arc::new(Storage::open(&config).unwrap());
        Ingestor::new(storage, Arc::new(SourceRegistry::with_builtin()))
    }

    #[tokio::test]
    async fn test_key_locks_exclude() {
        let locks = Arc::new(KeyLocks::new());
        let key = Uuid::new_v4();
        let guard = locks.acquire(key).await;
        // other keys are free
        drop(locks.acquire(Uuid::new_v4()).await);

        let entered = Arc::new(AtomicBool::new(false));
        let waiter = {
            let locks = Arc::clone(&locks);
            let entered = Arc::clone(&entered);
            tokio::spawn(async move {
                let _guard = locks.acquire(key).await;
                entered.store(true, Ordering::SeqCst);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!entered.load(Ordering::SeqCst));

        drop(guard);
        waiter.await.unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(!locks.is_held(key));
    }

    #[tokio::test]
    async fn test_queue_ingests_then_corrects() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);
        let csv = dir.path().join("a.csv");
        std::fs::write(&csv, "t,hr\n0,60\n1,61\n2,62\n").unwrap();
        let db = ingestor.storage().database().clone();
        let dataset = db.create_upload("a", "csv", &[csv.clone()]).unwrap();

        // one worker keeps the two jobs in order
        let queue = JobQueue::start(ingestor.clone(), 1);
        queue
            .enqueue(Job::Ingest {
                dataset_id: dataset.id,
                source: "csv".into(),
                files: vec![csv],
            })
            .unwrap();
        queue
            .enqueue(Job::CorrectDataset {
                dataset_id: dataset.id,
                params: CorrectionParams {
                    timeshift: 10.0,
                    stretch_factor: 1.0,
                    reference_time: to_datetime(0),
                },
            })
            .unwrap();
        queue.shutdown().await;

        assert_eq!(db.get_dataset(dataset.id).unwrap().status, IngestionStatus::Processed);
        let signals = db.list_signals(dataset.id).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].first_micros(), Some(10_000_000));
        assert_eq!(signals[0].last_micros(), Some(12_000_000));
    }

    #[tokio::test]
    async fn test_failed_job_does_not_stop_workers() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);
        let db = ingestor.storage().database().clone();
        let broken = db.create_upload("broken", "csv", &[]).unwrap();
        let missing_signal = Uuid::new_v4();

        let queue = JobQueue::start(ingestor, 2);
        queue
            .enqueue(Job::CorrectSignal {
                signal_id: missing_signal,
                params: CorrectionParams::default(),
            })
            .unwrap();
        queue
            .enqueue(Job::Ingest {
                dataset_id: broken.id,
                source: "csv".into(),
                files: Vec::new(),
            })
            .unwrap();
        queue.shutdown().await;

        assert_eq!(db.get_dataset(broken.id).unwrap().status, IngestionStatus::Error);
    }
}
