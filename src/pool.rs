//! Bounded worker pool for per-service jobs.
//!
//! A pool of N OS threads executes queued jobs with rendezvous hand-off: the
//! queue has depth zero, so enqueueing blocks while every worker is busy.
//! N = 0 is a deliberate design switch that runs each job inline on the
//! caller's thread, forcing strict submission order for deterministic serial
//! runs. The pool keeps only the first error; jobs already queued still run,
//! but new submissions fail fast once an error is recorded.

use std::sync::mpsc::SyncSender;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, Result};

/// A queued unit of work. Never inspected until executed.
pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

pub struct WorkerPool {
    workers: usize,
    started: bool,
    tx: Option<SyncSender<Job>>,
    handles: Vec<JoinHandle<()>>,
    first_err: Arc<Mutex<Option<anyhow::Error>>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            started: false,
            tx: None,
            handles: Vec::new(),
            first_err: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawns the workers. Must be called before `enqueue`.
    pub fn start(&mut self) {
        self.started = true;
        if self.workers == 0 {
            return;
        }
        let (tx, rx) = mpsc::sync_channel::<Job>(0);
        let rx = Arc::new(Mutex::new(rx));
        self.tx = Some(tx);
        for _ in 0..self.workers {
            let rx = rx.clone();
            let first_err = self.first_err.clone();
            self.handles.push(std::thread::spawn(move || loop {
                let job = {
                    let guard = rx.lock().unwrap();
                    guard.recv()
                };
                match job {
                    Ok(job) => record_err(&first_err, job()),
                    Err(_) => break,
                }
            }));
        }
    }

    /// Submits one job. With zero workers the job runs immediately on the
    /// calling thread; otherwise this blocks until a worker takes it.
    pub fn enqueue(&self, job: Job) -> Result<()> {
        if self.first_err.lock().unwrap().is_some() {
            bail!("job rejected: an earlier job already failed");
        }
        if self.workers == 0 {
            record_err(&self.first_err, job());
            return Ok(());
        }
        let Some(tx) = &self.tx else {
            if self.started {
                bail!("worker pool is stopped");
            }
            bail!("worker pool is not started");
        };
        if tx.send(job).is_err() {
            bail!("worker pool is stopped");
        }
        Ok(())
    }

    /// Closes the queue; workers exit after draining it.
    pub fn stop(&mut self) {
        self.tx = None;
    }

    /// Blocks until every worker has finished. Call after `stop`.
    pub fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// The first error recorded across all jobs, if any.
    pub fn take_err(&self) -> Option<anyhow::Error> {
        self.first_err.lock().unwrap().take()
    }
}

fn record_err(first_err: &Arc<Mutex<Option<anyhow::Error>>>, result: Result<()>) {
    if let Err(err) = result {
        let mut slot = first_err.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn zero_workers_runs_inline_in_submission_order() {
        let mut pool = WorkerPool::new(0);
        pool.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..5 {
            let seen = order.clone();
            pool.enqueue(Box::new(move || {
                seen.lock().unwrap().push(n);
                Ok(())
            }))
            .unwrap();
            // Inline mode: the job has already run by the time enqueue
            // returns.
            assert_eq!(order.lock().unwrap().len(), n + 1);
        }
        pool.stop();
        pool.wait();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(pool.take_err().is_none());
    }

    #[test]
    fn all_jobs_complete_with_workers() {
        let mut pool = WorkerPool::new(3);
        pool.start();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = counter.clone();
            pool.enqueue(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }
        pool.stop();
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn first_error_wins_and_later_enqueues_fail_fast() {
        let mut pool = WorkerPool::new(1);
        pool.start();
        pool.enqueue(Box::new(|| Err(anyhow!("first failure"))))
            .unwrap();
        // Single worker and a rendezvous queue: once this second submission
        // is accepted the first job has been taken, and its error lands
        // before the second job finishes.
        pool.enqueue(Box::new(|| {
            std::thread::sleep(Duration::from_millis(50));
            Err(anyhow!("second failure"))
        }))
        .ok();

        pool.stop();
        pool.wait();

        let err = pool.take_err().unwrap();
        assert_eq!(err.to_string(), "first failure");

        let mut pool = WorkerPool::new(0);
        pool.start();
        pool.enqueue(Box::new(|| Err(anyhow!("boom")))).unwrap();
        let rejected = pool.enqueue(Box::new(|| Ok(()))).unwrap_err();
        assert!(rejected.to_string().contains("rejected"));
    }

    #[test]
    fn enqueue_before_start_fails() {
        let pool = WorkerPool::new(2);
        let err = pool.enqueue(Box::new(|| Ok(()))).unwrap_err();
        assert!(err.to_string().contains("not started"));
    }

    #[test]
    fn enqueue_after_stop_reports_stopped() {
        let mut pool = WorkerPool::new(1);
        pool.start();
        pool.stop();
        pool.wait();
        let err = pool.enqueue(Box::new(|| Ok(()))).unwrap_err();
        assert!(err.to_string().contains("stopped"));
    }
}
