//! The verifier thread pool.
//!
//! A fixed set of workers, each owning its thread-local [`ProofBatch`].
//! Asynchronous tasks round-robin across workers (or target one worker
//! explicitly, which is how per-block verification hands worker `i` the
//! `i`-th slice); [`Executor::exec_all`] runs a closure once on every
//! worker; [`Executor::flush`] blocks until the in-flight count drops to
//! the requested bound.

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use veil_core::proofs::ProofBatch;

/// What a task sees: its worker index and the worker's batch accumulator.
pub struct VerifierCtx<'a> {
    pub thread_index: u32,
    pub batch: &'a mut ProofBatch,
}

type Task = Box<dyn FnOnce(&mut VerifierCtx) + Send>;

struct ExecShared {
    pending: Mutex<u32>,
    cv: Condvar,
}

impl ExecShared {
    fn task_started(&self) {
        *self.pending.lock() += 1;
    }

    fn task_done(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        self.cv.notify_all();
    }
}

/// Decrements the pending counter even if the task panics, so `flush`
/// never hangs on a poisoned worker.
struct DoneGuard<'a>(&'a ExecShared);

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.0.task_done();
    }
}

pub struct Executor {
    senders: Vec<Sender<Task>>,
    shared: Arc<ExecShared>,
    next: AtomicUsize,
    handles: Vec<JoinHandle<()>>,
}

impl Executor {
    pub fn new(threads: u32) -> Self {
        let threads = threads.max(1);
        let shared = Arc::new(ExecShared { pending: Mutex::new(0), cv: Condvar::new() });

        let mut senders = Vec::with_capacity(threads as usize);
        let mut handles = Vec::with_capacity(threads as usize);
        for thread_index in 0..threads {
            let (tx, rx) = unbounded::<Task>();
            senders.push(tx);
            let shared = Arc::clone(&shared);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("veil-verify-{thread_index}"))
                    .spawn(move || {
                        let mut batch = ProofBatch::new();
                        for task in rx.iter() {
                            let _guard = DoneGuard(&shared);
                            let mut ctx = VerifierCtx { thread_index, batch: &mut batch };
                            task(&mut ctx);
                        }
                    })
                    .expect("spawn verifier thread"),
            );
        }

        Self { senders, shared, next: AtomicUsize::new(0), handles }
    }

    /// One worker per available core, leaving one for the processor thread.
    pub fn with_default_threads() -> Self {
        let n = std::thread::available_parallelism()
            .map(|p| p.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1);
        Self::new(n as u32)
    }

    pub fn threads(&self) -> u32 {
        self.senders.len() as u32
    }

    /// Queue a task on the least recently used worker.
    pub fn push(&self, task: impl FnOnce(&mut VerifierCtx) + Send + 'static) {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.push_to(i as u32, task);
    }

    /// Queue a task on a specific worker.
    pub fn push_to(&self, thread_index: u32, task: impl FnOnce(&mut VerifierCtx) + Send + 'static) {
        self.shared.task_started();
        self.senders[thread_index as usize]
            .send(Box::new(task))
            .expect("worker alive");
    }

    /// Run `f` once on every worker and wait for all of them.
    pub fn exec_all(&self, f: impl Fn(&mut VerifierCtx) + Send + Sync + 'static) {
        let f = Arc::new(f);
        for i in 0..self.threads() {
            let f = Arc::clone(&f);
            self.push_to(i, move |ctx| f(ctx));
        }
        self.flush(0);
    }

    /// Block until at most `max_in_flight` tasks remain; returns the count.
    pub fn flush(&self, max_in_flight: u32) -> u32 {
        let mut pending = self.shared.pending.lock();
        while *pending > max_in_flight {
            self.shared.cv.wait(&mut pending);
        }
        *pending
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.flush(0);
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// The `index`-th of `total` contiguous portions of `count` items.
pub fn get_portion(index: u32, total: u32, count: usize) -> Range<usize> {
    let total = total.max(1) as usize;
    let index = index as usize;
    let base = count / total;
    let extra = count % total;
    // The first `extra` portions take one more item.
    let start = index * base + index.min(extra);
    let len = base + usize::from(index < extra);
    start..(start + len).min(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn runs_pushed_tasks() {
        let ex = Executor::new(3);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            ex.push(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(ex.flush(0), 0);
        assert_eq!(counter.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn exec_all_reaches_every_worker() {
        let ex = Executor::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        ex.exec_all(move |ctx| {
            seen2.lock().push(ctx.thread_index);
        });
        let mut indices = seen.lock().clone();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn push_to_targets_worker() {
        let ex = Executor::new(3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..5 {
            let seen = Arc::clone(&seen);
            ex.push_to(1, move |ctx| seen.lock().push(ctx.thread_index));
        }
        ex.flush(0);
        assert_eq!(*seen.lock(), vec![1; 5]);
    }

    #[test]
    fn flush_with_bound_returns_at_or_below() {
        let ex = Executor::new(2);
        let remaining = ex.flush(5);
        assert!(remaining <= 5);
    }

    #[test]
    fn panicking_task_does_not_hang_flush() {
        let ex = Executor::new(1);
        ex.push(|_| panic!("boom"));
        // The guard still releases the pending count; the worker dies but
        // flush must return.
        assert_eq!(ex.flush(0), 0);
    }

    #[test]
    fn zero_threads_clamped_to_one() {
        let ex = Executor::new(0);
        assert_eq!(ex.threads(), 1);
    }

    // --- get_portion ---

    #[test]
    fn portions_cover_exactly() {
        for count in [0usize, 1, 5, 16, 17] {
            for total in [1u32, 2, 3, 8] {
                let mut covered = Vec::new();
                for i in 0..total {
                    covered.extend(get_portion(i, total, count));
                }
                let expected: Vec<usize> = (0..count).collect();
                assert_eq!(covered, expected, "count={count} total={total}");
            }
        }
    }

    #[test]
    fn portion_sizes_balanced() {
        let sizes: Vec<usize> = (0..4).map(|i| get_portion(i, 4, 10).len()).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2]);
    }
}
