// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::TrySendError;
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A cached worker pool: submitting grows the pool when no worker is
/// parked, and workers that sit idle past the keep-alive get recycled.
/// Workers never block process exit.
///
/// Handoff happens over a zero-capacity rendezvous channel, so a
/// submitted job is either taken by a worker that is already parked
/// in recv, or it rides along to a freshly spawned worker. Jobs never
/// queue, which means one job can never starve behind another no
/// matter how the submits and parks interleave.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    jobs_tx: crossbeam_channel::Sender<Job>,
    jobs_rx: crossbeam_channel::Receiver<Job>,
    live: AtomicUsize,
    keep_alive: Duration,
}

impl Pool {
    pub fn new(keep_alive: Duration) -> Pool {
        let (jobs_tx, jobs_rx) = crossbeam_channel::bounded(0);
        Pool {
            inner: Arc::new(PoolInner {
                jobs_tx,
                jobs_rx,
                live: AtomicUsize::new(0),
                keep_alive,
            }),
        }
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // try_send on a rendezvous channel only succeeds when a worker
        // is blocked in recv right now
        match self.inner.jobs_tx.try_send(Box::new(job)) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                self.spawn_worker(job);
            }
        }
    }

    fn spawn_worker(&self, first_job: Job) {
        let inner = Arc::clone(&self.inner);
        inner.live.fetch_add(1, Ordering::AcqRel);
        thread::spawn(move || {
            let mut job = first_job;
            loop {
                job();
                match inner.jobs_rx.recv_timeout(inner.keep_alive) {
                    Ok(next) => job = next,
                    Err(_) => {
                        // parked past the keep-alive, recycle this
                        // worker
                        trace!("recycling idle worker");
                        break;
                    }
                }
            }
            inner.live.fetch_sub(1, Ordering::AcqRel);
        });
    }

    #[cfg(test)]
    fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }
}

/// A write-once slot a waiter can block on with an optional deadline.
/// The first fill wins; later fills are dropped.
pub struct Completion<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Completion<T> {
        Completion { slot: Mutex::new(None), cond: Condvar::new() }
    }

    /// Fill the slot and wake all waiters. Drops the value if the slot
    /// was already filled.
    pub fn fill(&self, value: T) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(value);
            self.cond.notify_all();
        }
    }

    /// Wait for the slot to fill, with an optional timeout. Returns
    /// `None` if the timeout expires first.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<T> {
        let slot = self.slot.lock().unwrap();

        // a waiter arriving after the fill returns immediately
        if slot.is_some() {
            return slot.clone();
        }

        match timeout {
            Some(t) => {
                // unwrap to propagate lock poisoning as an unwind
                let (slot, wait_res) =
                    self.cond.wait_timeout_while(slot, t, |slot| slot.is_none()).unwrap();
                if wait_res.timed_out() {
                    None
                } else {
                    slot.clone()
                }
            }
            None => self.cond.wait_while(slot, |slot| slot.is_none()).unwrap().clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time;

    use super::*;

    #[test]
    fn jobs_all_run() {
        let pool = Pool::new(Duration::from_secs(5));
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..32 {
            let tx = tx.clone();
            pool.submit(move || {
                tx.send(i).unwrap();
            });
        }
        let mut seen: Vec<i32> = (0..32)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("all jobs to run"))
            .collect();
        seen.sort();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn back_to_back_submits_never_starve_the_second_job() {
        let pool = Pool::new(Duration::from_secs(5));
        let gate = Arc::new(Completion::new());
        let (tx, rx) = crossbeam_channel::unbounded();

        // first job blocks immediately, the way a long evaluation does
        {
            let gate = Arc::clone(&gate);
            pool.submit(move || {
                gate.wait(Some(Duration::from_secs(10)));
            });
        }
        // the very next submit must still get a worker of its own
        pool.submit(move || {
            tx.send(()).unwrap();
        });

        rx.recv_timeout(Duration::from_secs(5))
            .expect("second job to run while the first is blocked");
        gate.fill(());
    }

    #[test]
    fn pool_grows_past_blocked_workers() {
        let pool = Pool::new(Duration::from_secs(5));
        let gate = Arc::new(Completion::new());
        let (tx, rx) = crossbeam_channel::unbounded();

        // park a few workers on the gate, then make sure a later job
        // still gets a worker of its own
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            pool.submit(move || {
                gate.wait(Some(Duration::from_secs(10)));
            });
        }
        pool.submit(move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).expect("job to run while others are parked");
        gate.fill(());
    }

    #[test]
    fn idle_workers_get_recycled() {
        let pool = Pool::new(Duration::from_millis(20));
        let (tx, rx) = crossbeam_channel::unbounded();
        pool.submit(move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let deadline = time::Instant::now() + Duration::from_secs(5);
        while pool.live_workers() > 0 && time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.live_workers(), 0);
    }

    #[test]
    fn completion_wakes_waiters() {
        let completion: Arc<Completion<i32>> = Arc::new(Completion::new());
        let waiter = {
            let completion = Arc::clone(&completion);
            thread::spawn(move || completion.wait(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(10));
        completion.fill(7);
        assert_eq!(waiter.join().unwrap(), Some(7));

        // late waiters and late fills
        assert_eq!(completion.wait(Some(Duration::from_millis(1))), Some(7));
        completion.fill(9);
        assert_eq!(completion.wait(None), Some(7));
    }

    #[test]
    fn completion_times_out() {
        let completion: Completion<i32> = Completion::new();
        assert_eq!(completion.wait(Some(Duration::from_millis(10))), None);
    }
}
