use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Bookkeeping the executor keeps for every handler it schedules.
///
/// NB: The flags are only read and written while the executor's ready-list lock is held. They
///  are atomics so that handlers can be shared between threads, not for lock-free access.
#[derive(Default)]
pub struct ScheduleState {
    /// the handler is in the ready list
    queued: AtomicBool,
    /// a worker is inside `execute_handling`
    executing: AtomicBool,
    /// the handler was enqueued while executing, and must run again afterwards
    reschedule: AtomicBool,
}

/// A unit of work that the executor can run repeatedly, e.g. the command handling of one
///  connection.
pub trait Schedulable: Send + Sync {
    /// Does one chunk of work and returns `true` if there is more work pending, which makes the
    ///  executor put the handler back at the end of its ready list.
    fn execute_handling(&self) -> bool;

    fn schedule_state(&self) -> &ScheduleState;
}

struct ReadyList {
    handlers: VecDeque<Arc<dyn Schedulable>>,
    shutdown: bool,
}

struct ExecutorShared {
    ready: Mutex<ReadyList>,
    notify: Condvar,
}

/// A fixed pool of OS threads shared by all connections. Workers pull handlers from a single
///  FIFO ready list.
///
/// A handler is never in the ready list twice and never executed by two workers at the same
///  time: enqueueing a handler that is queued already is a no-op, and enqueueing a handler that
///  is currently executing marks it for rescheduling once the current execution is finished.
pub struct CommandExecutor {
    shared: Arc<ExecutorShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandExecutor {
    pub fn new(num_threads: usize) -> anyhow::Result<CommandExecutor> {
        if num_threads == 0 {
            anyhow::bail!("command executor requires at least one thread");
        }

        let shared = Arc::new(ExecutorShared {
            ready: Mutex::new(ReadyList {
                handlers: VecDeque::new(),
                shutdown: false,
            }),
            notify: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(num_threads);
        for index in 0..num_threads {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("cmd executor {}", index + 1))
                .spawn(move || Self::worker_loop(&shared))?;
            threads.push(handle);
        }
        debug!("started command executor with {} threads", num_threads);

        Ok(CommandExecutor {
            shared,
            threads: Mutex::new(threads),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn enqueue_handler(&self, handler: Arc<dyn Schedulable>) {
        let mut ready = self.shared.ready.lock();
        if ready.shutdown {
            debug!("command executor is shut down - dropping handler");
            return;
        }

        let state = handler.schedule_state();
        if state.queued.load(Ordering::Relaxed) {
            trace!("handler is scheduled already");
            return;
        }
        if state.executing.load(Ordering::Relaxed) || state.reschedule.load(Ordering::Relaxed) {
            trace!("handler is executing - marking it for reschedule");
            state.reschedule.store(true, Ordering::Relaxed);
            return;
        }

        state.queued.store(true, Ordering::Relaxed);
        ready.handlers.push_back(handler);
        self.shared.notify.notify_one();
    }

    /// Stops all workers after they finished their current handler, and waits for them to
    ///  terminate. Handlers that are still in the ready list are discarded.
    pub fn shutdown(&self) {
        {
            let mut ready = self.shared.ready.lock();
            ready.shutdown = true;
            ready.handlers.clear();
            self.shared.notify.notify_all();
        }

        let current = std::thread::current().id();
        for handle in self.threads.lock().drain(..) {
            // NB: the last reference to the executor can be dropped by a handler running on one of
            //  its own workers
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("command executor thread terminated with a panic");
            }
        }
    }

    fn worker_loop(shared: &ExecutorShared) {
        let mut ready = shared.ready.lock();
        loop {
            if ready.shutdown {
                break;
            }

            let handler = match ready.handlers.pop_front() {
                Some(handler) => handler,
                None => {
                    shared.notify.wait(&mut ready);
                    continue;
                }
            };

            let state = handler.schedule_state();
            state.queued.store(false, Ordering::Relaxed);
            state.executing.store(true, Ordering::Relaxed);
            state.reschedule.store(false, Ordering::Relaxed);

            let more_pending = MutexGuard::unlocked(&mut ready, || handler.execute_handling());

            let reschedule = more_pending | state.reschedule.swap(false, Ordering::Relaxed);
            state.executing.store(false, Ordering::Relaxed);

            if reschedule && !ready.shutdown {
                // no need to notify anybody: this worker picks it up again if nobody else does
                state.queued.store(true, Ordering::Relaxed);
                ready.handlers.push_back(handler);
            }
        }
        trace!("command executor thread terminates");
    }
}

impl Drop for CommandExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    struct CountingHandler {
        state: ScheduleState,
        runs: AtomicUsize,
        /// number of runs that report more pending work
        more_pending_runs: AtomicUsize,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
        done: Mutex<mpsc::Sender<usize>>,
    }

    impl CountingHandler {
        fn new(done: mpsc::Sender<usize>) -> Arc<CountingHandler> {
            Arc::new(CountingHandler {
                state: ScheduleState::default(),
                runs: AtomicUsize::new(0),
                more_pending_runs: AtomicUsize::new(0),
                gate: Mutex::new(None),
                done: Mutex::new(done),
            })
        }

        /// the first run blocks until the returned sender is used
        fn gated(done: mpsc::Sender<usize>) -> (Arc<CountingHandler>, mpsc::Sender<()>) {
            let handler = Self::new(done);
            let (tx, rx) = mpsc::channel();
            *handler.gate.lock() = Some(rx);
            (handler, tx)
        }
    }

    impl Schedulable for CountingHandler {
        fn execute_handling(&self) -> bool {
            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                gate.recv_timeout(Duration::from_secs(5)).unwrap();
            }

            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            self.done.lock().send(run).unwrap();

            self.more_pending_runs
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn schedule_state(&self) -> &ScheduleState {
            &self.state
        }
    }

    fn assert_no_more_runs(rx: &mpsc::Receiver<usize>) {
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_zero_threads() {
        assert!(CommandExecutor::new(0).is_err());
    }

    #[test]
    fn test_runs_handler() {
        let executor = CommandExecutor::new(2).unwrap();
        assert_eq!(executor.num_threads(), 2);

        let (tx, rx) = mpsc::channel();
        let handler = CountingHandler::new(tx);
        executor.enqueue_handler(handler.clone());

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_no_more_runs(&rx);
    }

    #[test]
    fn test_more_pending_reschedules() {
        let executor = CommandExecutor::new(1).unwrap();

        let (tx, rx) = mpsc::channel();
        let handler = CountingHandler::new(tx);
        handler.more_pending_runs.store(2, Ordering::SeqCst);
        executor.enqueue_handler(handler.clone());

        for expected in 1..=3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        }
        assert_no_more_runs(&rx);
    }

    #[test]
    fn test_enqueue_while_executing() {
        let executor = CommandExecutor::new(4).unwrap();

        let (tx, rx) = mpsc::channel();
        let (handler, gate) = CountingHandler::gated(tx);
        executor.enqueue_handler(handler.clone());

        // wait for a worker to pick it up
        while !handler.state.executing.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }

        // other workers are idle, but none of them may run the handler concurrently
        executor.enqueue_handler(handler.clone());
        executor.enqueue_handler(handler.clone());
        assert!(handler.state.reschedule.load(Ordering::SeqCst));
        assert!(!handler.state.queued.load(Ordering::SeqCst));

        gate.send(()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert_no_more_runs(&rx);
    }

    #[test]
    fn test_queued_handler_is_not_duplicated() {
        let executor = CommandExecutor::new(1).unwrap();

        let (blocker_tx, blocker_rx) = mpsc::channel();
        let (blocker, gate) = CountingHandler::gated(blocker_tx);
        executor.enqueue_handler(blocker.clone());
        while !blocker.state.executing.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }

        let (tx, rx) = mpsc::channel();
        let handler = CountingHandler::new(tx);
        for _ in 0..3 {
            executor.enqueue_handler(handler.clone());
        }
        assert!(handler.state.queued.load(Ordering::SeqCst));

        gate.send(()).unwrap();
        assert_eq!(blocker_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_no_more_runs(&rx);
    }

    #[test]
    fn test_shutdown() {
        let executor = CommandExecutor::new(3).unwrap();
        executor.shutdown();
        assert_eq!(executor.num_threads(), 0);

        let (tx, rx) = mpsc::channel();
        executor.enqueue_handler(CountingHandler::new(tx));
        assert_no_more_runs(&rx);
    }
}
