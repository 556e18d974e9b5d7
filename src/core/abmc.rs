// src/core/abmc.rs

//! The Asynchronous Board Management Controller (ABMC): one per physical
//! machine. Presents a non-blocking enqueue API over a single worker thread
//! that serialises, merges, and prioritises hardware commands against a
//! slow, blocking `BmpClient`.

use crate::core::board::{BoardAddress, Link};
use crate::core::hardware::BmpClient;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::warn;

pub type Callback = Box<dyn FnOnce(bool) + Send>;

/// A one-shot signal carrying a boolean outcome. Tolerates being awaited
/// before or after the signal is set; setting it twice is a programmer
/// error and panics. May additionally carry a callback, invoked from the
/// worker thread at the moment the outcome is set — this is how completion
/// results reach the Controller's thread-safe inbox without the worker
/// blocking on async machinery.
#[derive(Default)]
pub struct CompletionHandle {
    outcome: Mutex<Option<bool>>,
    condvar: Condvar,
    callback: Mutex<Option<Callback>>,
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("outcome", &self.outcome.lock().unwrap())
            .finish()
    }
}

impl CompletionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: Callback) -> Self {
        Self {
            outcome: Mutex::new(None),
            condvar: Condvar::new(),
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Signals this handle with the given outcome. Must be called at most once.
    pub fn complete(&self, success: bool) {
        {
            let mut outcome = self.outcome.lock().unwrap();
            assert!(
                outcome.is_none(),
                "CompletionHandle signalled more than once"
            );
            *outcome = Some(success);
            self.condvar.notify_all();
        }
        if let Some(cb) = self.callback.lock().unwrap().take() {
            cb(success);
        }
    }

    /// Blocks until this handle is signalled, returning its outcome.
    pub fn wait(&self) -> bool {
        let mut outcome = self.outcome.lock().unwrap();
        while outcome.is_none() {
            outcome = self.condvar.wait(outcome).unwrap();
        }
        outcome.unwrap()
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.lock().unwrap().is_some()
    }
}

struct PowerGroup {
    desired_state: bool,
    boards: BTreeSet<BoardAddress>,
    handles: Vec<Arc<CompletionHandle>>,
}

struct LinkCommand {
    board: BoardAddress,
    link: Link,
    enable: bool,
    handle: Arc<CompletionHandle>,
}

struct State {
    power_queue: VecDeque<PowerGroup>,
    link_queue: VecDeque<LinkCommand>,
    stop: bool,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

/// A scoped acquisition of the ABMC's worker mutex. While held, the worker
/// cannot begin a new dequeue cycle, so every command enqueued through this
/// guard is eligible to merge into the same batch.
pub struct Transaction<'a> {
    shared: &'a Shared,
    guard: Option<MutexGuard<'a, State>>,
}

impl<'a> Transaction<'a> {
    fn state_mut(&mut self) -> &mut State {
        self.guard.as_mut().expect("transaction guard released")
    }

    /// Enqueues a power command. Merges into the tail power group if it
    /// shares the same desired state (rule 1); otherwise cancels any
    /// pending link commands for this board (rule 2) and starts a new group.
    pub fn set_power(&mut self, board: BoardAddress, state: bool) -> Arc<CompletionHandle> {
        self.set_power_with_callback(board, state, None)
    }

    pub fn set_power_with_callback(
        &mut self,
        board: BoardAddress,
        state: bool,
        callback: Option<Callback>,
    ) -> Arc<CompletionHandle> {
        let handle = Arc::new(match callback {
            Some(cb) => CompletionHandle::with_callback(cb),
            None => CompletionHandle::new(),
        });
        {
            let st = self.state_mut();

            let mut retained = VecDeque::with_capacity(st.link_queue.len());
            while let Some(cmd) = st.link_queue.pop_front() {
                if cmd.board == board {
                    cmd.handle.complete(false);
                } else {
                    retained.push_back(cmd);
                }
            }
            st.link_queue = retained;

            let merged = match st.power_queue.back_mut() {
                Some(tail) if tail.desired_state == state => {
                    tail.boards.insert(board);
                    tail.handles.push(handle.clone());
                    true
                }
                _ => false,
            };

            if !merged {
                let mut boards = BTreeSet::new();
                boards.insert(board);
                st.power_queue.push_back(PowerGroup {
                    desired_state: state,
                    boards,
                    handles: vec![handle.clone()],
                });
            }
        }
        self.shared.condvar.notify_all();
        handle
    }

    /// Enqueues a link-enable command at the tail of the link queue.
    pub fn set_link_enable(
        &mut self,
        board: BoardAddress,
        link: Link,
        enable: bool,
    ) -> Arc<CompletionHandle> {
        self.set_link_enable_with_callback(board, link, enable, None)
    }

    pub fn set_link_enable_with_callback(
        &mut self,
        board: BoardAddress,
        link: Link,
        enable: bool,
        callback: Option<Callback>,
    ) -> Arc<CompletionHandle> {
        let handle = Arc::new(match callback {
            Some(cb) => CompletionHandle::with_callback(cb),
            None => CompletionHandle::new(),
        });
        self.state_mut().link_queue.push_back(LinkCommand {
            board,
            link,
            enable,
            handle: handle.clone(),
        });
        self.shared.condvar.notify_all();
        handle
    }
}

/// A per-machine, non-blocking front end over a single BMP worker thread.
pub struct AsyncBmpController {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncBmpController {
    /// Spawns the worker thread. `on_thread_start`, if given, runs exactly
    /// once at worker entry, before the first dequeue attempt.
    pub fn new(
        bmp: Arc<dyn BmpClient>,
        on_thread_start: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                power_queue: VecDeque::new(),
                link_queue: VecDeque::new(),
                stop: false,
            }),
            condvar: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let thread = std::thread::spawn(move || worker_loop(worker_shared, bmp, on_thread_start));
        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Acquires the transaction guard. Commands enqueued through the
    /// returned `Transaction` are eligible to merge as a single batch, and
    /// the worker cannot dequeue until it is dropped.
    pub fn transaction(&self) -> Transaction<'_> {
        let guard = self.shared.state.lock().unwrap();
        Transaction {
            shared: &self.shared,
            guard: Some(guard),
        }
    }

    /// Enqueues a single power command as its own one-command transaction.
    pub fn set_power(&self, board: BoardAddress, state: bool) -> Arc<CompletionHandle> {
        self.transaction().set_power(board, state)
    }

    /// Enqueues a single link-enable command as its own one-command transaction.
    pub fn set_link_enable(
        &self,
        board: BoardAddress,
        link: Link,
        enable: bool,
    ) -> Arc<CompletionHandle> {
        self.transaction().set_link_enable(board, link, enable)
    }

    /// As `set_power`, but invokes `callback` from the worker thread the
    /// moment the outcome is known, instead of (or in addition to) waiting
    /// on the returned handle.
    pub fn set_power_with_callback(
        &self,
        board: BoardAddress,
        state: bool,
        callback: Callback,
    ) -> Arc<CompletionHandle> {
        self.transaction()
            .set_power_with_callback(board, state, Some(callback))
    }

    /// As `set_link_enable`, but invokes `callback` from the worker thread.
    pub fn set_link_enable_with_callback(
        &self,
        board: BoardAddress,
        link: Link,
        enable: bool,
        callback: Callback,
    ) -> Arc<CompletionHandle> {
        self.transaction()
            .set_link_enable_with_callback(board, link, enable, Some(callback))
    }

    /// Returns `(power_queue_len, link_queue_len)`, the number of pending
    /// groups/commands not yet picked up by the worker thread. For metrics
    /// reporting only; racy by nature (the worker may drain between the
    /// lock being released and the caller reading the result).
    pub fn queue_depths(&self) -> (usize, usize) {
        let st = self.shared.state.lock().unwrap();
        (st.power_queue.len(), st.link_queue.len())
    }

    /// Requests shutdown. Queued commands continue to drain; the worker
    /// will not accept any commands enqueued after this point as new work,
    /// but any already queued complete normally.
    pub fn stop(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.stop = true;
        self.shared.condvar.notify_all();
    }

    /// Waits for the worker thread to exit. Only returns after the worker
    /// has drained both queues following a `stop()`.
    pub fn join(&self) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}

fn worker_loop(
    shared: Arc<Shared>,
    bmp: Arc<dyn BmpClient>,
    on_thread_start: Option<Box<dyn FnOnce() + Send>>,
) {
    if let Some(f) = on_thread_start {
        f();
    }
    loop {
        let mut st = shared.state.lock().unwrap();
        loop {
            if !st.power_queue.is_empty() || !st.link_queue.is_empty() {
                break;
            }
            if st.stop {
                return;
            }
            st = shared.condvar.wait(st).unwrap();
        }

        // Scheduling priority: power queue strictly before link queue.
        if let Some(group) = st.power_queue.pop_front() {
            drop(st);
            let result = bmp.set_power(group.desired_state, &group.boards);
            let ok = result.is_ok();
            if let Err(e) = &result {
                warn!(
                    state = group.desired_state,
                    boards = ?group.boards,
                    error = %e,
                    "set_power failed"
                );
            }
            for handle in group.handles {
                handle.complete(ok);
            }
        } else if let Some(cmd) = st.link_queue.pop_front() {
            drop(st);
            let (fpga, addr) = cmd.link.fpga_register();
            let value = Link::register_value(cmd.enable);
            let result = bmp.write_fpga_reg(fpga, addr, value, cmd.board);
            let ok = result.is_ok();
            if let Err(e) = &result {
                warn!(
                    board = %cmd.board,
                    link = ?cmd.link,
                    error = %e,
                    "write_fpga_reg failed"
                );
            }
            cmd.handle.complete(ok);
        } else {
            drop(st);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        SetPower(bool, BTreeSet<BoardAddress>),
        WriteFpgaReg(u8, u32, u32, BoardAddress),
    }

    #[derive(Default)]
    struct RecordingBmp {
        calls: Mutex<Vec<Call>>,
        fail_power: AtomicBool,
        fail_link: AtomicBool,
    }

    impl BmpClient for RecordingBmp {
        fn set_power(
            &self,
            state: bool,
            boards: &BTreeSet<BoardAddress>,
        ) -> std::io::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::SetPower(state, boards.clone()));
            if self.fail_power.load(Ordering::SeqCst) {
                Err(std::io::Error::other("simulated failure"))
            } else {
                Ok(())
            }
        }

        fn write_fpga_reg(
            &self,
            fpga: u8,
            addr: u32,
            value: u32,
            board: BoardAddress,
        ) -> std::io::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::WriteFpgaReg(fpga, addr, value, board));
            if self.fail_link.load(Ordering::SeqCst) {
                Err(std::io::Error::other("simulated failure"))
            } else {
                Ok(())
            }
        }
    }

    fn board(n: u8) -> BoardAddress {
        BoardAddress::new(0, 0, n)
    }

    fn wait_for<F: Fn() -> bool>(f: F) {
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !f() {
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting for condition");
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn merges_power_commands_in_one_transaction() {
        let bmp = Arc::new(RecordingBmp::default());
        let abc = AsyncBmpController::new(bmp.clone(), None);

        let (h1, h2, h3) = {
            let mut txn = abc.transaction();
            (
                txn.set_power(board(10), false),
                txn.set_power(board(11), false),
                txn.set_power(board(13), false),
            )
        };
        assert!(h1.wait());
        assert!(h2.wait());
        assert!(h3.wait());

        let calls = bmp.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            Call::SetPower(false, BTreeSet::from([board(10), board(11), board(13)]))
        );
        drop(calls);
        abc.stop();
        abc.join();
    }

    #[test]
    fn does_not_merge_across_different_states() {
        let bmp = Arc::new(RecordingBmp::default());
        let abc = AsyncBmpController::new(bmp.clone(), None);

        let (h1, h2, h3) = {
            let mut txn = abc.transaction();
            (
                txn.set_power(board(10), false),
                txn.set_power(board(11), true),
                txn.set_power(board(12), false),
            )
        };
        h1.wait();
        h2.wait();
        h3.wait();

        let calls = bmp.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                Call::SetPower(false, BTreeSet::from([board(10)])),
                Call::SetPower(true, BTreeSet::from([board(11)])),
                Call::SetPower(false, BTreeSet::from([board(12)])),
            ]
        );
        abc.stop();
        abc.join();
    }

    #[test]
    fn power_queue_has_priority_over_link_queue() {
        let bmp = Arc::new(RecordingBmp::default());
        let abc = AsyncBmpController::new(bmp.clone(), None);

        let (h_on, h_link, h_off) = {
            let mut txn = abc.transaction();
            (
                txn.set_power(board(10), true),
                txn.set_link_enable(board(11), Link::East, true),
                txn.set_power(board(12), false),
            )
        };
        h_on.wait();
        h_off.wait();
        h_link.wait();

        let calls = bmp.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                Call::SetPower(true, BTreeSet::from([board(10)])),
                Call::SetPower(false, BTreeSet::from([board(12)])),
                Call::WriteFpgaReg(0, 0x0000_005C, 0, board(11)),
            ]
        );
        abc.stop();
        abc.join();
    }

    #[test]
    fn power_cancels_pending_links_for_same_board() {
        let bmp = Arc::new(RecordingBmp::default());
        let abc = AsyncBmpController::new(bmp.clone(), None);

        let (e1, e2, e3, e4) = {
            let mut txn = abc.transaction();
            (
                txn.set_power(board(10), true),
                txn.set_link_enable(board(10), Link::East, true),
                txn.set_link_enable(board(11), Link::East, true),
                txn.set_power(board(11), false),
            )
        };
        assert!(e1.wait());
        assert!(e2.wait());
        assert!(!e3.wait());
        assert!(e4.wait());

        let calls = bmp.calls.lock().unwrap();
        let power_calls = calls
            .iter()
            .filter(|c| matches!(c, Call::SetPower(..)))
            .count();
        let link_calls = calls
            .iter()
            .filter(|c| matches!(c, Call::WriteFpgaReg(..)))
            .count();
        assert_eq!(power_calls, 2);
        assert_eq!(link_calls, 1);
        drop(calls);
        abc.stop();
        abc.join();
    }

    #[test]
    fn stop_drains_queued_work_before_exit() {
        let bmp = Arc::new(RecordingBmp::default());
        let abc = AsyncBmpController::new(bmp.clone(), None);

        let (power_done, link_done) = {
            let mut txn = abc.transaction();
            let p = txn.set_power(board(10), false);
            let l = txn.set_link_enable(board(11), Link::East, false);
            (p, l)
        };
        abc.stop();

        assert!(power_done.wait());
        assert!(link_done.wait());
        abc.join();
    }

    #[test]
    fn link_enable_encodes_fpga_and_register() {
        let bmp = Arc::new(RecordingBmp::default());
        let abc = AsyncBmpController::new(bmp.clone(), None);

        abc.set_link_enable(board(10), Link::SouthWest, false).wait();

        let calls = bmp.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            Call::WriteFpgaReg(1, 0x0000_005C, 1, board(10))
        );
        drop(calls);
        abc.stop();
        abc.join();
    }

    #[test]
    fn hardware_failure_fails_all_callbacks_but_keeps_draining() {
        let bmp = Arc::new(RecordingBmp::default());
        bmp.fail_power.store(true, Ordering::SeqCst);
        let abc = AsyncBmpController::new(bmp.clone(), None);

        let (h1, h2) = {
            let mut txn = abc.transaction();
            (txn.set_power(board(1), true), txn.set_power(board(2), true))
        };
        // Merged into one group, one failing call, both callbacks false.
        assert!(!h1.wait());
        assert!(!h2.wait());

        bmp.fail_power.store(false, Ordering::SeqCst);
        let h3 = abc.set_power(board(3), true);
        assert!(h3.wait());

        wait_for(|| bmp.calls.lock().unwrap().len() >= 2);
        abc.stop();
        abc.join();
    }

    #[test]
    fn on_thread_start_runs_exactly_once() {
        let bmp = Arc::new(RecordingBmp::default());
        let counter = Arc::new(AtomicBool::new(false));
        let counter2 = counter.clone();
        let abc = AsyncBmpController::new(
            bmp,
            Some(Box::new(move || {
                counter2.store(true, Ordering::SeqCst);
            })),
        );
        abc.stop();
        abc.join();
        assert!(counter.load(Ordering::SeqCst));
    }
}
