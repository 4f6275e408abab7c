use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use std::{cmp, fmt, mem, thread};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::entry::{Cqe, CqeBuf, Op, ReadBuf, Sqe, SqeFlags};
use crate::error::{Error, Result};
use crate::iodev::IodevSqe;
use crate::memory::PoolBuf;
use crate::queue::Shared;

/// The dispatch engine of a context.
///
/// The executor has no thread of its own: submission processing runs on
/// whichever thread calls `submit`, and everything after dispatch runs in the
/// context that reports the completion (a device worker, the timer, a
/// signalling thread). What it does own is the concurrency policy: how many
/// sequences may be in flight at once, with the rest waiting in a FIFO
/// backlog.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecInner>,
}

struct ExecInner {
    concurrency: usize,
    state: Mutex<ExecState>,
    timer: OnceCell<Timer>,
}

struct ExecState {
    // sequences currently holding one of the `concurrency` slots
    active: usize,
    backlog: VecDeque<Arc<Task>>,
}

impl Executor {
    /// One sequence in flight at a time; every submitted group runs to
    /// completion before the next one starts. This is the variant that
    /// additionally guarantees transaction groups complete as a contiguous
    /// block ahead of everything submitted after them.
    pub fn serial() -> Self {
        Self::concurrent(1)
    }

    /// Up to `concurrency` sequences in flight at a time.
    ///
    /// # Panics
    /// Panics if `concurrency` is zero.
    pub fn concurrent(concurrency: usize) -> Self {
        assert!(concurrency > 0, "executor needs at least one task slot");
        Self {
            inner: Arc::new(ExecInner {
                concurrency,
                state: Mutex::new(ExecState {
                    active: 0,
                    backlog: VecDeque::new(),
                }),
                timer: OnceCell::new(),
            }),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Drain newly published submission entries, group them into sequences
    /// and schedule each group. Called by `Rtio::submit` on the submitting
    /// thread.
    pub(crate) fn submit(&self, shared: &Arc<Shared>) {
        let tasks = {
            let mut sq = shared.sq_cons.lock();
            let mut tasks = Vec::new();

            while let Some(first) = sq.try_recv() {
                let mut members = VecDeque::new();
                members.push_back(first);

                // CHAINED and TRANSACTION are forward links; keep pulling
                // entries until one without a link terminates the group.
                while members
                    .back()
                    .expect("group cannot be empty")
                    .flags()
                    .intersects(SqeFlags::CHAINED | SqeFlags::TRANSACTION)
                {
                    match sq.try_recv() {
                        Some(next) => members.push_back(next),
                        None => {
                            log::warn!(
                                "submission group truncated: linking entry published without its successor"
                            );
                            break;
                        }
                    }
                }

                let head_flags = members.front().expect("group cannot be empty").flags();
                let kind = if head_flags.contains(SqeFlags::TRANSACTION) {
                    TaskKind::Transaction
                } else if head_flags.contains(SqeFlags::CHAINED) {
                    TaskKind::Chain
                } else {
                    TaskKind::Single
                };
                log::debug!("submitting {:?} sequence of {} entries", kind, members.len());
                tasks.push(Task::new(kind, members, Arc::clone(shared), self.clone()));
            }
            tasks
        };

        for task in tasks {
            self.schedule(task);
        }
    }

    fn schedule(&self, task: Arc<Task>) {
        let runnable = {
            let mut state = self.inner.state.lock();
            if state.active < self.inner.concurrency {
                state.active += 1;
                task.holds_slot.store(true, Ordering::Relaxed);
                Some(task)
            } else {
                log::trace!("all task slots busy; backlogging sequence");
                state.backlog.push_back(task);
                None
            }
        };
        if let Some(task) = runnable {
            task.start();
        }
    }

    /// Hand a finished (or parked) sequence's slot to the oldest backlogged
    /// one, if any.
    fn release_slot(&self) {
        let next = {
            let mut state = self.inner.state.lock();
            match state.backlog.pop_front() {
                Some(task) => {
                    // the slot transfers; active count is unchanged
                    task.holds_slot.store(true, Ordering::Relaxed);
                    Some(task)
                }
                None => {
                    state.active -= 1;
                    None
                }
            }
        };
        if let Some(task) = next {
            task.start();
        }
    }

    fn timer(&self) -> &Timer {
        self.inner.timer.get_or_init(Timer::spawn)
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::serial()
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Executor")
            .field("concurrency", &self.inner.concurrency)
            .field("active", &state.active)
            .field("backlog", &state.backlog.len())
            .finish()
    }
}

impl Drop for ExecInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get() {
            timer.shutdown();
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TaskKind {
    Single,
    Chain,
    Transaction,
}

/// One scheduled sequence: a lone entry, a chain, or a transaction group.
///
/// Shared between the executor, the in-flight [`IodevSqe`] handles and the
/// timer, because completion may arrive from any of those contexts and each
/// of them advances the sequence through [`Task::complete`].
pub(crate) struct Task {
    shared: Arc<Shared>,
    exec: Executor,
    kind: TaskKind,
    state: Mutex<TaskState>,
    holds_slot: AtomicBool,
}

struct TaskState {
    // entries not yet dispatched
    queue: VecDeque<Sqe>,
    // dispatched but not yet completed
    pending: usize,
    // result of the most recently completed entry
    last: Result<usize>,
    // sticky first error of the sequence; what callbacks observe
    first_err: Option<Error>,
}

impl Task {
    fn new(kind: TaskKind, members: VecDeque<Sqe>, shared: Arc<Shared>, exec: Executor) -> Arc<Self> {
        Arc::new(Self {
            shared,
            exec,
            kind,
            state: Mutex::new(TaskState {
                queue: members,
                pending: 0,
                last: Ok(0),
                first_err: None,
            }),
            holds_slot: AtomicBool::new(false),
        })
    }

    fn start(self: &Arc<Self>) {
        match self.kind {
            TaskKind::Single | TaskKind::Chain => self.dispatch_next(),
            TaskKind::Transaction => self.start_transaction(),
        }
    }

    fn start_transaction(self: &Arc<Self>) {
        let members = {
            let mut state = self.state.lock();
            if state
                .queue
                .front()
                .map_or(true, |sqe| sqe.ctl.is_canceled())
            {
                // cancelling the head cancels the whole group, CQE-free
                log::debug!("transaction head cancelled; dropping the group");
                state.queue.clear();
                Vec::new()
            } else {
                let mut members: Vec<Sqe> = state.queue.drain(..).collect();
                // individually cancelled members vanish without a completion
                members.retain(|sqe| !sqe.ctl.is_canceled());
                state.pending = members.len();
                members
            }
        };
        if members.is_empty() {
            return self.finish();
        }
        // members may target different devices and complete in any order;
        // the pending count is what holds the group together.
        for sqe in members {
            self.dispatch(sqe);
        }
    }

    fn dispatch_next(self: &Arc<Self>) {
        let next = {
            let mut state = self.state.lock();
            match state.queue.pop_front() {
                Some(sqe) if sqe.ctl.is_canceled() => {
                    // a cancelled link takes the rest of the sequence with it
                    log::debug!("cancelled entry; dropping remainder of the sequence");
                    state.queue.clear();
                    None
                }
                Some(sqe) => {
                    state.pending = 1;
                    Some(sqe)
                }
                None => None,
            }
        };
        match next {
            Some(sqe) => self.dispatch(sqe),
            None => self.finish(),
        }
    }

    fn dispatch(self: &Arc<Self>, sqe: Sqe) {
        log::trace!("dispatching {:?}", sqe);

        // multishot only composes with pool-backed reads; anything else
        // would need a fresh caller buffer per shot.
        if sqe.flags.contains(SqeFlags::MULTISHOT)
            && !matches!(sqe.op, Op::Read(ReadBuf::Pool { .. }))
        {
            return Task::complete(self, sqe, None, Err(Error::NotSupported));
        }

        match sqe.op {
            Op::Nop => Task::complete(self, sqe, None, Ok(0)),

            Op::Callback(_) => {
                let upstream = self.sequence_result();
                if let Op::Callback(ref callback) = sqe.op {
                    callback(upstream);
                }
                Task::complete(self, sqe, None, Ok(0))
            }

            Op::Delay(duration) => {
                let op = IodevSqe::new(sqe, None, Arc::clone(self));
                self.exec.timer().schedule(Instant::now() + duration, op);
            }

            Op::Await => match sqe.iodev.clone() {
                // iodev-scoped: goes through the device queue and stalls it
                Some(dev) => dev.submit(IodevSqe::new(sqe, None, Arc::clone(self))),
                // executor-scoped: only this sequence parks; its concurrency
                // slot is handed back so unrelated sequences keep going.
                None => {
                    self.drop_slot();
                    let ctl = Arc::clone(&sqe.ctl);
                    if let Some(op) = ctl.park(IodevSqe::new(sqe, None, Arc::clone(self))) {
                        let result = if ctl.is_canceled() {
                            Err(Error::Canceled)
                        } else {
                            Ok(0)
                        };
                        op.complete(result);
                    }
                }
            },

            Op::Read(_) | Op::Write(_) => {
                let dev = match sqe.iodev.clone() {
                    Some(dev) => dev,
                    None => return Task::complete(self, sqe, None, Err(Error::NotSupported)),
                };
                let pool_buf = match sqe.op {
                    Op::Read(ReadBuf::Pool { len }) => match self.shared.alloc(len) {
                        Ok(buf) => Some(buf),
                        // surfaced through the completion, pool state intact
                        Err(error) => return Task::complete(self, sqe, None, Err(error)),
                    },
                    _ => None,
                };
                dev.submit(IodevSqe::new(sqe, pool_buf, Arc::clone(self)));
            }
        }
    }

    /// The result callbacks observe: the sequence's first error if one
    /// occurred, otherwise the result of the previous entry.
    fn sequence_result(&self) -> Result<usize> {
        let state = self.state.lock();
        match state.first_err {
            Some(error) => Err(error),
            None => state.last,
        }
    }

    /// Terminal step of every entry, run in whichever context reported the
    /// result: produce the completion, resubmit multishot entries, advance
    /// the sequence.
    pub(crate) fn complete(
        this: &Arc<Self>,
        mut sqe: Sqe,
        pool_buf: Option<PoolBuf>,
        result: Result<usize>,
    ) {
        let canceled = sqe.ctl.is_canceled();
        let multishot = sqe.flags.contains(SqeFlags::MULTISHOT);

        // a cancelled multishot entry stops silently; the caller asked for
        // no more completions.
        let suppress = sqe.flags.contains(SqeFlags::NO_RESPONSE) || (multishot && canceled);
        if !suppress {
            let payload = cqe_payload(&mut sqe, pool_buf, &result);
            this.shared
                .cqe_produce(Cqe::new(sqe.user_data, result, payload));
        }

        if multishot {
            if result.is_ok() && !canceled {
                log::trace!("multishot: resubmitting user_data {}", sqe.user_data);
                return this.dispatch(sqe);
            }
            if let Err(error) = result {
                // exactly one error CQE was produced above; resubmission
                // stops permanently and a later cancel is a no-op.
                log::debug!("multishot: terminal {:?}, stopping", error);
            }
        }

        match this.kind {
            TaskKind::Single | TaskKind::Chain => {
                {
                    let mut state = this.state.lock();
                    state.pending = 0;
                    state.last = result;
                    if let Err(error) = result {
                        state.first_err.get_or_insert(error);
                    }
                }
                this.dispatch_next();
            }
            TaskKind::Transaction => {
                let done = {
                    let mut state = this.state.lock();
                    state.pending -= 1;
                    state.pending == 0
                };
                if done {
                    this.finish();
                }
            }
        }
    }

    fn finish(self: &Arc<Self>) {
        log::trace!("sequence finished");
        self.drop_slot();
    }

    fn drop_slot(&self) {
        if self.holds_slot.swap(false, Ordering::AcqRel) {
            self.exec.release_slot();
        }
    }
}

/// Extract the payload buffer a successful read hands back through its CQE.
fn cqe_payload(sqe: &mut Sqe, pool_buf: Option<PoolBuf>, result: &Result<usize>) -> Option<CqeBuf> {
    let transferred = match *result {
        Ok(n) => n,
        Err(_) => return None,
    };
    match sqe.op {
        Op::Read(ReadBuf::Provided(ref mut vec)) => {
            let mut vec = mem::take(vec);
            vec.truncate(transferred);
            Some(CqeBuf::Owned(vec))
        }
        Op::Read(ReadBuf::Pool { .. }) => pool_buf.map(|mut buf| {
            let len = cmp::min(transferred, buf.len());
            buf.set_len(len);
            CqeBuf::Pool(buf)
        }),
        _ => None,
    }
}

/// The timer backing `Op::Delay`, shared by every sequence of one executor.
/// Lazily spawns a single worker thread ordering deadlines in a heap; the
/// thread exits when the executor is dropped.
struct Timer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cond: Condvar,
}

struct TimerState {
    queue: BinaryHeap<TimerEntry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerEntry {
    at: Instant,
    // submission order tiebreak for equal deadlines
    seq: u64,
    op: IodevSqe,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline surfaces
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl Timer {
    fn spawn() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&inner);
        thread::Builder::new()
            .name("rtio-timer".to_owned())
            .spawn(move || worker.run())
            .expect("failed to spawn the rtio timer thread");
        Self { inner }
    }

    fn schedule(&self, at: Instant, op: IodevSqe) {
        let mut state = self.inner.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(TimerEntry { at, seq, op });
        self.inner.cond.notify_one();
    }

    fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.cond.notify_one();
    }
}

impl TimerInner {
    fn run(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                // pending delays are dropped without completing; the process
                // is tearing the executor down anyway
                state.queue.clear();
                return;
            }
            let now = Instant::now();
            match state.queue.peek().map(|entry| entry.at) {
                Some(at) if at <= now => {
                    let entry = state.queue.pop().expect("peeked entry vanished");
                    drop(state);
                    entry.op.complete(Ok(0));
                    state = self.state.lock();
                }
                Some(at) => {
                    let _ = self.cond.wait_until(&mut state, at);
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}
