use std::sync::atomic::{AtomicBool, Ordering};
use std::fmt;
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;

use crate::entry::{Op, ReadBuf, Sqe};
use crate::error::{Error, Result};
use crate::executor::Task;
use crate::memory::PoolBuf;

/// The capability the executor dispatches device operations to.
///
/// `submit` receives ownership of the in-flight operation and must eventually
/// consume it through [`IodevSqe::ok`] or [`IodevSqe::err`] (or park it with
/// [`IodevSqe::await_signal`] for await entries) -- possibly from a thread or
/// timer context entirely unrelated to the submitter. Until then the entry's
/// resources stay alive inside the handle; dropping the handle without
/// completing it stalls the owning sequence forever.
pub trait Iodev: Send + Sync {
    fn submit(&self, op: IodevSqe);

    /// Short name, used for logging only.
    fn name(&self) -> &str {
        "iodev"
    }
}

/// One operation in flight at a device. Wraps the originating submission
/// entry together with its pre-resolved read destination and the executor
/// continuation that runs on completion.
pub struct IodevSqe {
    pub(crate) sqe: Sqe,
    // pool-backed read destination, resolved by the executor at dispatch time
    pub(crate) pool_buf: Option<PoolBuf>,
    pub(crate) task: Arc<Task>,
    // completion hook, attached by SerialQueue to keep draining a busy device
    pub(crate) hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl IodevSqe {
    pub(crate) fn new(sqe: Sqe, pool_buf: Option<PoolBuf>, task: Arc<Task>) -> Self {
        Self {
            sqe,
            pool_buf,
            task,
            hook: None,
        }
    }

    /// The submission entry being executed.
    pub fn sqe(&self) -> &Sqe {
        &self.sqe
    }

    /// The destination buffer of a read operation; empty for anything else.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        match self.sqe.op {
            Op::Read(ReadBuf::Provided(ref mut vec)) => vec.as_mut_slice(),
            Op::Read(ReadBuf::Pool { .. }) => match self.pool_buf {
                Some(ref mut buf) => &mut buf[..],
                None => &mut [],
            },
            _ => &mut [],
        }
    }

    /// The payload of a write operation; empty for anything else.
    pub fn data(&self) -> &[u8] {
        match self.sqe.op {
            Op::Write(ref data) => data,
            _ => &[],
        }
    }

    /// Report success, with the number of bytes transferred (0 for
    /// operations that move no data).
    pub fn ok(self, transferred: usize) {
        self.complete(Ok(transferred));
    }

    /// Report failure.
    pub fn err(self, error: Error) {
        self.complete(Err(error));
    }

    /// Handle an [`Op::Await`] entry: park until the entry's handle is
    /// signalled, or complete immediately if the signal already arrived.
    /// While parked inside a [`SerialQueue`], the device queue stays blocked,
    /// which is exactly the iodev-scoped await contract.
    pub fn await_signal(self) {
        debug_assert!(
            matches!(self.sqe.op, Op::Await),
            "await_signal() on a non-await entry"
        );
        let ctl = Arc::clone(&self.sqe.ctl);
        if let Some(op) = ctl.park(self) {
            // signalled (or cancelled) before we got here
            let result = if ctl.is_canceled() {
                Err(Error::Canceled)
            } else {
                Ok(0)
            };
            op.complete(result);
        }
    }

    pub(crate) fn complete(self, result: Result<usize>) {
        let IodevSqe {
            sqe,
            pool_buf,
            task,
            hook,
        } = self;
        Task::complete(&task, sqe, pool_buf, result);
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl fmt::Debug for IodevSqe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IodevSqe")
            .field("sqe", &self.sqe)
            .field("pool_buf", &self.pool_buf)
            .finish()
    }
}

/// Busy-queuing helper for devices that execute one operation at a time.
///
/// Any number of sequences may submit concurrently; operations are parked in
/// a lock-free queue and started one by one through the `start` function the
/// device supplied at construction. The next operation is started from
/// whichever context completed the previous one, so a device built on this
/// never observes overlapping operations and never reports "busy" to the
/// executor.
pub struct SerialQueue {
    inner: Arc<SerialInner>,
}

struct SerialInner {
    queue: SegQueue<IodevSqe>,
    busy: AtomicBool,
    start: Box<dyn Fn(IodevSqe) + Send + Sync>,
}

impl SerialQueue {
    pub fn new<F>(start: F) -> Self
    where
        F: Fn(IodevSqe) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SerialInner {
                queue: SegQueue::new(),
                busy: AtomicBool::new(false),
                start: Box::new(start),
            }),
        }
    }

    /// Queue an operation, starting it immediately if the device is idle.
    pub fn submit(&self, mut op: IodevSqe) {
        let weak = Arc::downgrade(&self.inner);
        debug_assert!(op.hook.is_none(), "operation already owned by a queue");
        op.hook = Some(Arc::new(move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.on_complete();
            }
        }));
        self.inner.queue.push(op);
        self.inner.try_start();
    }

    /// Operations parked behind the one in flight.
    pub fn backlog(&self) -> usize {
        self.inner.queue.len()
    }
}

impl SerialInner {
    fn try_start(self: &Arc<Self>) {
        // whoever flips busy owns the right to start exactly one operation.
        while self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            match self.queue.pop() {
                Some(op) => {
                    log::trace!("serial queue: starting next operation");
                    (self.start)(op);
                    return;
                }
                None => {
                    self.busy.store(false, Ordering::Release);
                    // a racing submit may have pushed between our failed pop
                    // and clearing busy; re-check or its op would never start.
                    if self.queue.is_empty() {
                        return;
                    }
                }
            }
        }
    }

    fn on_complete(self: &Arc<Self>) {
        self.busy.store(false, Ordering::Release);
        self.try_start();
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("busy", &self.inner.busy.load(Ordering::Relaxed))
            .field("backlog", &self.inner.queue.len())
            .finish()
    }
}
