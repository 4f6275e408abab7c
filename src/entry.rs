use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, mem};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::iodev::{Iodev, IodevSqe};
use crate::memory::PoolBuf;

bitflags::bitflags! {
    /// Behavior flags carried by a submission entry.
    ///
    /// `CHAINED` and `TRANSACTION` are forward links: the flag on entry *i*
    /// pulls entry *i + 1* into the same group, so the last member of a group
    /// is the first entry without the flag.
    pub struct SqeFlags: u8 {
        /// The next submitted entry must not start before this one completes.
        const CHAINED = 1 << 0;
        /// The next submitted entry belongs to the same transaction group and
        /// may be dispatched concurrently with this one.
        const TRANSACTION = 1 << 1;
        /// Keep re-dispatching this entry after each successful completion,
        /// until cancelled or until the device fails it.
        const MULTISHOT = 1 << 2;
        /// Execute, but produce no completion entry.
        const NO_RESPONSE = 1 << 3;
    }
}

/// A completion callback. Receives the propagated result of the sequence the
/// entry belongs to: the first error of the chain if one occurred, otherwise
/// the result of the immediately preceding entry (`Ok(0)` for a lone entry).
pub type CallbackFn = Arc<dyn Fn(Result<usize>) + Send + Sync>;

/// What a submission entry asks for. A flat data enum, deliberately not a
/// trait object per kind: every entry shares one slot type in the ring and
/// dispatch stays a plain `match`.
pub enum Op {
    /// Complete immediately with `Ok(0)`.
    Nop,
    /// Read into the described buffer via the target iodev.
    Read(ReadBuf),
    /// Write the given bytes via the target iodev.
    Write(Vec<u8>),
    /// Run a callback inline on the executor, observing the chain result.
    Callback(CallbackFn),
    /// Complete after the given duration has elapsed.
    Delay(Duration),
    /// Pause until the entry's handle is signalled. Iodev-scoped when the
    /// entry has a target (stalls that device's queue), executor-scoped
    /// otherwise (stalls only the containing sequence).
    Await,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Nop => f.write_str("Nop"),
            Op::Read(buf) => f.debug_tuple("Read").field(buf).finish(),
            Op::Write(data) => f.debug_tuple("Write").field(&data.len()).finish(),
            Op::Callback(_) => f.write_str("Callback"),
            Op::Delay(d) => f.debug_tuple("Delay").field(d).finish(),
            Op::Await => f.write_str("Await"),
        }
    }
}

/// Destination of a read operation.
#[derive(Debug)]
pub enum ReadBuf {
    /// A caller-supplied buffer, moved in here and handed back through the
    /// completion entry.
    Provided(Vec<u8>),
    /// Allocate `len` bytes from the context's mempool at dispatch time.
    Pool { len: usize },
}

/// A submission queue entry: one requested operation, its flags, its opaque
/// user data and its optional target device. Value type; it is copied into a
/// ring slot by `sqe_acquire` and moved out again by the executor.
pub struct Sqe {
    pub(crate) op: Op,
    pub(crate) flags: SqeFlags,
    pub(crate) priority: u8,
    pub(crate) user_data: u64,
    pub(crate) iodev: Option<Arc<dyn Iodev>>,
    pub(crate) ctl: Arc<SqeCtl>,
}

impl Sqe {
    fn new(op: Op, iodev: Option<Arc<dyn Iodev>>, user_data: u64) -> Self {
        Self {
            op,
            flags: SqeFlags::empty(),
            priority: 0,
            user_data,
            iodev,
            ctl: Arc::new(SqeCtl::new()),
        }
    }

    /// A no-op entry, completing immediately with `Ok(0)`. The target is
    /// optional; when one is given the entry still completes inline, but the
    /// pairing is useful for exercising ordering across devices.
    pub fn nop(iodev: Option<&Arc<dyn Iodev>>, user_data: u64) -> Self {
        Self::new(Op::Nop, iodev.map(Arc::clone), user_data)
    }

    /// Read `len` bytes into a buffer allocated from the context's mempool at
    /// dispatch time. The buffer arrives attached to the completion entry.
    pub fn read(iodev: &Arc<dyn Iodev>, len: usize, user_data: u64) -> Self {
        Self::new(
            Op::Read(ReadBuf::Pool { len }),
            Some(Arc::clone(iodev)),
            user_data,
        )
    }

    /// Read into a caller-supplied buffer; the filled buffer is handed back
    /// through the completion entry.
    pub fn read_into(iodev: &Arc<dyn Iodev>, buf: Vec<u8>, user_data: u64) -> Self {
        Self::new(
            Op::Read(ReadBuf::Provided(buf)),
            Some(Arc::clone(iodev)),
            user_data,
        )
    }

    /// Write the given bytes to the device.
    pub fn write(iodev: &Arc<dyn Iodev>, data: Vec<u8>, user_data: u64) -> Self {
        Self::new(Op::Write(data), Some(Arc::clone(iodev)), user_data)
    }

    /// Run a callback on the executor. The callback observes the propagated
    /// result of its sequence; see [`CallbackFn`].
    pub fn callback<F>(f: F, user_data: u64) -> Self
    where
        F: Fn(Result<usize>) + Send + Sync + 'static,
    {
        Self::new(Op::Callback(Arc::new(f)), None, user_data)
    }

    /// Like [`callback`], but producing no completion entry.
    ///
    /// [`callback`]: #method.callback
    pub fn callback_no_cqe<F>(f: F, user_data: u64) -> Self
    where
        F: Fn(Result<usize>) + Send + Sync + 'static,
    {
        let mut sqe = Self::callback(f, user_data);
        sqe.flags |= SqeFlags::NO_RESPONSE;
        sqe
    }

    /// Complete after `duration`, without occupying any device.
    pub fn delay(duration: Duration, user_data: u64) -> Self {
        Self::new(Op::Delay(duration), None, user_data)
    }

    /// Pause the target device's queue until the entry is signalled; other
    /// devices are unaffected.
    pub fn await_on(iodev: &Arc<dyn Iodev>, user_data: u64) -> Self {
        Self::new(Op::Await, Some(Arc::clone(iodev)), user_data)
    }

    /// Pause only the containing sequence until signalled; unrelated
    /// sequences on the same executor keep making progress.
    pub fn await_executor(user_data: u64) -> Self {
        Self::new(Op::Await, None, user_data)
    }

    /// Link the next submitted entry behind this one.
    pub fn chained(mut self) -> Self {
        self.flags |= SqeFlags::CHAINED;
        self
    }

    /// Pull the next submitted entry into the same transaction group.
    pub fn transaction(mut self) -> Self {
        self.flags |= SqeFlags::TRANSACTION;
        self
    }

    /// Re-dispatch after every successful completion. Only meaningful for
    /// pool-backed reads; other operations fail their first completion with
    /// [`Error::NotSupported`].
    pub fn multishot(mut self) -> Self {
        self.flags |= SqeFlags::MULTISHOT;
        self
    }

    /// Suppress the completion entry.
    pub fn no_response(mut self) -> Self {
        self.flags |= SqeFlags::NO_RESPONSE;
        self
    }

    /// Set the priority byte. Carried for the benefit of priority-aware
    /// devices; the executor itself dispatches strictly in FIFO order.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn flags(&self) -> SqeFlags {
        self.flags
    }
    pub fn priority(&self) -> u8 {
        self.priority
    }
    pub fn user_data(&self) -> u64 {
        self.user_data
    }
    pub fn op(&self) -> &Op {
        &self.op
    }
    pub fn iodev(&self) -> Option<&Arc<dyn Iodev>> {
        self.iodev.as_ref()
    }

    /// The cancel/signal handle for this entry. The same handle is returned
    /// by `sqe_acquire`; this accessor exists for callers that prepare a
    /// batch with `copy_in` and want handles up front.
    pub fn handle(&self) -> SqeHandle {
        SqeHandle {
            ctl: Arc::clone(&self.ctl),
        }
    }
}

impl fmt::Debug for Sqe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sqe")
            .field("op", &self.op)
            .field("flags", &self.flags)
            .field("priority", &self.priority)
            .field("user_data", &self.user_data)
            .field("iodev", &self.iodev.as_ref().map(|dev| dev.name()))
            .finish()
    }
}

/// Shared control state of one submission entry.
///
/// Cancellation and signalling race against dispatch from other threads, so
/// this state lives behind an `Arc` referenced by both the caller-held
/// [`SqeHandle`] and the executor-owned entry, instead of being a flag bit
/// copied around with the entry value.
pub(crate) struct SqeCtl {
    canceled: AtomicBool,
    sig: Mutex<SigState>,
}

enum SigState {
    Idle,
    // signal() arrived before the await was reached; the await must then
    // complete immediately instead of parking.
    Signaled,
    Parked(IodevSqe),
}

impl SqeCtl {
    fn new() -> Self {
        Self {
            canceled: AtomicBool::new(false),
            sig: Mutex::new(SigState::Idle),
        }
    }

    /// Set the cancel flag, and fail a parked await immediately; an await
    /// that would otherwise wait for a signal that may never come.
    pub(crate) fn cancel(&self) {
        let parked = {
            // the flag is set under the sig lock so that a concurrent park
            // observes either the flag or the unparking, never neither
            let mut sig = self.sig.lock();
            self.canceled.store(true, Ordering::Release);
            if matches!(*sig, SigState::Parked(_)) {
                match mem::replace(&mut *sig, SigState::Idle) {
                    SigState::Parked(op) => Some(op),
                    SigState::Idle | SigState::Signaled => None,
                }
            } else {
                None
            }
        };
        if let Some(op) = parked {
            log::debug!("cancel: failing parked await");
            op.complete(Err(Error::Canceled));
        }
    }
    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Release a parked await, or record the signal so that a not-yet-reached
    /// await becomes a no-op. Idempotent and early-safe.
    pub(crate) fn signal(&self) {
        let parked = {
            let mut sig = self.sig.lock();
            match mem::replace(&mut *sig, SigState::Signaled) {
                SigState::Parked(op) => Some(op),
                SigState::Idle | SigState::Signaled => None,
            }
        };
        if let Some(op) = parked {
            log::debug!("signal: releasing parked await");
            op.complete(Ok(0));
        }
    }

    /// Park an await op until `signal`. The op is handed back for immediate
    /// completion when the signal already arrived or the entry is cancelled;
    /// the caller distinguishes the two through [`is_canceled`].
    ///
    /// [`is_canceled`]: #method.is_canceled
    pub(crate) fn park(&self, op: IodevSqe) -> Option<IodevSqe> {
        let mut sig = self.sig.lock();
        if self.canceled.load(Ordering::Acquire) {
            return Some(op);
        }
        match *sig {
            SigState::Signaled => Some(op),
            SigState::Idle | SigState::Parked(_) => {
                *sig = SigState::Parked(op);
                None
            }
        }
    }
}

impl fmt::Debug for SqeCtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqeCtl")
            .field("canceled", &self.canceled.load(Ordering::Relaxed))
            .finish()
    }
}

/// A caller-held handle to one submitted entry, used to cancel it or to
/// signal its await. Cheap to clone; outliving the entry is harmless.
#[derive(Clone, Debug)]
pub struct SqeHandle {
    pub(crate) ctl: Arc<SqeCtl>,
}

impl SqeHandle {
    /// Request cancellation. Best-effort and non-blocking: an entry not yet
    /// dispatched is removed without producing a completion (taking the rest
    /// of its group with it if it heads one); an active multishot entry stops
    /// being resubmitted; a parked await completes with
    /// [`Error::Canceled`]; an already-completing entry is unaffected.
    pub fn cancel(&self) {
        self.ctl.cancel();
    }

    /// Release the entry's await. Signalling before the await is reached is
    /// safe and makes the await a no-op; signalling twice is harmless.
    pub fn signal(&self) {
        self.ctl.signal();
    }
}

/// Payload buffer attached to a completion entry.
#[derive(Debug)]
pub enum CqeBuf {
    /// The caller-supplied buffer of a `read_into`, handed back filled.
    Owned(Vec<u8>),
    /// A mempool-backed buffer; returns its blocks to the pool when dropped.
    Pool(PoolBuf),
}

impl CqeBuf {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            CqeBuf::Owned(vec) => vec,
            CqeBuf::Pool(buf) => buf,
        }
    }
}

/// A completion queue entry: the result of one finished operation, the user
/// data copied from the originating submission, and the payload buffer for
/// reads.
#[derive(Debug)]
pub struct Cqe {
    pub user_data: u64,
    pub result: Result<usize>,
    pub(crate) buf: Option<CqeBuf>,
}

impl Cqe {
    pub(crate) fn new(user_data: u64, result: Result<usize>, buf: Option<CqeBuf>) -> Self {
        Self {
            user_data,
            result,
            buf,
        }
    }

    /// Borrow the payload bytes, if the operation produced any.
    pub fn buffer(&self) -> Option<&[u8]> {
        self.buf.as_ref().map(CqeBuf::as_slice)
    }

    /// Detach the payload buffer, failing with [`Error::NotSupported`] when
    /// the completion carries none. A detached pool buffer keeps its blocks
    /// until released back via [`Rtio::release_buffer`] or plain drop.
    ///
    /// [`Rtio::release_buffer`]: ../queue/struct.Rtio.html#method.release_buffer
    pub fn take_buffer(&mut self) -> Result<CqeBuf> {
        self.buf.take().ok_or(Error::NotSupported)
    }
}
