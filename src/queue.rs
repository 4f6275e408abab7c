use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::entry::{Cqe, CqeBuf, Sqe, SqeHandle};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::memory::{Mempool, PoolBuf};
use crate::ring::{self, Consumer, Producer};

/// State shared between the context handle, the executor and every in-flight
/// operation: the executor-facing ring ends, the optional mempool and the
/// completion wakeup plumbing.
pub(crate) struct Shared {
    // consumed by the executor when `submit` runs
    pub(crate) sq_cons: Mutex<Consumer<Sqe>>,
    // fed from whichever context finishes an operation
    cq_prod: Mutex<Producer<Cqe>>,
    // completions may land from any thread; a blocked consumer re-checks the
    // ring under this lock before sleeping, so no notification can fall
    // between its failed pop and its wait.
    wake_lock: Mutex<()>,
    wake: Condvar,
    dropped: AtomicU64,
    pool: Option<Mempool>,
}

impl Shared {
    /// Push a completion, dropping it with a count when the CQ is full.
    pub(crate) fn cqe_produce(&self, cqe: Cqe) {
        if let Err(ring::Full(cqe)) = self.cq_prod.lock().try_send(cqe) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "completion queue full; dropping completion for user_data {}",
                cqe.user_data
            );
        }
        let _wake = self.wake_lock.lock();
        self.wake.notify_all();
    }

    /// Resolve a pool-backed read destination at dispatch time.
    pub(crate) fn alloc(&self, len: usize) -> Result<PoolBuf> {
        match self.pool {
            Some(ref pool) => pool.alloc(len),
            None => Err(Error::NotSupported),
        }
    }
}

/// An rtio context: a submission ring feeding an executor, a completion ring
/// fed by finished operations, and an optional mempool for read buffers.
///
/// The handle owns the caller-facing ring ends, so submission and consumption
/// take `&mut self` and the single-producer/single-consumer discipline is
/// enforced by ownership. Completions, in contrast, arrive from arbitrary
/// threads; [`cqe_consume_block`] sleeps until one does.
///
/// [`cqe_consume_block`]: #method.cqe_consume_block
pub struct Rtio {
    sq_prod: Producer<Sqe>,
    cq_cons: Consumer<Cqe>,
    shared: Arc<Shared>,
    executor: Executor,
}

impl Rtio {
    pub fn builder() -> RtioBuilder {
        RtioBuilder::new()
    }

    /// Copy an entry into the next free submission slot. The entry is staged:
    /// invisible to the executor until [`submit`] publishes it. Returns the
    /// entry's cancel/signal handle, or [`Error::Full`] when the submission
    /// ring has no free slot.
    ///
    /// [`submit`]: #method.submit
    pub fn sqe_acquire(&mut self, sqe: Sqe) -> Result<SqeHandle> {
        let handle = sqe.handle();
        match self.sq_prod.acquire() {
            Some(slot) => {
                slot.write(sqe);
                Ok(handle)
            }
            None => Err(Error::Full),
        }
    }

    /// Stage a whole batch, all or nothing: if the ring cannot hold every
    /// entry, nothing is staged and [`Error::Full`] is returned with the
    /// batch untouched elsewhere.
    pub fn copy_in<I>(&mut self, entries: I) -> Result<Vec<SqeHandle>>
    where
        I: IntoIterator<Item = Sqe>,
        I::IntoIter: ExactSizeIterator,
    {
        let entries = entries.into_iter();
        if entries.len() as u64 > self.sq_prod.space() {
            return Err(Error::Full);
        }
        let mut handles = Vec::with_capacity(entries.len());
        for sqe in entries {
            handles.push(sqe.handle());
            match self.sq_prod.acquire() {
                Some(slot) => {
                    slot.write(sqe);
                }
                // space was checked above and nothing else produces
                None => unreachable!("submission ring lost space mid-batch"),
            }
        }
        Ok(handles)
    }

    /// Publish `count` staged entries (0 means all of them) in staging order
    /// and hand them to the executor. Fails with [`Error::Empty`] when fewer
    /// than `count` entries are staged, publishing none.
    pub fn submit(&mut self, count: usize) -> Result<usize> {
        let reserved = self.sq_prod.reserved() as usize;
        let count = if count == 0 { reserved } else { count };
        if count > reserved {
            return Err(Error::Empty);
        }
        for _ in 0..count {
            self.sq_prod.produce();
        }
        log::debug!("published {} submission(s)", count);
        self.executor.submit(&self.shared);
        Ok(count)
    }

    /// Pop the oldest completion, if any. Never blocks.
    pub fn cqe_consume(&mut self) -> Option<Cqe> {
        self.cq_cons.try_recv()
    }

    /// Pop the oldest completion, sleeping until one arrives. A timeout of
    /// `None` waits indefinitely; otherwise [`Error::TimedOut`] is returned
    /// once it expires with the ring still empty.
    pub fn cqe_consume_block(&mut self, timeout: Option<Duration>) -> Result<Cqe> {
        if let Some(cqe) = self.cq_cons.try_recv() {
            return Ok(cqe);
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            {
                let mut wake = self.shared.wake_lock.lock();
                // re-check under the wake lock; a completion that landed
                // after the failed pop has already taken this lock to notify.
                if let Some(cqe) = self.cq_cons.try_recv() {
                    return Ok(cqe);
                }
                match deadline {
                    Some(deadline) => {
                        if self.shared.wake.wait_until(&mut wake, deadline).timed_out() {
                            drop(wake);
                            return self.cq_cons.try_recv().ok_or(Error::TimedOut);
                        }
                    }
                    None => self.shared.wake.wait(&mut wake),
                }
            }
            if let Some(cqe) = self.cq_cons.try_recv() {
                return Ok(cqe);
            }
        }
    }

    /// Drain up to `max` completions, blocking (per `timeout`) only for the
    /// first one. Returns an empty vector on timeout.
    pub fn copy_out(&mut self, max: usize, timeout: Option<Duration>) -> Vec<Cqe> {
        let mut out = Vec::new();
        if max == 0 {
            return out;
        }
        match self.cqe_consume_block(timeout) {
            Ok(cqe) => out.push(cqe),
            Err(_) => return out,
        }
        while out.len() < max {
            match self.cq_cons.try_recv() {
                Some(cqe) => out.push(cqe),
                None => break,
            }
        }
        out
    }

    /// Request cancellation of the entry behind `handle`. See
    /// [`SqeHandle::cancel`].
    pub fn sqe_cancel(&self, handle: &SqeHandle) {
        handle.cancel();
    }

    /// Signal the await entry behind `handle`. See [`SqeHandle::signal`].
    pub fn sqe_signal(&self, handle: &SqeHandle) {
        handle.signal();
    }

    /// Return a detached completion buffer. Dropping the buffer has the same
    /// effect; this exists for call sites that want the release explicit.
    pub fn release_buffer(&self, buf: CqeBuf) {
        drop(buf);
    }

    /// The mempool backing pool reads, if one was configured.
    pub fn mempool(&self) -> Option<&Mempool> {
        self.shared.pool.as_ref()
    }

    /// Free submission slots, counting staged entries as used.
    pub fn sq_space(&self) -> usize {
        self.sq_prod.space() as usize
    }

    /// Completions waiting to be consumed.
    pub fn cq_consumable(&self) -> usize {
        self.cq_cons.consumable() as usize
    }

    /// Completions dropped because the completion ring was full.
    pub fn completions_dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

impl fmt::Debug for Rtio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rtio")
            .field("sq", &self.sq_prod)
            .field("cq", &self.cq_cons)
            .field("dropped", &self.completions_dropped())
            .field("executor", &self.executor)
            .finish()
    }
}

/// Builds an [`Rtio`] context. Ring sizes are rounded up to powers of two;
/// the completion ring should be sized at least as large as the submission
/// ring, or bursts of completions may be dropped under the overflow policy.
pub struct RtioBuilder {
    sq_size: usize,
    cq_size: usize,
    executor: Executor,
    pool: Option<Mempool>,
}

impl RtioBuilder {
    pub fn new() -> Self {
        Self {
            sq_size: 32,
            cq_size: 32,
            executor: Executor::serial(),
            pool: None,
        }
    }

    pub fn with_sq_size(mut self, size: usize) -> Self {
        self.sq_size = size;
        self
    }
    pub fn with_cq_size(mut self, size: usize) -> Self {
        self.cq_size = size;
        self
    }
    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }
    /// Attach a mempool of `block_count` blocks of `block_size` bytes,
    /// enabling pool-backed reads ([`Sqe::read`] and multishot).
    pub fn with_mempool(mut self, block_count: usize, block_size: usize) -> Self {
        self.pool = Some(Mempool::new(block_count, block_size));
        self
    }

    pub fn build(self) -> Rtio {
        let (sq_prod, sq_cons) = ring::channel(self.sq_size);
        let (cq_prod, cq_cons) = ring::channel(self.cq_size);
        Rtio {
            sq_prod,
            cq_cons,
            shared: Arc::new(Shared {
                sq_cons: Mutex::new(sq_cons),
                cq_prod: Mutex::new(cq_prod),
                wake_lock: Mutex::new(()),
                wake: Condvar::new(),
                dropped: AtomicU64::new(0),
                pool: self.pool,
            }),
            executor: self.executor,
        }
    }
}

impl Default for RtioBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RtioBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtioBuilder")
            .field("sq_size", &self.sq_size)
            .field("cq_size", &self.cq_size)
            .field("mempool", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Rtio;
    use crate::entry::Sqe;
    use crate::error::Error;
    use std::time::Duration;

    #[test]
    fn nop_roundtrip() {
        let mut rtio = Rtio::builder().with_sq_size(8).with_cq_size(8).build();
        rtio.sqe_acquire(Sqe::nop(None, 7)).unwrap();
        assert_eq!(rtio.submit(0).unwrap(), 1);

        let cqe = rtio.cqe_consume().unwrap();
        assert_eq!(cqe.user_data, 7);
        assert_eq!(cqe.result, Ok(0));
        assert!(rtio.cqe_consume().is_none());
    }

    #[test]
    fn submit_more_than_staged_is_empty() {
        let mut rtio = Rtio::builder().build();
        rtio.sqe_acquire(Sqe::nop(None, 1)).unwrap();
        assert_eq!(rtio.submit(2).unwrap_err(), Error::Empty);
        // nothing was published
        assert!(rtio.cqe_consume().is_none());
        assert_eq!(rtio.submit(1).unwrap(), 1);
        assert_eq!(rtio.cqe_consume().unwrap().user_data, 1);
    }

    #[test]
    fn copy_in_is_all_or_nothing() {
        let mut rtio = Rtio::builder().with_sq_size(4).build();
        let too_many: Vec<Sqe> = (0..5).map(|i| Sqe::nop(None, i)).collect();
        assert_eq!(rtio.copy_in(too_many).unwrap_err(), Error::Full);
        assert_eq!(rtio.sq_space(), 4);

        let batch: Vec<Sqe> = (0..4).map(|i| Sqe::nop(None, i)).collect();
        let handles = rtio.copy_in(batch).unwrap();
        assert_eq!(handles.len(), 4);
        assert_eq!(rtio.sq_space(), 0);
        assert_eq!(rtio.submit(0).unwrap(), 4);
        for i in 0..4 {
            assert_eq!(rtio.cqe_consume().unwrap().user_data, i);
        }
    }

    #[test]
    fn blocking_consume_times_out() {
        let mut rtio = Rtio::builder().build();
        assert_eq!(
            rtio.cqe_consume_block(Some(Duration::from_millis(10)))
                .unwrap_err(),
            Error::TimedOut
        );
    }

    #[test]
    fn blocking_consume_wakes_on_delay() {
        let mut rtio = Rtio::builder().build();
        rtio.sqe_acquire(Sqe::delay(Duration::from_millis(20), 3))
            .unwrap();
        rtio.submit(0).unwrap();

        let cqe = rtio
            .cqe_consume_block(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(cqe.user_data, 3);
        assert_eq!(cqe.result, Ok(0));
    }

    #[test]
    fn overflow_drops_and_counts() {
        let mut rtio = Rtio::builder().with_sq_size(8).with_cq_size(1).build();
        rtio.sqe_acquire(Sqe::nop(None, 1)).unwrap();
        rtio.sqe_acquire(Sqe::nop(None, 2)).unwrap();
        rtio.submit(0).unwrap();

        // one completion fits, the second is dropped and counted
        assert_eq!(rtio.cq_consumable(), 1);
        assert_eq!(rtio.cqe_consume().unwrap().user_data, 1);
        assert_eq!(rtio.completions_dropped(), 1);
    }
}
