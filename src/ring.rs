use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::{fmt, ptr};

use crossbeam_utils::CachePadded;

/// A fixed-capacity single-producer/single-consumer ring of typed slots.
///
/// The ring itself is never handed out directly; [`channel`] splits it into a
/// [`Producer`] half and a [`Consumer`] half, and the type system enforces the
/// SPSC discipline from there. Both cursors increase monotonically and are
/// allowed to wrap; every occupancy computation uses wrapping subtraction, so
/// correctness is unaffected by the eventual `u64` overflow. The slot index is
/// always `cursor & mask`, never an explicit modulo.
pub struct Spsc<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: u64,

    // written only by the producer, read by both sides
    inp: CachePadded<AtomicU64>,
    // written only by the consumer, read by both sides
    outp: CachePadded<AtomicU64>,
}

unsafe impl<T: Send> Send for Spsc<T> {}
unsafe impl<T: Send> Sync for Spsc<T> {}

impl<T> Spsc<T> {
    fn with_origin(capacity: usize, origin: u64) -> Self {
        assert!(capacity > 0, "cannot create a ring with zero capacity");
        let capacity = capacity.next_power_of_two();

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));

        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity as u64 - 1,
            inp: CachePadded::new(AtomicU64::new(origin)),
            outp: CachePadded::new(AtomicU64::new(origin)),
        }
    }
    fn capacity(&self) -> u64 {
        self.mask + 1
    }
    fn slot(&self, cursor: u64) -> *mut MaybeUninit<T> {
        self.slots[(cursor & self.mask) as usize].get()
    }
}

impl<T> Drop for Spsc<T> {
    fn drop(&mut self) {
        // exclusive access here; whatever was published but never consumed
        // still needs to be dropped. reserved-but-unproduced slots cannot be
        // distinguished from free ones and are treated as uninitialized.
        let mut outp = self.outp.load(Ordering::Relaxed);
        let inp = self.inp.load(Ordering::Relaxed);
        while outp != inp {
            unsafe { ptr::drop_in_place((*self.slot(outp)).as_mut_ptr()) };
            outp = outp.wrapping_add(1);
        }
    }
}

/// Create a ring with at least `capacity` slots (rounded up to a power of
/// two), split into its producer and consumer halves.
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    channel_with_origin(capacity, 0)
}

fn channel_with_origin<T>(capacity: usize, origin: u64) -> (Producer<T>, Consumer<T>) {
    let ring = Arc::new(Spsc::with_origin(capacity, origin));
    (
        Producer {
            ring: Arc::clone(&ring),
            reserved: 0,
        },
        Consumer { ring, peeked: 0 },
    )
}

/// The error returned when sending to a full ring, handing the rejected item
/// back for reuse.
#[derive(Debug, Eq, PartialEq)]
pub struct Full<T>(pub T);

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ring is full")
    }
}

/// The sending half of a ring. `Send`, but deliberately not `Clone`: there is
/// exactly one producer per ring, and that producer may keep several slots
/// reserved before publishing them.
pub struct Producer<T> {
    ring: Arc<Spsc<T>>,
    // slots handed out by `acquire` but not yet published with `produce`
    reserved: u64,
}

impl<T: Send> Producer<T> {
    /// Reserve the next free slot for writing, without making it visible to
    /// the consumer. Returns `None` when the ring is full; that is expected
    /// backpressure, not an error.
    ///
    /// Reservations may be stacked; [`produce`] publishes them strictly in
    /// acquisition order, so every reserved slot must be written before the
    /// matching `produce` call.
    ///
    /// [`produce`]: #method.produce
    pub fn acquire(&mut self) -> Option<&mut MaybeUninit<T>> {
        let inp = self.ring.inp.load(Ordering::Relaxed);
        let outp = self.ring.outp.load(Ordering::Acquire);

        if inp.wrapping_add(self.reserved).wrapping_sub(outp) >= self.ring.capacity() {
            return None;
        }
        let cursor = inp.wrapping_add(self.reserved);
        self.reserved += 1;
        Some(unsafe { &mut *self.ring.slot(cursor) })
    }

    /// Publish the oldest reserved slot, making it consumable.
    ///
    /// # Panics
    /// Panics if there is no outstanding reservation; `produce` must be
    /// called exactly once per successful [`acquire`], in acquire order.
    ///
    /// [`acquire`]: #method.acquire
    pub fn produce(&mut self) {
        assert!(
            self.reserved > 0,
            "produce() without a matching acquire() on this ring"
        );
        let inp = self.ring.inp.load(Ordering::Relaxed);
        self.ring.inp.store(inp.wrapping_add(1), Ordering::Release);
        self.reserved -= 1;
    }

    /// Number of reserved-but-unpublished slots held by this producer.
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    /// Free slots left, counting outstanding reservations as used.
    pub fn space(&self) -> u64 {
        let inp = self.ring.inp.load(Ordering::Relaxed);
        let outp = self.ring.outp.load(Ordering::Acquire);
        self.ring.capacity() - inp.wrapping_add(self.reserved).wrapping_sub(outp)
    }

    /// Write and publish one item in a single step. Equivalent to
    /// `acquire` + write + `produce`, and therefore must not be interleaved
    /// with reservations that have not been published yet.
    ///
    /// # Panics
    /// Panics if reservations are outstanding, since publishing past them
    /// would expose an unwritten slot.
    pub fn try_send(&mut self, item: T) -> Result<(), Full<T>> {
        assert_eq!(
            self.reserved, 0,
            "try_send() while slots are still reserved would publish an unwritten slot"
        );
        match self.acquire() {
            Some(slot) => {
                slot.write(item);
                self.produce();
                Ok(())
            }
            None => Err(Full(item)),
        }
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("inp", &self.ring.inp.load(Ordering::Relaxed))
            .field("outp", &self.ring.outp.load(Ordering::Relaxed))
            .field("reserved", &self.reserved)
            .finish()
    }
}

/// The receiving half of a ring. `Send`, not `Clone`; exactly one consumer
/// exists per ring.
pub struct Consumer<T> {
    ring: Arc<Spsc<T>>,
    // slots exposed by `consume` but not yet freed with `release`
    peeked: u64,
}

impl<T: Send> Consumer<T> {
    /// Number of published entries not yet released, wraparound-safe.
    pub fn consumable(&self) -> u64 {
        let inp = self.ring.inp.load(Ordering::Acquire);
        let outp = self.ring.outp.load(Ordering::Relaxed);
        inp.wrapping_sub(outp)
    }

    /// Expose the oldest not-yet-exposed entry for reading, without freeing
    /// its slot. Returns `None` when nothing is consumable. Peeks may be
    /// stacked; [`release`] frees them strictly in consume order.
    ///
    /// [`release`]: #method.release
    pub fn consume(&mut self) -> Option<&T> {
        if self.consumable() <= self.peeked {
            return None;
        }
        let cursor = self
            .ring
            .outp
            .load(Ordering::Relaxed)
            .wrapping_add(self.peeked);
        self.peeked += 1;
        Some(unsafe { &*(*self.ring.slot(cursor)).as_ptr() })
    }

    /// Drop the oldest consumed entry and hand its slot back to the
    /// producer.
    ///
    /// # Panics
    /// Panics if there is no outstanding [`consume`]; `release` must be
    /// called exactly once per successful consume, in consume order.
    ///
    /// [`consume`]: #method.consume
    pub fn release(&mut self) {
        assert!(
            self.peeked > 0,
            "release() without a matching consume() on this ring"
        );
        let outp = self.ring.outp.load(Ordering::Relaxed);
        unsafe { ptr::drop_in_place((*self.ring.slot(outp)).as_mut_ptr()) };
        self.ring
            .outp
            .store(outp.wrapping_add(1), Ordering::Release);
        self.peeked -= 1;
    }

    /// Move the oldest entry out of the ring and free its slot in one step.
    /// Equivalent to `consume` + read + `release`, and therefore must not be
    /// interleaved with peeks that have not been released yet.
    ///
    /// # Panics
    /// Panics if peeks are outstanding, since the oldest slot is still
    /// borrowed in that case.
    pub fn try_recv(&mut self) -> Option<T> {
        assert_eq!(
            self.peeked, 0,
            "try_recv() while entries are still peeked would free a borrowed slot"
        );
        if self.consumable() == 0 {
            return None;
        }
        let outp = self.ring.outp.load(Ordering::Relaxed);
        let item = unsafe { ptr::read((*self.ring.slot(outp)).as_ptr()) };
        self.ring
            .outp
            .store(outp.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Iterate over everything currently consumable, without blocking.
    pub fn try_iter(&mut self) -> impl Iterator<Item = T> + '_ {
        core::iter::from_fn(move || self.try_recv())
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("inp", &self.ring.inp.load(Ordering::Relaxed))
            .field("outp", &self.ring.outp.load(Ordering::Relaxed))
            .field("peeked", &self.peeked)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{channel, channel_with_origin};

    #[test]
    fn fifo_order() {
        let (mut tx, mut rx) = channel::<u32>(8);
        for i in 0..8 {
            tx.try_send(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(rx.try_recv(), Some(i));
        }
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn capacity_backpressure() {
        let (mut tx, mut rx) = channel::<u32>(4);
        for i in 0..4 {
            tx.try_send(i).unwrap();
        }
        assert!(tx.acquire().is_none());
        assert!(tx.try_send(99).is_err());

        rx.consume().unwrap();
        rx.release();
        // exactly one slot came back
        tx.try_send(4).unwrap();
        assert!(tx.acquire().is_none());
    }

    #[test]
    fn capacity_one_scenario() {
        let (mut tx, mut rx) = channel::<u32>(1);

        tx.acquire().unwrap().write(7);
        assert!(tx.acquire().is_none());
        tx.produce();

        assert_eq!(rx.consume().copied(), Some(7));
        assert!(rx.consume().is_none());
        rx.release();

        assert!(tx.acquire().is_some());
    }

    #[test]
    fn stacked_reservations_publish_in_order() {
        let (mut tx, mut rx) = channel::<u32>(4);
        tx.acquire().unwrap().write(1);
        tx.acquire().unwrap().write(2);
        assert_eq!(tx.reserved(), 2);
        assert_eq!(rx.consumable(), 0);

        tx.produce();
        assert_eq!(rx.consumable(), 1);
        tx.produce();

        assert_eq!(rx.try_recv(), Some(1));
        assert_eq!(rx.try_recv(), Some(2));
    }

    #[test]
    fn wraparound_near_cursor_overflow() {
        // seed both cursors close enough to u64::MAX that they overflow
        // mid-test; behavior must be identical to starting from zero.
        let (mut tx, mut rx) = channel_with_origin::<u64>(4, u64::MAX - 2);
        for round in 0..4u64 {
            for i in 0..4 {
                tx.try_send(round * 4 + i).unwrap();
            }
            assert!(tx.acquire().is_none());
            for i in 0..4 {
                assert_eq!(rx.try_recv(), Some(round * 4 + i));
            }
            assert_eq!(rx.consumable(), 0);
        }
    }

    #[test]
    fn drops_unconsumed_items() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        #[derive(Debug)]
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let (mut tx, rx) = channel::<Tracked>(4);
        for _ in 0..3 {
            tx.try_send(Tracked(Arc::clone(&drops))).unwrap();
        }
        drop(tx);
        drop(rx);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn multithreaded_spsc() {
        let (mut tx, mut rx) = channel::<u64>(64);

        let second = std::thread::spawn(move || {
            'pushing: for i in 0..=4096u64 {
                let mut value = i;
                loop {
                    match tx.try_send(value) {
                        Ok(()) => continue 'pushing,
                        Err(super::Full(v)) => {
                            value = v;
                            std::thread::yield_now();
                        }
                    }
                }
            }
        });

        let mut i = 0u64;
        while i <= 4096 {
            match rx.try_recv() {
                Some(v) => {
                    assert_eq!(v, i);
                    i += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        second.join().unwrap();
    }
}
