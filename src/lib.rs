//! Ring-based asynchronous I/O contexts: submission entries flow through a
//! lock-free SPSC ring into an executor that dispatches them to devices,
//! and results come back through a completion ring.
//!
//! The usual round trip:
//!
//! ```
//! use rtio::{Rtio, Sqe};
//!
//! let mut rtio = Rtio::builder().with_sq_size(8).with_cq_size(8).build();
//! rtio.sqe_acquire(Sqe::nop(None, 42)).unwrap();
//! rtio.submit(0).unwrap();
//!
//! let cqe = rtio.cqe_consume().unwrap();
//! assert_eq!(cqe.user_data, 42);
//! assert_eq!(cqe.result, Ok(0));
//! ```
//!
//! Devices implement [`Iodev`]; [`SerialQueue`] does the busy-queuing for
//! the common one-operation-at-a-time kind. Sequencing (chains and
//! transactions), multishot reads, cancellation and await/signal pauses are
//! all expressed on the [`Sqe`] before it is staged.

pub mod entry;
pub mod error;
pub mod executor;
pub mod iodev;
pub mod memory;
pub mod queue;
pub mod ring;

pub use entry::{CallbackFn, Cqe, CqeBuf, Op, ReadBuf, Sqe, SqeFlags, SqeHandle};
pub use error::{Error, Result};
pub use executor::Executor;
pub use iodev::{Iodev, IodevSqe, SerialQueue};
pub use memory::{Mempool, PoolBuf};
pub use queue::{Rtio, RtioBuilder};
