use thiserror::Error;

/// The error type shared by the queue surface and by completion results.
///
/// The type is `Copy` so that it can ride inside a [`Cqe`] result and be
/// re-observed by every consumer of a chain without cloning.
///
/// [`Cqe`]: ../entry/struct.Cqe.html
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Error)]
pub enum Error {
    /// The submission ring has no free slot. This is a backpressure signal,
    /// not a failure; retry after consuming completions.
    #[error("submission queue is full")]
    Full,

    /// The completion ring holds no entry.
    #[error("completion queue is empty")]
    Empty,

    /// The mempool could not satisfy an allocation request.
    #[error("mempool exhausted")]
    NoMem,

    /// A blocking consume timed out before an entry became available.
    #[error("timed out waiting for a completion")]
    TimedOut,

    /// The operation was cancelled before it produced a result.
    #[error("operation cancelled")]
    Canceled,

    /// The entry asked for something its target cannot provide, for example
    /// a multishot read without a mempool, or a buffer query on a
    /// completion that carries none.
    #[error("operation not supported by this configuration")]
    NotSupported,

    /// A device-specific failure, with the device's own status code.
    #[error("device error {0}")]
    Device(i32),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
