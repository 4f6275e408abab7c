#![allow(dead_code)]

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;

use rtio::{Error, Iodev, IodevSqe, Op, SerialQueue};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Coerce a concrete test device to the trait object the entry constructors
/// take.
pub fn dyn_dev(dev: &Arc<TestIodev>) -> Arc<dyn Iodev> {
    Arc::clone(dev) as Arc<dyn Iodev>
}

/// A device backed by a single worker thread, so completions genuinely come
/// from another context. Reads fill the destination with the device's pattern
/// byte and report its full length; writes report the payload length; awaits
/// park until signalled.
///
/// `fail_after(n)` arms a countdown: the next `n` data operations succeed,
/// the one after fails once with `Error::Device(5)`, then the device heals.
pub struct TestIodev {
    name: String,
    queue: SerialQueue,
    started: Arc<Mutex<Vec<u64>>>,
    fail_after: Arc<AtomicI32>,
}

impl TestIodev {
    pub fn new(name: &str, fill: u8) -> Arc<Self> {
        let started = Arc::new(Mutex::new(Vec::new()));
        let fail_after = Arc::new(AtomicI32::new(-1));
        let (tx, rx) = mpsc::channel::<IodevSqe>();

        {
            let started = Arc::clone(&started);
            let fail_after = Arc::clone(&fail_after);
            thread::Builder::new()
                .name(format!("iodev-{}", name))
                .spawn(move || worker(rx, started, fail_after, fill))
                .expect("failed to spawn test iodev worker");
        }

        // the sender is not Sync; SerialQueue wants a Sync starter
        let tx = Mutex::new(tx);
        Arc::new(Self {
            name: name.to_owned(),
            queue: SerialQueue::new(move |op| {
                tx.lock().send(op).expect("test iodev worker is gone");
            }),
            started,
            fail_after,
        })
    }

    /// User data of every operation the device has started, in order.
    pub fn started(&self) -> Vec<u64> {
        self.started.lock().clone()
    }

    pub fn fail_after(&self, ops: i32) {
        self.fail_after.store(ops, Ordering::SeqCst);
    }

    pub fn backlog(&self) -> usize {
        self.queue.backlog()
    }
}

impl Iodev for TestIodev {
    fn submit(&self, op: IodevSqe) {
        self.queue.submit(op);
    }
    fn name(&self) -> &str {
        &self.name
    }
}

enum Kind {
    Read,
    Write,
    Await,
    Other,
}

fn worker(
    rx: mpsc::Receiver<IodevSqe>,
    started: Arc<Mutex<Vec<u64>>>,
    fail_after: Arc<AtomicI32>,
    fill: u8,
) {
    for mut op in rx {
        started.lock().push(op.sqe().user_data());

        let kind = match op.sqe().op() {
            Op::Read(_) => Kind::Read,
            Op::Write(_) => Kind::Write,
            Op::Await => Kind::Await,
            _ => Kind::Other,
        };
        if let Kind::Await = kind {
            op.await_signal();
            continue;
        }

        let remaining = fail_after.load(Ordering::SeqCst);
        if remaining == 0 {
            fail_after.store(-1, Ordering::SeqCst);
            op.err(Error::Device(5));
            continue;
        }
        if remaining > 0 {
            fail_after.store(remaining - 1, Ordering::SeqCst);
        }

        match kind {
            Kind::Read => {
                let buf = op.buf_mut();
                for byte in buf.iter_mut() {
                    *byte = fill;
                }
                let n = buf.len();
                op.ok(n);
            }
            Kind::Write => {
                let n = op.data().len();
                op.ok(n);
            }
            Kind::Await => unreachable!(),
            Kind::Other => op.ok(0),
        }
    }
}
