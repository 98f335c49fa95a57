use core::{
    future::{poll_fn, Future},
    task::Poll,
};

use portable_atomic::{AtomicU8, Ordering};

use atomic_waker::AtomicWaker;

/// Signals, that the firmware indicated command completion through an interrupt.
///
/// The command channel still confirms completion by reading the shared buffer, this only cuts
/// the sleep between two polls short.
pub struct CompletionSignal {
    state: AtomicU8,
    waker: AtomicWaker,
}
impl CompletionSignal {
    const PENDING: u8 = 0;
    const DONE: u8 = 1;
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::PENDING),
            waker: AtomicWaker::new(),
        }
    }
    pub fn reset(&self) {
        self.state.store(Self::PENDING, Ordering::Relaxed);
    }
    pub fn signal(&self) {
        self.state.store(Self::DONE, Ordering::Release);
        self.waker.wake();
    }
    pub fn wait(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            if self.state.swap(Self::PENDING, Ordering::Acquire) == Self::DONE {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }
}

/// A unit of deferred work, posted from interrupt or timer context.
///
/// The discriminant is also the priority, lower values are processed first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Work {
    /// The receive ring has frames waiting.
    Rx = 0,
    /// Transmit descriptors were completed by the device.
    TxDone = 1,
    /// The device drained a transmit queue, so software backlogs can be pushed.
    QueueEmpty = 2,
    /// Query the firmware for faulted aggregation queues.
    Watchdog = 3,
    /// Flush aged A-MSDU batches.
    AmsduSweep = 4,
}
impl Work {
    const ALL: [Work; 5] = [
        Work::Rx,
        Work::TxDone,
        Work::QueueEmpty,
        Work::Watchdog,
        Work::AmsduSweep,
    ];
    const fn mask(self) -> u8 {
        1 << self as u8
    }
}

/// A queue of deferred work items, which can be fed from interrupt context.
///
/// Posting a work item, that is already pending, is coalesced with the pending one. This means,
/// that posting never blocks or allocates, and the queue can never overflow.
pub struct WorkQueue {
    waker: AtomicWaker,
    pending: AtomicU8,
}
impl WorkQueue {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            pending: AtomicU8::new(0),
        }
    }
    /// Post a work item.
    pub fn put(&self, work: Work) {
        self.pending.fetch_or(work.mask(), Ordering::Release);
        self.waker.wake();
    }
    /// Check if the work item is currently pending.
    pub fn is_pending(&self, work: Work) -> bool {
        self.pending.load(Ordering::Acquire) & work.mask() != 0
    }
    /// Drop all pending work.
    pub fn reset(&self) {
        self.pending.store(0, Ordering::Relaxed);
    }
    /// Take the highest priority work item, if there is one.
    pub fn take(&self) -> Option<Work> {
        loop {
            let pending = self.pending.load(Ordering::Acquire);
            if pending == 0 {
                return None;
            }
            let work = Work::ALL[pending.trailing_zeros() as usize];
            if self.pending.fetch_and(!work.mask(), Ordering::AcqRel) & work.mask() != 0 {
                return Some(work);
            }
        }
    }
    /// Asynchronously wait for the next work item.
    pub async fn next(&self) -> Work {
        poll_fn(|cx| {
            if let Some(work) = self.take() {
                return Poll::Ready(work);
            }
            self.waker.register(cx.waker());
            match self.take() {
                Some(work) => Poll::Ready(work),
                None => Poll::Pending,
            }
        })
        .await
    }
}
