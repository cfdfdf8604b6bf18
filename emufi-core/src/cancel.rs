//! Cancellation and racing waits
//!
//! A [`CancelSource`] owns the only sender of a zero-capacity channel;
//! cancelling drops that sender, which wakes every [`CancelSignal`] blocked on
//! the receiving side at once. [`race`] runs two cancellable waits side by
//! side, cancels the loser and reports which side finished first.

use crossbeam_channel as chan;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Owner side of a cancellation channel
#[derive(Debug)]
pub struct CancelSource {
    tx: Mutex<Option<chan::Sender<()>>>,
    rx: chan::Receiver<()>,
}

impl CancelSource {
    /// Create an uncancelled source
    pub fn new() -> Self {
        let (tx, rx) = chan::bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// A signal observing this source
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.rx.clone(),
        }
    }

    /// Cancel every signal derived from this source. Idempotent.
    pub fn cancel(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Whether [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation channel
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: chan::Receiver<()>,
}

impl CancelSignal {
    /// A signal that is never cancelled
    pub fn never() -> Self {
        Self { rx: chan::never() }
    }

    /// Whether the owning source was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(chan::TryRecvError::Disconnected))
    }

    /// Sleep for `timeout` unless cancelled first. Returns `true` if cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        !matches!(
            self.rx.recv_timeout(timeout),
            Err(chan::RecvTimeoutError::Timeout)
        )
    }

    /// Like [`sleep`](Self::sleep), but `other` cancels the sleep as well.
    /// Returns `true` if either signal was cancelled.
    pub fn sleep_either(&self, other: &CancelSignal, timeout: Duration) -> bool {
        chan::select! {
            recv(self.rx) -> _ => true,
            recv(other.rx) -> _ => true,
            default(timeout) => false,
        }
    }

    /// The underlying receiver, for use in `select!`. It becomes ready
    /// (disconnected) on cancellation and never yields a value.
    pub fn receiver(&self) -> &chan::Receiver<()> {
        &self.rx
    }
}

/// Which side of a [`race`] finished first
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Race<A, B> {
    /// The first task completed first
    First(A),
    /// The second task completed first
    Second(B),
}

/// Run both tasks concurrently and return the outcome of whichever completes
/// first. The other task is cancelled through its [`CancelSignal`] and joined
/// before this returns; its outcome is discarded.
pub fn race<A, B, FA, FB>(first: FA, second: FB) -> Race<A, B>
where
    A: Send,
    B: Send,
    FA: FnOnce(&CancelSignal) -> A + Send,
    FB: FnOnce(&CancelSignal) -> B + Send,
{
    let first_cancel = CancelSource::new();
    let second_cancel = CancelSource::new();
    let (done_tx, done_rx) = chan::bounded(2);

    let winner = thread::scope(|scope| {
        let first_signal = first_cancel.signal();
        let second_signal = second_cancel.signal();
        let first_tx = done_tx.clone();
        let second_tx = done_tx;

        scope.spawn(move || {
            let _ = first_tx.send(Race::First(first(&first_signal)));
        });
        scope.spawn(move || {
            let _ = second_tx.send(Race::Second(second(&second_signal)));
        });

        let winner = done_rx.recv().ok();
        match &winner {
            Some(Race::First(_)) => second_cancel.cancel(),
            Some(Race::Second(_)) => first_cancel.cancel(),
            None => {}
        }
        winner
    });

    match winner {
        Some(winner) => winner,
        // Both senders dropped without sending: the tasks panicked and the
        // scope already re-raised that panic.
        None => unreachable!("racing tasks ended without an outcome"),
    }
}
