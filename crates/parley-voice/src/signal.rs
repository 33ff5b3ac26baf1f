//! One-shot completion signal for a turn's playback.

use parley_types::PlaybackOutcome;
use std::sync::Arc;
use tokio::sync::watch;

/// Resolves at most once; every waiter sees the same outcome.
#[derive(Clone)]
pub(crate) struct PlaybackSignal {
    tx: Arc<watch::Sender<Option<PlaybackOutcome>>>,
}

impl PlaybackSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Sets the outcome. Returns `false` if it was already set.
    pub(crate) fn resolve(&self, outcome: PlaybackOutcome) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    pub(crate) fn subscribe(&self) -> PlaybackEnd {
        PlaybackEnd {
            rx: self.tx.subscribe(),
        }
    }
}

/// Handle that resolves when a turn's playback has ended.
///
/// Dropping it abandons the wait without affecting playback.
pub struct PlaybackEnd {
    rx: watch::Receiver<Option<PlaybackOutcome>>,
}

impl PlaybackEnd {
    /// A handle that is already resolved.
    pub fn ready(outcome: PlaybackOutcome) -> Self {
        let signal = PlaybackSignal::new();
        signal.resolve(outcome);
        signal.subscribe()
    }

    /// The outcome, if playback has already ended.
    pub fn outcome(&self) -> Option<PlaybackOutcome> {
        *self.rx.borrow()
    }

    pub async fn wait(mut self) -> PlaybackOutcome {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(PlaybackOutcome::Stopped),
            // The pipeline was dropped with the turn still pending.
            Err(_) => PlaybackOutcome::Stopped,
        }
    }
}
