//! Single-resolution completion and the connect-with-timeout race built on it
//!
//! ```text
//!  timer task ──────── TimedOut ─────────┐
//!                                        ▼
//!                               Completion (resolved once) ──► caller
//!                                        ▲
//!  transition watcher ── Connected/Failed┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use super::LinkState;

/// One-shot slot that accepts exactly one value
///
/// Any number of producers may race to resolve it. The first wins, later
/// attempts are rejected by the `resolved` flag and report `false`.
#[derive(Debug)]
pub struct Completion<T> {
    resolved: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Completion<T> {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let completion = Arc::new(Self {
            resolved: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
        });
        (completion, rx)
    }

    /// Returns `true` if this call delivered the value
    pub fn resolve(&self, value: T) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                if tx.send(value).is_err() {
                    debug!("Completion resolved after the waiter went away");
                }
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }
}

/// Outcome of one connect attempt as seen by its caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectResolution {
    Connected,
    Failed(String),
    TimedOut,
}

/// Races the next terminal transition on `transitions` against `timeout`
///
/// `transitions` must be subscribed after the attempt entered `Connecting`,
/// otherwise a terminal state of an older attempt could win the race.
pub async fn race_connect(
    mut transitions: broadcast::Receiver<LinkState>,
    timeout: Duration,
) -> ConnectResolution {
    let (completion, outcome) = Completion::new();

    let timer = {
        let completion = completion.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            completion.resolve(ConnectResolution::TimedOut);
        })
    };

    let watcher = {
        let completion = completion.clone();
        tokio::spawn(async move {
            loop {
                match transitions.recv().await {
                    Ok(LinkState::Connected) => {
                        completion.resolve(ConnectResolution::Connected);
                        break;
                    }
                    Ok(LinkState::Failed(reason)) => {
                        completion.resolve(ConnectResolution::Failed(reason));
                        break;
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Connect watcher lagged behind by {} transitions", skipped);
                    }
                    Err(RecvError::Closed) => {
                        completion.resolve(ConnectResolution::Failed(
                            "state channel closed".to_string(),
                        ));
                        break;
                    }
                }
            }
        })
    };

    let resolution = outcome
        .await
        .unwrap_or_else(|_| ConnectResolution::Failed("connect attempt abandoned".to_string()));

    timer.abort();
    watcher.abort();
    resolution
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_resolution_counts() {
        let (completion, mut rx) = Completion::new();
        assert!(!completion.is_resolved());

        assert!(completion.resolve(1));
        assert!(!completion.resolve(2));
        assert!(completion.is_resolved());
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_times_out_without_transition() {
        let (tx, _) = broadcast::channel::<LinkState>(8);
        let rx = tx.subscribe();

        let started = tokio::time::Instant::now();
        let resolution = race_connect(rx, Duration::from_secs(10)).await;

        assert_eq!(resolution, ConnectResolution::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_resolves_on_terminal_transition() {
        let (tx, _) = broadcast::channel::<LinkState>(8);
        let rx = tx.subscribe();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = tx.send(LinkState::Connecting);
            let _ = tx.send(LinkState::Failed("refused".into()));
        });

        let resolution = race_connect(rx, Duration::from_secs(10)).await;
        assert_eq!(resolution, ConnectResolution::Failed("refused".into()));
    }
}
