//! # Connection State Machine
//!
//! Both transports drive their connection lifecycle through the same
//! [`ConnectionStateMachine`], so the session sees identical semantics for a
//! broker link and a direct wireless link.
//!
//! ```text
//!                 ┌────────────── retry ──────────────┐
//!                 ▼                                   │
//! Disconnected ──► Connecting ──► Connected ──► Disconnecting ──► Disconnected
//!      ▲              │              │  │
//!      │              ▼              │  └── remote close ──► Disconnected
//!      └───────── Failed(reason) ◄───┘ (link drop)
//! ```
//!
//! Connecting never falls straight back to Disconnected. Cancelling a pending
//! attempt is recorded as `Failed("connection cancelled")` first.
//!
//! Every accepted transition is broadcast exactly once and in order. The
//! current state is also kept in a watch channel for late subscribers.

pub mod completion;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub use completion::{race_connect, Completion, ConnectResolution};

/// Failure reason recorded when a pending attempt is torn down by the caller
pub const CANCELLED_REASON: &str = "connection cancelled";

/// Failure reason recorded when a connect attempt outlives its deadline
pub const TIMEOUT_REASON: &str = "connection timed out";

const TRANSITION_BUFFER: usize = 64;

/// Which of the two transports a state or error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Broker,
    DirectLink,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broker => write!(f, "broker"),
            Self::DirectLink => write!(f, "direct-link"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed(String),
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: &LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed(_))
                | (Connected, Disconnecting)
                | (Connected, Failed(_))
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
                | (Failed(_), Connecting)
                | (Failed(_), Disconnected)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {transport} transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub transport: TransportKind,
    pub from: LinkState,
    pub to: LinkState,
}

/// Observable connection state of one transport instance
#[derive(Debug)]
pub struct ConnectionStateMachine {
    transport: TransportKind,
    state: Mutex<LinkState>,
    current: watch::Sender<LinkState>,
    transitions: broadcast::Sender<LinkState>,
}

impl ConnectionStateMachine {
    pub fn new(transport: TransportKind) -> Self {
        let (current, _) = watch::channel(LinkState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            transport,
            state: Mutex::new(LinkState::Disconnected),
            current,
            transitions,
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn state(&self) -> LinkState {
        self.lock().clone()
    }

    /// Every transition accepted after this call, in order
    pub fn subscribe(&self) -> broadcast::Receiver<LinkState> {
        self.transitions.subscribe()
    }

    /// Latest state, for observers that only care about the present
    pub fn watch(&self) -> watch::Receiver<LinkState> {
        self.current.subscribe()
    }

    pub fn transition(&self, next: LinkState) -> Result<(), InvalidTransition> {
        let mut state = self.lock();
        self.apply(&mut state, next)
    }

    /// Drives the machine to `Connected`, passing through `Connecting` when the
    /// previous attempt had already been marked `Failed`
    ///
    /// Used when a driver reports success after a timeout or a reconnect.
    pub fn reach_connected(&self) -> Result<(), InvalidTransition> {
        let mut state = self.lock();
        if state.is_connected() {
            return Ok(());
        }
        if state.is_failed() {
            self.apply(&mut state, LinkState::Connecting)?;
        }
        self.apply(&mut state, LinkState::Connected)
    }

    /// Walks the legal path from the current state to `Disconnected`
    ///
    /// No-op when already disconnected, so repeated disconnects publish nothing.
    pub fn settle_disconnected(&self) {
        let mut state = self.lock();
        let path = match &*state {
            LinkState::Disconnected => vec![],
            LinkState::Connected => vec![LinkState::Disconnecting, LinkState::Disconnected],
            LinkState::Disconnecting | LinkState::Failed(_) => vec![LinkState::Disconnected],
            LinkState::Connecting => vec![
                LinkState::Failed(CANCELLED_REASON.to_string()),
                LinkState::Disconnected,
            ],
        };

        for step in path {
            if let Err(e) = self.apply(&mut state, step) {
                warn!("Could not settle {} link: {}", self.transport, e);
                return;
            }
        }
    }

    fn apply(&self, state: &mut LinkState, next: LinkState) -> Result<(), InvalidTransition> {
        if !state.can_transition_to(&next) {
            return Err(InvalidTransition {
                transport: self.transport,
                from: state.clone(),
                to: next,
            });
        }

        info!("{} link: {} -> {}", self.transport, state, next);
        *state = next.clone();
        self.current.send_replace(next.clone());
        if self.transitions.send(next).is_err() {
            debug!("No observers for {} link transitions", self.transport);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
