//! Idle expiry: sign the user out after a period without activity.
//!
//! [`IdleWatch`] is the two-state machine over explicit instants.
//! [`IdleMonitor`] runs one on a background thread fed by activity signals and
//! session events, waking at the deadline.

use crate::session::{SessionEvent, SessionListener, SessionManager};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 15 * 60 * 1000;

pub const EXPIRED_NOTICE: &str = "Session expired due to inactivity.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Disarmed,
    Armed { deadline: Instant },
}

#[derive(Debug)]
pub struct IdleWatch {
    timeout: Duration,
    state: WatchState,
}

impl IdleWatch {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: WatchState::Disarmed,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, WatchState::Armed { .. })
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            WatchState::Armed { deadline } => Some(deadline),
            WatchState::Disarmed => None,
        }
    }

    /// Arm on sign-in; disarm silently on any other sign-out.
    pub fn on_session(&mut self, event: &SessionEvent, now: Instant) {
        self.state = match event {
            SessionEvent::SignedIn(_) => WatchState::Armed {
                deadline: now + self.timeout,
            },
            SessionEvent::SignedOut => WatchState::Disarmed,
        };
    }

    /// Push the deadline out. Ignored while disarmed.
    pub fn activity(&mut self, now: Instant) -> bool {
        match self.state {
            WatchState::Armed { .. } => {
                self.state = WatchState::Armed {
                    deadline: now + self.timeout,
                };
                true
            }
            WatchState::Disarmed => false,
        }
    }

    /// Returns true exactly once when the deadline has passed, disarming.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.state {
            WatchState::Armed { deadline } if now >= deadline => {
                self.state = WatchState::Disarmed;
                true
            }
            _ => false,
        }
    }
}

/// Told when the watch signs the user out.
pub trait ExpiryHandler: Send + Sync {
    /// Show the expiry notice and send the user to the login entry point.
    fn on_expired(&self);
}

enum Signal {
    Activity,
    Session(SessionEvent),
    Shutdown,
}

struct Forwarder {
    tx: Mutex<Sender<Signal>>,
}

impl SessionListener for Forwarder {
    fn on_session_change(&self, event: &SessionEvent) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        // Receiver gone means the monitor has stopped
        let _ = tx.send(Signal::Session(event.clone()));
    }
}

pub struct IdleMonitor {
    tx: Sender<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl IdleMonitor {
    pub fn spawn(
        timeout: Duration,
        session: Arc<SessionManager>,
        handler: Arc<dyn ExpiryHandler>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        session.subscribe(Arc::new(Forwarder {
            tx: Mutex::new(tx.clone()),
        }));
        if let Some(identity) = session.identity() {
            let _ = tx.send(Signal::Session(SessionEvent::SignedIn(identity)));
        }

        let handle = thread::spawn(move || {
            Self::run(IdleWatch::new(timeout), rx, session, handler);
        });

        Self {
            tx,
            handle: Some(handle),
        }
    }

    /// Record a user-activity signal.
    pub fn activity(&self) {
        let _ = self.tx.send(Signal::Activity);
    }

    fn run(
        mut watch: IdleWatch,
        rx: Receiver<Signal>,
        session: Arc<SessionManager>,
        handler: Arc<dyn ExpiryHandler>,
    ) {
        loop {
            let received = match watch.deadline() {
                Some(deadline) => {
                    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(Signal::Activity) => {
                    watch.activity(Instant::now());
                }
                Ok(Signal::Session(event)) => {
                    watch.on_session(&event, Instant::now());
                    debug!(armed = watch.is_armed(), "idle watch updated");
                }
                Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if watch.poll(Instant::now()) {
                info!("idle timeout reached; signing out");
                session.logout();
                handler.on_expired();
            }
        }
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        let _ = self.tx.send(Signal::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
