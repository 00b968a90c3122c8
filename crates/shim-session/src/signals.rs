use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nix::sys::signal::Signal;
use shim_agent::AgentClient;
use shim_core::SignalEvent;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::shutdown::ShutdownSignal;
use crate::terminal::Terminal;

/// Capacity of the queue between the signal listeners and the delivery task.
pub const SIGNAL_QUEUE: usize = 2048;

/// Relayed to the remote process.
pub const FORWARDED_SIGNALS: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGALRM,
    Signal::SIGCONT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGURG,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
    Signal::SIGIO,
    Signal::SIGPWR,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGWINCH,
];

/// Shut the shim down instead of being relayed.
pub const FATAL_SIGNALS: &[Signal] = &[
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGQUIT,
    Signal::SIGSYS,
    Signal::SIGTRAP,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Forward,
    Fatal,
    /// Not subscribed: SIGCHLD and SIGPIPE concern only the shim itself, and
    /// the rest cannot be caught.
    Ignore,
}

pub fn classify(signal: Signal) -> SignalAction {
    if FORWARDED_SIGNALS.contains(&signal) {
        SignalAction::Forward
    } else if FATAL_SIGNALS.contains(&signal) {
        SignalAction::Fatal
    } else {
        SignalAction::Ignore
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Idle,
    Subscribed,
    Forwarding,
    Stopped,
}

impl fmt::Display for ForwarderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ForwarderState::Idle => "Idle",
            ForwarderState::Subscribed => "Subscribed",
            ForwarderState::Forwarding => "Forwarding",
            ForwarderState::Stopped => "Stopped",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("cannot {op} signal forwarder in state {state}")]
    InvalidState {
        state: ForwarderState,
        op: &'static str,
    },
}

// ---------------------------------------------------------------------------
// SignalSender
// ---------------------------------------------------------------------------

/// Producer side of the signal queue. Never blocks: events arriving while
/// the queue is full are dropped.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: flume::Sender<SignalEvent>,
}

impl SignalSender {
    /// Queue an event. Returns `false` if it was dropped.
    pub fn send(&self, event: SignalEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(event)) => {
                warn!(%event, "signal queue full, dropping event");
                false
            }
            Err(flume::TrySendError::Disconnected(event)) => {
                debug!(%event, "signal forwarder stopped, dropping event");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SignalForwarder
// ---------------------------------------------------------------------------

/// Relays host signals and resize events to the remote process.
///
/// `subscribe` installs one listener per host signal; each listener turns
/// what it receives into a [`SignalEvent`] on a bounded queue. `start`
/// spawns the single task that drains the queue into
/// [`AgentClient::send_signal`]. Delivery failures are logged at debug and
/// otherwise ignored. `stop` cancels everything without waiting for
/// in-flight deliveries.
pub struct SignalForwarder {
    state: ForwarderState,
    client: Arc<dyn AgentClient>,
    terminal: Option<Arc<dyn Terminal>>,
    shutdown: ShutdownSignal,
    tx: flume::Sender<SignalEvent>,
    rx: flume::Receiver<SignalEvent>,
    listeners: Vec<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
    delivered: Arc<AtomicUsize>,
}

impl SignalForwarder {
    /// `terminal` is set when a pseudo-terminal is in use; only then are
    /// window changes turned into resize events.
    pub fn new(
        client: Arc<dyn AgentClient>,
        terminal: Option<Arc<dyn Terminal>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self::with_capacity(client, terminal, shutdown, SIGNAL_QUEUE)
    }

    pub fn with_capacity(
        client: Arc<dyn AgentClient>,
        terminal: Option<Arc<dyn Terminal>>,
        shutdown: ShutdownSignal,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self {
            state: ForwarderState::Idle,
            client,
            terminal,
            shutdown,
            tx,
            rx,
            listeners: Vec::new(),
            delivery: None,
            delivered: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn state(&self) -> ForwarderState {
        self.state
    }

    pub fn sender(&self) -> SignalSender {
        SignalSender {
            tx: self.tx.clone(),
        }
    }

    /// Events handed to the agent successfully so far.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Install host signal listeners. Returns how many were installed; a
    /// signal the runtime refuses is logged and skipped.
    pub fn subscribe(&mut self) -> Result<usize, ForwarderError> {
        self.expect_state(ForwarderState::Idle, "subscribe")?;
        for &sig in FORWARDED_SIGNALS.iter().chain(FATAL_SIGNALS) {
            let mut stream = match signal(SignalKind::from_raw(sig as i32)) {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(signal = sig.as_str(), error = %e, "cannot subscribe to signal");
                    continue;
                }
            };
            let action = classify(sig);
            let sender = self.sender();
            let terminal = self.terminal.clone();
            let shutdown = self.shutdown.clone();
            self.listeners.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        received = stream.recv() => {
                            if received.is_none() {
                                break;
                            }
                        }
                    }
                    if action == SignalAction::Fatal {
                        error!(signal = sig.as_str(), "fatal signal received");
                        shutdown.trigger(sig.as_str());
                        break;
                    }
                    if let Some(event) = translate(sig, terminal.as_deref()) {
                        sender.send(event);
                    }
                }
            }));
        }
        self.state = ForwarderState::Subscribed;
        debug!(listeners = self.listeners.len(), "signal listeners installed");
        Ok(self.listeners.len())
    }

    /// Spawn the delivery task. With a terminal the current window size is
    /// queued first so the remote starts with the right geometry.
    pub fn start(&mut self) -> Result<(), ForwarderError> {
        self.expect_state(ForwarderState::Subscribed, "start")?;
        if let Some(size) = self.terminal.as_ref().and_then(|t| t.window_size()) {
            self.sender().send(SignalEvent::resize(size));
        }
        self.delivery = Some(tokio::spawn(deliver(
            Arc::clone(&self.client),
            self.rx.clone(),
            Arc::clone(&self.delivered),
        )));
        self.state = ForwarderState::Forwarding;
        Ok(())
    }

    /// Cancel the listeners and the delivery task. Events still queued or in
    /// flight are abandoned. Stopping twice is a no-op.
    pub fn stop(&mut self) -> usize {
        if self.state == ForwarderState::Stopped {
            return self.delivered();
        }
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        if let Some(delivery) = self.delivery.take() {
            delivery.abort();
        }
        self.state = ForwarderState::Stopped;
        let delivered = self.delivered();
        debug!(delivered, pending = self.rx.len(), "signal forwarding stopped");
        delivered
    }

    fn expect_state(&self, want: ForwarderState, op: &'static str) -> Result<(), ForwarderError> {
        if self.state == want {
            Ok(())
        } else {
            Err(ForwarderError::InvalidState {
                state: self.state,
                op,
            })
        }
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SignalForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalForwarder")
            .field("state", &self.state)
            .field("listeners", &self.listeners.len())
            .field("delivered", &self.delivered())
            .finish()
    }
}

/// Map a received host signal to the event sent to the agent. A window
/// change with a terminal becomes a resize, skipped when the size is
/// unknown.
fn translate(sig: Signal, terminal: Option<&dyn Terminal>) -> Option<SignalEvent> {
    match (sig, terminal) {
        (Signal::SIGWINCH, Some(terminal)) => match terminal.window_size() {
            Some(size) => Some(SignalEvent::resize(size)),
            None => {
                debug!("window size unavailable, skipping resize");
                None
            }
        },
        _ => Some(SignalEvent::signal(sig as i32)),
    }
}

async fn deliver(
    client: Arc<dyn AgentClient>,
    rx: flume::Receiver<SignalEvent>,
    delivered: Arc<AtomicUsize>,
) {
    while let Ok(event) = rx.recv_async().await {
        match client.send_signal(event).await {
            Ok(()) => {
                delivered.fetch_add(1, Ordering::Relaxed);
                debug!(%event, "signal forwarded");
            }
            Err(e) => debug!(%event, error = %e, "signal delivery failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
