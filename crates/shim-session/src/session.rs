use std::sync::Arc;

use shim_agent::{AgentClient, Connector, UnixConnector};
use shim_core::state::{SessionEvent, SessionState, SessionStateMachine};
use shim_core::{ExitStatus, ShimConfig, ShimError};
use shim_telemetry::{NoopTracer, SpanContext, Tracer};
use tracing::{error, info, warn, Instrument};

use crate::shutdown::ShutdownSignal;
use crate::signals::SignalForwarder;
use crate::stdio::{LocalStdio, ProxyReport, StdioProxy};
use crate::terminal::{HostTerminal, RawModeGuard, Terminal};

// ---------------------------------------------------------------------------
// Context and collaborators
// ---------------------------------------------------------------------------

/// Observability and cancellation handles, built once by the entry point and
/// handed to the session explicitly.
#[derive(Clone)]
pub struct SessionContext {
    pub tracer: Arc<dyn Tracer>,
    pub shutdown: ShutdownSignal,
    /// Parent for every log line the session emits.
    pub log_span: tracing::Span,
}

impl SessionContext {
    pub fn new(tracer: Arc<dyn Tracer>, shutdown: ShutdownSignal, log_span: tracing::Span) -> Self {
        Self {
            tracer,
            shutdown,
            log_span,
        }
    }

    /// No tracing, fresh shutdown signal, no log span.
    pub fn detached() -> Self {
        Self::new(
            Arc::new(NoopTracer),
            ShutdownSignal::new(),
            tracing::Span::none(),
        )
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("tracing", &self.tracer.is_enabled())
            .field("shutting_down", &self.shutdown.is_shutting_down())
            .finish()
    }
}

/// What the session talks to: the agent, the host terminal and the local
/// descriptors.
pub struct SessionDeps {
    pub connector: Arc<dyn Connector>,
    pub terminal: Arc<dyn Terminal>,
    pub stdio: LocalStdio,
}

impl SessionDeps {
    pub fn host() -> Self {
        Self {
            connector: Arc::new(UnixConnector::new()),
            terminal: Arc::new(HostTerminal::new()),
            stdio: LocalStdio::host(),
        }
    }
}

impl std::fmt::Debug for SessionDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDeps").finish_non_exhaustive()
    }
}

/// Result of a session that reached `Done`.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub status: ExitStatus,
    pub report: ProxyReport,
    pub signals_delivered: usize,
}

// ---------------------------------------------------------------------------
// ShimSession
// ---------------------------------------------------------------------------

/// One shim session for a (container, exec) pair.
///
/// Lifecycle: `Created -> Connecting -> Streaming -> Waiting -> Done`, or
/// `Failed` from any of them. The remote wait is only issued once the stdio
/// join barrier has cleared.
pub struct ShimSession {
    config: ShimConfig,
    ctx: SessionContext,
    machine: SessionStateMachine,
}

impl ShimSession {
    /// Fails with `InvalidConfig` when the agent address, container ID or
    /// exec ID is empty. Nothing is touched in that case.
    pub fn new(config: ShimConfig, ctx: SessionContext) -> Result<Self, ShimError> {
        config.validate()?;
        Ok(Self {
            config,
            ctx,
            machine: SessionStateMachine::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn history(&self) -> &[(SessionState, SessionEvent, SessionState)] {
        self.machine.history()
    }

    /// Run the full lifecycle. `parent` is the root span the phase spans
    /// hang off.
    pub async fn run(
        &mut self,
        deps: SessionDeps,
        parent: Option<&SpanContext>,
    ) -> Result<SessionOutcome, ShimError> {
        let span = self.ctx.log_span.clone();
        let result = self.drive(deps, parent).instrument(span).await;
        if let Err(e) = &result {
            let state = self.machine.state();
            if !state.is_terminal() {
                let _ = self.machine.transition(SessionEvent::Fail);
            }
            error!(error = %e, %state, "session failed");
        }
        result
    }

    async fn drive(
        &mut self,
        deps: SessionDeps,
        parent: Option<&SpanContext>,
    ) -> Result<SessionOutcome, ShimError> {
        let SessionDeps {
            connector,
            terminal,
            stdio,
        } = deps;
        let tracer = Arc::clone(&self.ctx.tracer);
        let shutdown = self.ctx.shutdown.clone();

        self.advance(SessionEvent::Connect)?;

        let mut new_shim = tracer.start_span("new_shim", parent);
        let mut raw_mode = if self.config.terminal {
            let guard = RawModeGuard::acquire(Arc::clone(&terminal))
                .map_err(|e| ShimError::Terminal(e.to_string()))?;
            Some(guard)
        } else {
            None
        };
        let client = connector
            .connect(
                &self.config.agent_address,
                &self.config.container_id,
                &self.config.exec_id,
            )
            .instrument(new_shim.log_span())
            .await
            .map_err(ShimError::Connection)?;
        let streams = client
            .open_io_streams()
            .await
            .map_err(ShimError::Connection)?;
        new_shim.finish();
        self.advance(SessionEvent::Connected)?;

        let mut forwarder = SignalForwarder::new(
            Arc::clone(&client),
            self.config.terminal.then(|| Arc::clone(&terminal)),
            shutdown.clone(),
        );
        forwarder
            .subscribe()
            .and_then(|_| forwarder.start())
            .map_err(|e| ShimError::Internal(e.to_string()))?;

        let mut proxy_span = tracer.start_span("proxy_stdio", parent);
        proxy_span.set_tag("category", "interactive");
        let report = StdioProxy::new(self.config.terminal, shutdown.clone())
            .run(stdio, streams)
            .instrument(proxy_span.log_span())
            .await;
        proxy_span.finish();

        if shutdown.is_shutting_down() {
            return Err(ShimError::Cancelled);
        }
        self.advance(SessionEvent::Drained)?;

        let mut wait_span = tracer.start_span("wait", parent);
        let status = wait_for_exit(client.as_ref(), &self.config, &shutdown)
            .instrument(wait_span.log_span())
            .await;
        wait_span.finish();
        let signals_delivered = forwarder.stop();
        let status = status?;

        if let Some(guard) = raw_mode.as_mut() {
            if let Err(e) = guard.release() {
                warn!(error = %e, "failed to restore terminal");
            }
        }
        self.advance(SessionEvent::Exited)?;
        info!(code = status.code, "remote process exited");

        Ok(SessionOutcome {
            status,
            report,
            signals_delivered,
        })
    }

    fn advance(&mut self, event: SessionEvent) -> Result<SessionState, ShimError> {
        self.machine
            .transition(event)
            .map_err(|e| ShimError::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for ShimSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShimSession")
            .field("container_id", &self.config.container_id)
            .field("exec_id", &self.config.exec_id)
            .field("state", &self.machine.state())
            .finish()
    }
}

async fn wait_for_exit(
    client: &dyn AgentClient,
    config: &ShimConfig,
    shutdown: &ShutdownSignal,
) -> Result<ExitStatus, ShimError> {
    tokio::select! {
        _ = shutdown.cancelled() => Err(ShimError::Cancelled),
        result = client.wait_exit(config.wait_timeout()) => result.map_err(ShimError::from_wait),
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// Run one session end to end and return the process exit code.
///
/// With `proxy_exit_code` the remote code is returned as is, otherwise a
/// completed session always yields 0. Any fatal error yields 1. The tracer
/// is not flushed here; the caller does that once the code is final.
pub async fn run_session(config: ShimConfig, ctx: SessionContext, deps: SessionDeps) -> i32 {
    let proxy_exit_code = config.proxy_exit_code;
    let mut root = ctx.tracer.start_span("root", None);
    let parent = root.context();

    let code = match ShimSession::new(config, ctx.clone()) {
        Ok(mut session) => match session.run(deps, parent.as_ref()).await {
            Ok(outcome) => outcome.status.process_exit_code(proxy_exit_code),
            Err(e) => e.exit_code(),
        },
        Err(e) => {
            ctx.log_span
                .in_scope(|| error!(error = %e, "refusing to start session"));
            e.exit_code()
        }
    };

    root.set_tag("exit_code", code.to_string());
    root.finish();
    code
}
