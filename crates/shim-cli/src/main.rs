//! sandbox-shim -- one process per container or exec, relaying stdio,
//! signals and the exit status between the host runtime and the sandbox
//! agent.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use shim_core::{EXIT_FAILURE, SHIM_NAME};
use shim_session::{run_session, SessionContext, SessionDeps, ShutdownSignal};
use shim_telemetry::logging::{announce, init_logging, log_context, LogSettings};
use shim_telemetry::create_tracer;
use tokio::runtime::Runtime;
use tracing::{debug, error};

mod cli;

use cli::Cli;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    let cli = Cli::parse();
    if cli.version {
        println!("{SHIM_NAME} version {VERSION}");
        return;
    }

    let code = match run(cli) {
        Ok(code) => code,
        // Only startup fails here, before stdio is handed to the session.
        Err(e) => {
            error!(error = %format!("{e:#}"), "shim failed to start");
            eprintln!("{SHIM_NAME}: {e:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = cli.into_config().context("failed to load configuration")?;
    init_logging(&LogSettings::from_config(&config)).context("failed to initialise logging")?;
    install_panic_hook();

    let runtime = build_runtime(config.effective_max_threads())?;
    let tracer = create_tracer(SHIM_NAME, config.trace);
    let log_span = log_context(&config);
    log_span.in_scope(|| announce(&config, VERSION));

    let ctx = SessionContext::new(Arc::clone(&tracer), ShutdownSignal::new(), log_span);
    let code = runtime.block_on(async move {
        // A panic inside the session unwinds its task (restoring the
        // terminal on the way) and surfaces here as a JoinError.
        match tokio::spawn(run_session(config, ctx, SessionDeps::host())).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "session task aborted");
                EXIT_FAILURE
            }
        }
    });

    let flushed = tracer.flush();
    debug!(code, flushed, "shim exiting");
    // Do not wait for a stdin reader still parked on the blocking pool.
    runtime.shutdown_background();
    Ok(code)
}

/// Multi-thread runtime capped at `max_threads`. One shim runs per
/// container, so the cap matters more on dense hosts than raw parallelism:
/// each idle worker costs a stack and a scheduler slot, while the session
/// itself never runs more than a handful of tasks at once.
fn build_runtime(max_threads: usize) -> Result<Runtime> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let workers = max_threads.min(cores).max(1);
    debug!(workers, max_threads, "building runtime");
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .max_blocking_threads(max_threads.max(1))
        .thread_name("shim-worker")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

/// Replaces the default hook, which would write to the container's stderr.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        error!(panic = %info, "shim panicked");
    }));
}
