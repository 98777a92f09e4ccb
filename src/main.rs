mod config;
mod dispatcher;
mod execution;
mod limiter;
mod program;
mod result;
mod runtime;
mod server;

use std::panic;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::dispatcher::{DispatchSettings, Dispatcher};
use crate::execution::{CancelSource, ExecutionEnv};
use crate::runtime::RuntimeRegistry;
use crate::server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("evalrunner=info".parse()?))
        .init();
    set_panic_hook();

    let config = Config::parse();
    config.validate()?;

    let registry = match &config.runtimes_config {
        Some(path) => RuntimeRegistry::from_path(path)
            .with_context(|| format!("Failed to load runtime table {}", path.display()))?,
        None => RuntimeRegistry::builtin().context("Failed to load built-in runtime table")?,
    };
    info!("Supported runtimes: {}", registry.supported().join(", "));

    let env = ExecutionEnv::new(registry)
        .with_max_memory_bytes(config.max_memory_bytes())
        .with_kill_grace(config.kill_grace())
        .with_max_output_bytes(config.max_output_bytes);
    let dispatcher = Dispatcher::new(
        env,
        DispatchSettings {
            max_concurrent: config.max_concurrent_evaluations,
            max_timeout_secs: config.max_timeout_secs,
            scope: config.concurrency_scope,
        },
    );
    info!(
        "Admission: max_concurrent={}, scope={:?}, max_timeout_secs={}, max_memory_mb={}",
        config.max_concurrent_evaluations,
        config.concurrency_scope,
        config.max_timeout_secs,
        config.max_memory_mb
    );

    // Dropping this cancels every batch, so it lives until shutdown
    let root = CancelSource::new();
    let state = Arc::new(AppState {
        dispatcher,
        shutdown: root.token(),
        max_batch_size: config.max_batch_size,
    });

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Starting HTTP server on {}", addr);

    let shutdown_timeout = config.shutdown_timeout();
    let shutdown = async move {
        shutdown_signal().await;
        info!(
            "Shutting down HTTP server, in-flight batches have {:?}",
            shutdown_timeout
        );
        tokio::spawn(async move {
            tokio::time::sleep(shutdown_timeout).await;
            warn!("Shutdown timeout elapsed, canceling in-flight programs");
            root.cancel();
        });
    };

    server::serve(listener, state, shutdown)
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        error!(message = "panic occurred", panic = %panic_info);
    }));
}
