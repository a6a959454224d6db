use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use dockhand::config::{PortPolicy, RunnerConfig, ShimConfig};
use dockhand::engine::DockerEngine;
use dockhand::error::Error;
use dockhand::resources::gpu::GpuLock;
use dockhand::resources::ports::PortAllocator;
use dockhand::runner::history::{History, HistoryWriter, spawn_recorder};
use dockhand::runner::runner::Runner;
use dockhand::shim::shim::Shim;
use dockhand::{runner, shim};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let role = std::env::args().nth(1).unwrap_or_else(|| "shim".to_string());
    match role.as_str() {
        "shim" => run_shim().await?,
        "runner" => run_runner().await?,
        other => {
            return Err(Box::new(Error::BadRequest(format!(
                "unknown role {other:?}, expected \"shim\" or \"runner\""
            ))) as Box<dyn std::error::Error>);
        }
    }
    Ok(())
}

async fn run_shim() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ShimConfig::from_env()?;
    let gpus = GpuLock::new(&config.gpus)?;
    let ports = match config.port_policy {
        PortPolicy::Range => PortAllocator::range(config.port_range_start, config.port_range_end)?,
        PortPolicy::Ephemeral => PortAllocator::ephemeral(),
    };
    let engine = DockerEngine::new()?;
    let shim = Arc::new(Shim::new(gpus, ports, engine, config.stop_grace_secs));

    let server = {
        let shim = Arc::clone(&shim);
        let listen = config.listen.clone();
        tokio::spawn(async move { shim::api::serve(shim, &listen).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.abort();
    shim.shutdown().await;
    Ok(())
}

async fn run_runner() -> Result<(), Box<dyn std::error::Error>> {
    let history = Arc::new(Mutex::new(History::new()));
    let (recorder, _recorder_handle) = spawn_recorder(history.clone());

    // The runner's own diagnostics ride the pull protocol too.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(HistoryWriter::new(recorder.clone()).and(std::io::stderr))
        .init();

    let config = RunnerConfig::from_env()?;
    let runner = Arc::new(Runner::new(config, history, recorder));

    let external = CancellationToken::new();
    {
        let external = external.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                external.cancel();
            }
        });
    }

    let server = {
        let runner = Arc::clone(&runner);
        let listen = runner.config.listen.clone();
        tokio::spawn(async move { runner::api::serve(runner, &listen).await })
    };

    // Blocks until the job has run and every buffered byte is drained.
    runner.supervise(external).await?;
    server.abort();
    Ok(())
}
