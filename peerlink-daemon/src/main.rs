// PeerLink daemon: tcp transport, on-disk blob store and the transport control reactor.

mod config;
mod node;
mod reactor;
mod resolver;
mod store;
mod tcp;

use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("peerlink-daemon {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load()?;
    info!("peerlink-daemon {} starting as {}", VERSION, cfg.local_id);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let node = node::start(&cfg, |_, _| {})?;
        info!("listening on {}", node.listen_addr);
        shutdown_signal().await?;
        info!("shutdown requested, draining");
        node.handle.shutdown();
        node.task.await??;
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
