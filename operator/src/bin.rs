use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::Parser;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crddemo_operator::{controller, ControllerConfig};

/// Keeps Mydemo resources and their deployments in sync.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The address of the Kubernetes API server. Overrides any value in kubeconfig.
    #[arg(long, env = "CRDDEMO_MASTER")]
    master: Option<String>,
    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "CRDDEMO_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
    /// Number of resources reconciled in parallel.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    workers: u16,
    /// First retry delay of a failing resource, in milliseconds.
    #[arg(long, default_value_t = 5)]
    backoff_base_ms: u64,
    /// Maximum retry delay, in seconds.
    #[arg(long, default_value_t = 1000)]
    backoff_max_secs: u64,
    /// Watch events buffered ahead of the event handler.
    #[arg(long, default_value_t = 1024)]
    event_buffer: usize,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.into(),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            event_buffer: self.event_buffer,
        }
    }

    async fn client(&self) -> Result<Client> {
        let mut config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
            None => match (Config::infer().await, &self.master) {
                (Ok(config), _) => config,
                (Err(err), Some(master)) => {
                    info!(error = %err, "no cluster configuration found, using --master");
                    master_config(master)?
                }
                (Err(err), None) => return Err(err.into()),
            },
        };
        if let Some(master) = &self.master {
            config.cluster_url = master.parse()?;
        }
        Ok(Client::try_from(config)?)
    }
}

/// Configuration for an unauthenticated connection to `master`.
fn master_config(master: &str) -> Result<Config> {
    Ok(Config::new(master.parse()?))
}

/// Cancel the returned token on the first SIGINT or SIGTERM, exit on the second.
fn shutdown_on_signal() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = termination_signal().await {
            warn!(error = %err, "cannot listen for termination signals");
            return;
        }
        info!("shutting down, waiting for in-flight reconciles");
        trigger.cancel();

        let _ = termination_signal().await;
        warn!("second termination signal, exiting");
        std::process::exit(1);
    });
    shutdown
}

#[cfg(unix)]
async fn termination_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let shutdown = shutdown_on_signal();
    let client = args.client().await?;
    let controller_task = controller::init(client, args.controller_config(), shutdown).await?;

    controller_task.await?;
    info!("operator stopped");
    Ok(())
}
