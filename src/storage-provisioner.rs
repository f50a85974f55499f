use std::sync::Arc;

use anyhow::Context;
use hostpath_provisioner::api::KubeApi;
use hostpath_provisioner::config::Config;
use hostpath_provisioner::signal::stop_channel;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize the logger
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let config = match Config::new_from_flags(env!("CARGO_PKG_VERSION")) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    // Read the environment. Note that this tries a KubeConfig file first, then
    // falls back on an in-cluster configuration.
    let client = match kube::Client::try_default()
        .await
        .context("unable to load Kubernetes client configuration")
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Unable to start");
            std::process::exit(2);
        }
    };
    let api = KubeApi::new(
        client,
        config.lock_namespace.clone(),
        config.lock_name.clone(),
        config.retry_period,
    );

    let (trigger, stop) = stop_channel();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                warn!("Caught shutdown signal, stopping");
                trigger.stop();
            }
            Err(e) => {
                error!(error = %e, "Unable to listen for shutdown signals");
                // Hold on to the trigger, since dropping it stops the provisioner
                let _trigger = trigger;
                std::future::pending::<()>().await
            }
        }
    });

    if let Err(e) = hostpath_provisioner::run(config, Arc::new(api), stop).await {
        error!(error = %format!("{:#}", e), "Provisioner failed");
        std::process::exit(e.exit_code());
    }
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
