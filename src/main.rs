//! meshca - cluster-internal certificate authority

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use meshca::{CaServer, Options};
use meshca_common::kube_client::provider_for;
use meshca_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Every TLS config in the process uses aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install the aws-lc-rs crypto provider: {:?}. \
             meshca cannot serve TLS without it.",
            e
        );
        std::process::exit(1);
    }

    let options = Options::parse();

    init_telemetry(TelemetryConfig {
        json: !options.log_text,
        ..Default::default()
    })?;

    options.validate().context("invalid options")?;

    info!(
        namespace = %options.namespace,
        plain_port = options.plain_port,
        secure_port = options.secure_port,
        "Starting meshca"
    );

    let provider = provider_for(options.kubeconfig.clone());
    let mut server = CaServer::new(options);
    server
        .init(provider.as_ref())
        .await
        .context("failed to initialize CA")?;

    let handles = server.start().await.context("failed to start listeners")?;
    info!(
        plain = %handles.plain_addr,
        secure = %handles.secure_addr,
        "meshca serving"
    );

    let serving = handles.wait();
    tokio::pin!(serving);

    let finished = tokio::select! {
        result = &mut serving => Some(result),
        _ = shutdown_signal() => None,
    };

    match finished {
        Some(result) => {
            server.stop().await;
            if let Err(e) = &result {
                error!(error = %e, "Listener failed");
            }
            result.context("listener failed")?;
        }
        None => {
            info!("Shutdown signal received");
            server.stop().await;
            serving.await.context("listener failed during shutdown")?;
        }
    }

    info!("meshca stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
