// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! iam-authenticator - Kubernetes webhook authentication with AWS IAM
//!
//! Serves the TokenReview webhook and, when the `IAMIdentityMappingCRD`
//! feature gate is on, reconciles `IAMIdentityMapping` resources.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iam_authenticator::bootstrap::{Bootstrap, Mode};
use iam_authenticator::config::AuthenticatorConfig;
use iam_authenticator::feature::{FeatureGate, MemoryFeatureGate};
use iam_authenticator::token::StsVerifier;

/// AWS IAM Authenticator server
///
/// Answers Kubernetes TokenReview requests by verifying presigned STS
/// GetCallerIdentity tokens and mapping the caller's IAM identity to a
/// Kubernetes user and groups.
#[derive(Parser, Debug)]
#[command(name = "iam-authenticator")]
#[command(author = "Kubernetes Authors")]
#[command(version)]
#[command(about = "AWS IAM Authenticator server", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// The address the webhook listens on
    #[arg(long)]
    address: Option<String>,

    /// The port the webhook listens on
    #[arg(long)]
    port: Option<u16>,

    /// Cluster ID that tokens must be minted for
    #[arg(short = 'i', long)]
    cluster_id: Option<String>,

    /// The address of the Kubernetes API server. Overrides the kubeconfig.
    #[arg(long)]
    master: Option<String>,

    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Feature gates to enable/disable
    ///
    /// Format: "IAMIdentityMappingCRD=true"
    #[arg(long)]
    feature_gates: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    // kube and reqwest both link rustls; pick one provider for the process.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let feature_gates = args.feature_gates.clone();
    let config = load_config(args).await?;
    anyhow::ensure!(
        !config.cluster_id.is_empty(),
        "cluster ID cannot be empty, set --cluster-id or clusterId in the config file"
    );

    let mut gate = MemoryFeatureGate::with_defaults()
        .with_overrides(&config.feature_gates)
        .context("invalid feature gates in config file")?;
    if let Some(s) = feature_gates {
        gate = gate
            .with_override_string(&s)
            .context("invalid --feature-gates")?;
    }
    let mode = Mode::from_feature_gate(&gate);

    info!(
        %mode,
        cluster_id = %config.cluster_id,
        addr = %config.server.bind_addr(),
        features = ?gate.all_features(),
        "configuration loaded"
    );

    let verifier = StsVerifier::new(config.cluster_id.clone()).context("failed to create STS client")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    if let Err(e) = Bootstrap::new(config, mode, Arc::new(verifier))
        .run(shutdown)
        .await
    {
        error!(error = %e, "iam-authenticator failed");
        return Err(e.into());
    }

    info!("iam-authenticator exited successfully");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid log level: {level}"))?,
        )
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
    Ok(())
}

/// Loads the configuration from file and applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<AuthenticatorConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<AuthenticatorConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        AuthenticatorConfig::default()
    };

    if let Some(address) = args.address {
        config.server.address = address;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(cluster_id) = args.cluster_id {
        config.cluster_id = cluster_id;
    }
    if let Some(master) = args.master {
        config.connection.master = Some(master);
    }
    if let Some(kubeconfig) = args.kubeconfig {
        config.connection.kubeconfig = Some(kubeconfig);
    }

    Ok(config)
}

/// Cancels `shutdown` on the first SIGINT or SIGTERM and exits the process
/// on the second.
fn spawn_signal_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut signals = Signals::new()?;
    tokio::spawn(async move {
        let name = signals.recv().await;
        info!(signal = name, "received signal, shutting down");
        shutdown.cancel();

        let name = signals.recv().await;
        warn!(signal = name, "received second signal, exiting immediately");
        std::process::exit(1);
    });
    Ok(())
}

#[cfg(unix)]
struct Signals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> anyhow::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigterm: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
            sigint: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> anyhow::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}
