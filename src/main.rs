// Copyright 2025 Stairwell, Inc.
// Author: mrdomino@stairwell.com
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
//
use std::{
    ffi::OsString,
    io::{self, BufRead},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use kube_auth_supervisor::{
    config::{bundled_proxy_binary, PROXY_BINARY_NAME},
    AbortController, Cluster, LogUpdates, RetryPolicy, Supervisor, SupervisorConfig,
};
use smol::future;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Kubernetes API server URL of the cluster
    #[arg(long)]
    api_url: String,

    /// Kubeconfig file handed to the proxy
    #[arg(env = "KUBECONFIG", long = "kubeconfig")]
    kube_config: PathBuf,

    /// Kubeconfig context to authenticate with
    #[arg(long)]
    context: String,

    /// Identifier used when reporting on this cluster
    #[arg(default_value_t = String::from("default"), long)]
    cluster_id: String,

    /// Proxy binary to run; takes precedence over --binaries-dir
    #[arg(env = "KUBE_AUTH_PROXY", long)]
    proxy_binary: Option<PathBuf>,

    /// Extra argument for the proxy binary; may be repeated
    #[arg(long = "proxy-arg")]
    proxy_args: Vec<OsString>,

    /// Directory holding per-architecture proxy binaries
    #[arg(long)]
    binaries_dir: Option<PathBuf>,

    /// HTTPS proxy for the authenticating proxy to use
    #[arg(env = "HTTPS_PROXY", long)]
    https_proxy: Option<String>,

    /// Interval between port readiness checks, in milliseconds
    #[arg(default_value_t = 500, long)]
    probe_interval_ms: u64,

    /// Time allowed for the proxy port to accept connections, in milliseconds
    #[arg(default_value_t = 10_000, long)]
    probe_timeout_ms: u64,

    /// Give up after this many launches; unlimited when omitted
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Pause between launches, in milliseconds
    #[arg(default_value_t = 0, long)]
    retry_backoff_ms: u64,
}

impl Args {
    fn config(&self) -> SupervisorConfig {
        let proxy_binary = match (&self.proxy_binary, &self.binaries_dir) {
            (Some(path), _) => path.clone(),
            (None, Some(dir)) => bundled_proxy_binary(dir),
            (None, None) => PathBuf::from(PROXY_BINARY_NAME),
        };
        let mut config = SupervisorConfig::new(proxy_binary);
        config.proxy_args.clone_from(&self.proxy_args);
        config.https_proxy = self.https_proxy.clone();
        config.probe.interval = Duration::from_millis(self.probe_interval_ms);
        config.probe.timeout = Duration::from_millis(self.probe_timeout_ms);
        config.retry = RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        };
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = args.config();
    let supervisor = Supervisor::with_defaults(config)?;
    let cluster = Cluster::new(
        &args.cluster_id,
        &args.api_url,
        &args.kube_config,
        &args.context,
        Arc::new(LogUpdates),
    );

    smol::block_on(async {
        let controller = AbortController::new();
        let signal = controller.signal();
        let mut stdin = smol::unblock(read_stdin_line);
        let launch = supervisor.spawn_kube_auth_proxy(&cluster, &signal);
        // Closing stdin gives up on a launch that is still in progress.
        let stdin_closed = async {
            (&mut stdin).await;
            controller.abort();
            future::pending().await
        };
        let proxy = future::or(launch, stdin_closed)
            .await
            .with_context(|| format!("failed to start proxy for {}", cluster.id))?;

        println!(
            "Proxying {} on 127.0.0.1:{}{}",
            cluster.api_url, proxy.port, proxy.api_prefix
        );
        println!("Press Enter or close stdin to stop.");
        // An abort that lost the race to a finished launch already consumed stdin.
        if !signal.is_aborted() {
            stdin.await;
        }
        proxy.stop();
        Ok::<_, anyhow::Error>(())
    })
}

/// Blocks until a line is entered or stdin closes.
fn read_stdin_line() {
    let mut line = String::new();
    if let Err(e) = io::stdin().lock().read_line(&mut line) {
        debug!("stdin: {}", e);
    }
}
