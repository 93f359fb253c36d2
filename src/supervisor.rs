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

//! Launches the authenticating proxy for a cluster and keeps it honest.
//!
//! One launch attempt spawns the proxy binary, learns the port it bound from
//! its stdout, and waits for that port to accept connections. Attempts whose
//! port never becomes ready are torn down and replaced by a fresh one, with a
//! new API prefix, as long as the [`RetryPolicy`](crate::RetryPolicy) allows.
//! Any other failure ends the launch.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use regex::Regex;
use smol::{
    channel::{self, Receiver, Sender},
    future,
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    Task, Timer,
};
use tracing::{debug, info, warn};

use crate::{
    abort::AbortSignal,
    certificate::CertificateProvider,
    cluster::Cluster,
    config::SupervisorConfig,
    error::{Error, Result},
    line_matcher::{port_from_stream, starting_serve_pattern, MAX_LINE_LEN},
    probe::{PortProber, TcpPortProber},
    process::{
        LaunchRequest, OutputStream, ProcessEvent, ProcessLauncher, ProxyProcess, SmolLauncher,
    },
};

const TLS_HANDSHAKE_NOISE: &str = "http: TLS handshake error";
const PROXY_STARTED: &str = "Authentication proxy started";
const RESTARTING: &str = "Proxy port failed to be used within time limit, restarting...";

/// How long stderr may keep draining once the process has ended.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// How long to wait for an exit status after stdout closed.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Where a launch attempt is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Spawning,
    AwaitingPortDiscovery,
    AwaitingPortReady { port: u16 },
    Ready { port: u16 },
    Stopped,
}

impl ProxyState {
    /// The discovered port, once known and while not stopped.
    pub fn port(&self) -> Option<u16> {
        match *self {
            ProxyState::AwaitingPortReady { port } | ProxyState::Ready { port } => Some(port),
            _ => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    state: ProxyState,
    listeners: Vec<Task<()>>,
}

/// State shared by one attempt's output listeners, its process watcher and
/// the handle.
struct ProxyControl {
    cluster_id: String,
    inner: Mutex<Inner>,
    kill: Sender<()>,
}

impl ProxyControl {
    fn new(cluster_id: &str, kill: Sender<()>) -> Self {
        ProxyControl {
            cluster_id: cluster_id.to_owned(),
            inner: Mutex::new(Inner {
                state: ProxyState::Spawning,
                listeners: Vec::new(),
            }),
            kill,
        }
    }

    fn state(&self) -> ProxyState {
        lock(&self.inner).state
    }

    /// Moves to `next` unless already stopped.
    fn advance(&self, next: ProxyState) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state == ProxyState::Stopped {
            return false;
        }
        debug!(cluster = %self.cluster_id, from = ?inner.state, to = ?next, "proxy state");
        inner.state = next;
        true
    }

    /// Keeps `task` alive until the attempt stops.
    fn listen(&self, task: Task<()>) {
        let mut inner = lock(&self.inner);
        if inner.state != ProxyState::Stopped {
            inner.listeners.push(task);
        }
    }

    /// Cancels the stdout listener and has the watcher kill the process. Returns
    /// false if the attempt was already stopped.
    fn stop(&self) -> bool {
        let listeners = {
            let mut inner = lock(&self.inner);
            if inner.state == ProxyState::Stopped {
                return false;
            }
            inner.state = ProxyState::Stopped;
            std::mem::take(&mut inner.listeners)
        };
        drop(listeners);
        self.kill.close();
        debug!(cluster = %self.cluster_id, "proxy stopped");
        true
    }
}

/// A running proxy whose port accepts connections.
///
/// Dropping the handle stops the proxy.
pub struct ProxyHandle {
    pub port: u16,
    /// `/` followed by 16 hex digits; routes requests to this proxy instance.
    pub api_prefix: String,
    control: Arc<ProxyControl>,
}

impl ProxyHandle {
    pub fn state(&self) -> ProxyState {
        self.control.state()
    }

    /// Stops the proxy. Safe to call more than once, and after the process exited.
    pub fn stop(&self) {
        self.control.stop();
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("port", &self.port)
            .field("api_prefix", &self.api_prefix)
            .field("state", &self.state())
            .finish()
    }
}

enum AttemptEvent {
    PortDiscovered(u16),
    DiscoveryFailed(Error),
    Terminated(ProcessEvent),
}

/// Random path prefix isolating one proxy instance.
pub fn generate_api_prefix() -> String {
    format!("/{:016x}", rand::random::<u64>())
}

pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    prober: Arc<dyn PortProber>,
    certificates: CertificateProvider,
    serve_pattern: Arc<Regex>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn ProcessLauncher>,
        prober: Arc<dyn PortProber>,
    ) -> Result<Self> {
        let serve_pattern = starting_serve_pattern().map_err(|source| Error::Pattern { source })?;
        Ok(Supervisor {
            config,
            launcher,
            prober,
            certificates: CertificateProvider::default(),
            serve_pattern: Arc::new(serve_pattern),
        })
    }

    /// Real child processes, probed over TCP on the configured host.
    pub fn with_defaults(config: SupervisorConfig) -> Result<Self> {
        let prober = TcpPortProber::new(config.probe.host);
        Self::new(config, Arc::new(SmolLauncher), Arc::new(prober))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Starts a proxy for `cluster` and returns once its port is reachable.
    ///
    /// Firing `signal` kills the process of the attempt in flight and fails
    /// the launch with [`Error::Cancelled`].
    pub async fn spawn_kube_auth_proxy(
        &self,
        cluster: &Cluster,
        signal: &AbortSignal,
    ) -> Result<ProxyHandle> {
        if signal.is_aborted() {
            return Err(Error::Cancelled);
        }
        let host = cluster.api_host()?;
        let launch = async {
            let mut attempts = 0;
            loop {
                attempts += 1;
                match self.launch_attempt(cluster, &host, signal, attempts).await {
                    Err(e) if e.is_retryable() => {
                        if !self.config.retry.allows_retry(attempts) {
                            warn!(cluster = %cluster.id, attempts, "giving up on proxy: {}", e);
                            return Err(Error::RetriesExhausted { attempts });
                        }
                        cluster.broadcast_connect_update(RESTARTING, true);
                        if !self.config.retry.backoff.is_zero() {
                            Timer::after(self.config.retry.backoff).await;
                        }
                    }
                    result => return result,
                }
            }
        };
        let cancelled = async {
            signal.aborted().await;
            info!(cluster = %cluster.id, "proxy launch cancelled");
            Err(Error::Cancelled)
        };
        future::or(launch, cancelled).await
    }

    async fn launch_attempt(
        &self,
        cluster: &Cluster,
        host: &str,
        signal: &AbortSignal,
        attempt: u32,
    ) -> Result<ProxyHandle> {
        let api_prefix = generate_api_prefix();
        let certificate = self.certificates.get_certificate(host).await?;

        let mut request = LaunchRequest::new(&self.config.proxy_binary);
        request.args.clone_from(&self.config.proxy_args);
        if let Some(https_proxy) = &self.config.https_proxy {
            request = request.env("HTTPS_PROXY", https_proxy);
        }
        let request = request
            .env("KUBECONFIG", cluster.kube_config_path.to_string_lossy())
            .env("KUBECONFIG_CONTEXT", &cluster.context_name)
            .env("API_PREFIX", &api_prefix)
            .env("PROXY_KEY", &certificate.private)
            .env("PROXY_CERT", &certificate.cert);

        debug!(cluster = %cluster.id, attempt, %api_prefix, "launching proxy");
        let mut process = self.launcher.launch(&request).map_err(|source| {
            let message = format!("failed to spawn {}: {}", request.program.display(), source);
            cluster.broadcast_connect_update(&message, true);
            Error::Spawn {
                path: request.program.clone(),
                source,
            }
        })?;
        let (Some(stdout), Some(stderr)) = (process.take_stdout(), process.take_stderr()) else {
            process.kill();
            return Err(Error::MissingStream);
        };

        let (kill_tx, kill_rx) = channel::bounded(1);
        let (events_tx, events) = channel::unbounded();
        let control = Arc::new(ProxyControl::new(&cluster.id, kill_tx));
        let mut handle = ProxyHandle {
            port: 0,
            api_prefix,
            control: Arc::clone(&control),
        };

        // Terminal events must be watched before anything else can happen.
        let stderr = smol::spawn(forward_stderr(stderr, cluster.clone()));
        smol::spawn(watch_process(
            process,
            stderr,
            kill_rx,
            signal.clone(),
            Arc::clone(&control),
            cluster.clone(),
            events_tx.clone(),
        ))
        .detach();
        control.advance(ProxyState::AwaitingPortDiscovery);
        control.listen(smol::spawn(pump_stdout(
            stdout,
            Arc::clone(&self.serve_pattern),
            Arc::clone(&control),
            cluster.clone(),
            events_tx,
        )));

        let port = match events.recv().await {
            Ok(AttemptEvent::PortDiscovered(port)) => port,
            Ok(AttemptEvent::DiscoveryFailed(e)) => return Err(exit_status_or(&events, e).await),
            Ok(AttemptEvent::Terminated(event)) => return Err(Error::Terminated { event }),
            // The listeners were cancelled from under us.
            Err(_) => return Err(Error::Cancelled),
        };
        info!(cluster = %cluster.id, port, "found proxy port");
        handle.port = port;

        let probe = self.config.probe;
        if let Err(e) = self
            .prober
            .wait_until_port_is_used(port, probe.interval, probe.timeout)
            .await
        {
            warn!(cluster = %cluster.id, port, attempt, "proxy port not ready: {}", e);
            return Err(e);
        }
        control.advance(ProxyState::Ready { port });
        info!(cluster = %cluster.id, port, api_prefix = %handle.api_prefix, "proxy ready");
        Ok(handle)
    }
}

/// Stdout usually closes because the process is exiting. Prefers the exit
/// status, which the watcher only sends once stderr has been reported.
async fn exit_status_or(events: &Receiver<AttemptEvent>, error: Error) -> Error {
    let next = future::or(async { events.recv().await.ok() }, async {
        Timer::after(EXIT_GRACE).await;
        None
    })
    .await;
    match next {
        Some(AttemptEvent::Terminated(event)) => Error::Terminated { event },
        _ => error,
    }
}

/// Reports how the process ended, or kills it once the attempt is stopped or
/// the launch is cancelled.
///
/// The process's last words usually explain an exit, so `stderr` is drained
/// before the exit is reported. A kill cancels it instead.
async fn watch_process(
    mut process: Box<dyn ProxyProcess>,
    stderr: Task<()>,
    kill: Receiver<()>,
    signal: AbortSignal,
    control: Arc<ProxyControl>,
    cluster: Cluster,
    events: Sender<AttemptEvent>,
) {
    let exited = async { Some(process.terminated().await) };
    let killed = async {
        // Nothing is ever sent; the channel closes on stop.
        future::or(async { while kill.recv().await.is_ok() {} }, signal.aborted()).await;
        None
    };
    let ended = future::or(exited, killed).await;
    match ended {
        Some(event) => {
            future::or(stderr, async {
                Timer::after(STDERR_DRAIN_TIMEOUT).await;
            })
            .await;
            if event.is_error() {
                warn!(cluster = %cluster.id, "{}", event);
            } else {
                info!(cluster = %cluster.id, "{}", event);
            }
            cluster.broadcast_connect_update(&event.to_string(), event.is_error());
            let _ = events.try_send(AttemptEvent::Terminated(event));
            control.stop();
        }
        None => {
            debug!(cluster = %cluster.id, "killing proxy");
            drop(stderr);
            process.kill();
            control.stop();
        }
    }
}

async fn forward_stderr(stderr: OutputStream, cluster: Cluster) {
    for_each_line(BufReader::new(stderr), |line| {
        if !line.contains(TLS_HANDSHAKE_NOISE) {
            cluster.broadcast_connect_update(line, true);
        }
    })
    .await;
}

async fn pump_stdout(
    mut stdout: OutputStream,
    pattern: Arc<Regex>,
    control: Arc<ProxyControl>,
    cluster: Cluster,
    events: Sender<AttemptEvent>,
) {
    let found = port_from_stream(&mut stdout, &pattern, |_| {
        cluster.broadcast_connect_update(PROXY_STARTED, false)
    })
    .await;
    let port = match found {
        Ok(port) => port,
        Err(e) => {
            let _ = events.try_send(AttemptEvent::DiscoveryFailed(e));
            return;
        }
    };
    control.advance(ProxyState::AwaitingPortReady { port });
    let _ = events.try_send(AttemptEvent::PortDiscovered(port));

    for_each_line(BufReader::new(stdout), |line| {
        if control.state().port().is_some() {
            cluster.broadcast_connect_update(line, false);
        }
    })
    .await;
}

/// Calls `f` with each non-empty line. Lines longer than [`MAX_LINE_LEN`]
/// are dropped whole.
async fn for_each_line<R, F>(mut reader: R, mut f: F)
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&str),
{
    let mut line = Vec::new();
    let mut overlong = false;
    loop {
        let available = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(available) => available,
            Err(e) => {
                debug!("proxy output: {}", e);
                break;
            }
        };
        let newline = available.iter().position(|&b| b == b'\n');
        let taken = newline.map_or(available.len(), |at| at + 1);
        if !overlong {
            line.extend_from_slice(&available[..taken]);
        }
        reader.consume(taken);
        if line.len() > MAX_LINE_LEN {
            line.clear();
            overlong = true;
        }
        if newline.is_some() {
            if !overlong {
                emit_line(&line, &mut f);
            }
            line.clear();
            overlong = false;
        }
    }
    if !overlong {
        emit_line(&line, &mut f);
    }
}

fn emit_line(line: &[u8], f: &mut impl FnMut(&str)) {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end();
    if !line.is_empty() {
        f(line);
    }
}
