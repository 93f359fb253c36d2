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

//! Scripted stand-ins for proxy processes, the prober and the update sink.

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use smol::{
    channel::{self, Receiver, Sender},
    future,
    io::AsyncRead,
    stream::Stream,
    Timer,
};

use crate::{
    cluster::ConnectUpdates,
    error::{Error, Result},
    probe::PortProber,
    process::{LaunchRequest, OutputStream, ProcessEvent, ProcessLauncher, ProxyProcess, Termination},
};

/// Polls `condition` for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        Timer::after(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Hands out one chunk per read.
pub struct ChunkedReader {
    chunks: VecDeque<Vec<u8>>,
}

impl ChunkedReader {
    pub fn new<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Self {
        ChunkedReader {
            chunks: chunks
                .into_iter()
                .filter(|chunk| !chunk.is_empty())
                .map(<[u8]>::to_vec)
                .collect(),
        }
    }
}

impl AsyncRead for ChunkedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let Some(chunk) = self.chunks.front_mut() else {
            return Poll::Ready(Ok(0));
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.chunks.pop_front();
        }
        Poll::Ready(Ok(n))
    }
}

/// Reads whatever is sent on a channel; ends once the channel closes.
pub struct ChannelReader {
    rx: Pin<Box<Receiver<Vec<u8>>>>,
    pending: Vec<u8>,
}

impl ChannelReader {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        ChannelReader {
            rx: Box::pin(rx),
            pending: Vec::new(),
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        while self.pending.is_empty() {
            match self.rx.as_mut().poll_next(cx) {
                Poll::Ready(Some(chunk)) => self.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Poll::Ready(Ok(n))
    }
}

/// Records every connection update.
#[derive(Default)]
pub struct RecordingUpdates {
    updates: Mutex<Vec<(String, String, bool)>>,
}

impl RecordingUpdates {
    pub fn messages(&self) -> Vec<(String, bool)> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message, is_error)| (message.clone(), *is_error))
            .collect()
    }

    pub fn clusters(&self) -> Vec<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|(cluster, _, _)| cluster.clone())
            .collect()
    }

    pub fn count(&self, message: &str, is_error: bool) -> usize {
        self.messages()
            .iter()
            .filter(|(m, e)| m == message && *e == is_error)
            .count()
    }

    pub fn contains(&self, message: &str, is_error: bool) -> bool {
        self.count(message, is_error) > 0
    }
}

impl ConnectUpdates for RecordingUpdates {
    fn broadcast_connect_update(&self, cluster_id: &str, message: &str, is_error: bool) {
        self.updates
            .lock()
            .unwrap()
            .push((cluster_id.to_owned(), message.to_owned(), is_error));
    }
}

/// Test-side controls of one fake proxy process.
pub struct FakeProcessControl {
    stdout: Sender<Vec<u8>>,
    stderr: Sender<Vec<u8>>,
    events: Sender<ProcessEvent>,
    kills: Arc<AtomicUsize>,
    killed: Receiver<()>,
}

impl FakeProcessControl {
    pub fn write_stdout(&self, text: &str) {
        self.stdout.try_send(text.as_bytes().to_vec()).unwrap();
    }

    pub fn write_stderr(&self, text: &str) {
        self.stderr.try_send(text.as_bytes().to_vec()).unwrap();
    }

    pub fn close_stdout(&self) {
        self.stdout.close();
    }

    /// Ends the process. Its stderr closes along with it.
    pub fn emit(&self, event: ProcessEvent) {
        self.stderr.close();
        self.events.try_send(event).unwrap();
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub async fn wait_killed(&self) {
        let killed = future::or(async { self.killed.recv().await.is_ok() }, async {
            Timer::after(Duration::from_secs(2)).await;
            false
        })
        .await;
        assert!(killed, "process was not killed");
    }
}

struct FakeProcess {
    stdout: Option<ChannelReader>,
    stderr: Option<ChannelReader>,
    events: Receiver<ProcessEvent>,
    kills: Arc<AtomicUsize>,
    killed: Sender<()>,
}

impl ProxyProcess for FakeProcess {
    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout
            .take()
            .map(|stdout| Box::pin(stdout) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr
            .take()
            .map(|stderr| Box::pin(stderr) as OutputStream)
    }

    fn terminated(&mut self) -> Termination<'_> {
        Box::pin(async move {
            self.events
                .recv()
                .await
                .unwrap_or(ProcessEvent::Exit(None))
        })
    }

    fn kill(&mut self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        let _ = self.killed.try_send(());
    }
}

/// Launches fake processes whose stdout starts with a fixed script.
pub struct FakeLauncher {
    stdout_script: Vec<String>,
    fail_spawn: bool,
    requests: Mutex<Vec<LaunchRequest>>,
    processes: Mutex<Vec<Arc<FakeProcessControl>>>,
    launched_tx: Sender<Arc<FakeProcessControl>>,
    launched_rx: Receiver<Arc<FakeProcessControl>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::with_stdout(&[])
    }
}

impl FakeLauncher {
    pub fn with_stdout(script: &[&str]) -> Self {
        let (launched_tx, launched_rx) = channel::unbounded();
        FakeLauncher {
            stdout_script: script.iter().map(|chunk| chunk.to_string()).collect(),
            fail_spawn: false,
            requests: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
            launched_tx,
            launched_rx,
        }
    }

    pub fn failing() -> Self {
        FakeLauncher {
            fail_spawn: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn process(&self, index: usize) -> Arc<FakeProcessControl> {
        Arc::clone(&self.processes.lock().unwrap()[index])
    }

    /// Waits for the next launch.
    pub async fn next_launch(&self) -> Arc<FakeProcessControl> {
        self.launched_rx.recv().await.unwrap()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, request: &LaunchRequest) -> io::Result<Box<dyn ProxyProcess>> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_spawn {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        }
        let (stdout_tx, stdout_rx) = channel::unbounded();
        let (stderr_tx, stderr_rx) = channel::unbounded();
        let (events_tx, events_rx) = channel::unbounded();
        let (killed_tx, killed_rx) = channel::unbounded();
        for chunk in &self.stdout_script {
            stdout_tx.try_send(chunk.as_bytes().to_vec()).unwrap();
        }
        let kills = Arc::new(AtomicUsize::new(0));
        let control = Arc::new(FakeProcessControl {
            stdout: stdout_tx,
            stderr: stderr_tx,
            events: events_tx,
            kills: Arc::clone(&kills),
            killed: killed_rx,
        });
        self.processes.lock().unwrap().push(Arc::clone(&control));
        self.launched_tx.try_send(control).unwrap();
        Ok(Box::new(FakeProcess {
            stdout: Some(ChannelReader::new(stdout_rx)),
            stderr: Some(ChannelReader::new(stderr_rx)),
            events: events_rx,
            kills,
            killed: killed_tx,
        }))
    }
}

/// Answers readiness probes without touching the network.
pub struct FakeProber {
    ready: bool,
    probed: Mutex<Vec<u16>>,
}

impl FakeProber {
    pub fn ready() -> Self {
        FakeProber {
            ready: true,
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn never_ready() -> Self {
        FakeProber {
            ready: false,
            ..Self::ready()
        }
    }

    pub fn probed(&self) -> Vec<u16> {
        self.probed.lock().unwrap().clone()
    }
}

impl PortProber for FakeProber {
    fn wait_until_port_is_used(
        &self,
        port: u16,
        _interval: Duration,
        timeout: Duration,
    ) -> future::Boxed<Result<()>> {
        self.probed.lock().unwrap().push(port);
        let result = if self.ready {
            Ok(())
        } else {
            Err(Error::PortTimeout { port, timeout })
        };
        Box::pin(future::ready(result))
    }
}
