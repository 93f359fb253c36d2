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

use std::{
    ffi::OsString,
    fmt, io,
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
};

use smol::{
    future::Future,
    io::AsyncRead,
    process::{Child, Command},
};
use tracing::debug;

/// Output stream of a launched process.
pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// Future resolving with the event that ended a process.
pub type Termination<'a> = Pin<Box<dyn Future<Output = ProcessEvent> + Send + 'a>>;

/// Terminal lifecycle event of a proxy process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The process could not be waited on or failed outright.
    Error(String),
    /// The process exited; `None` when it was killed by a signal.
    Exit(Option<i32>),
    /// The process cut its communication channel with the parent.
    Disconnect,
}

impl ProcessEvent {
    /// Whether the event should be surfaced as an error. Only a clean exit is not.
    pub fn is_error(&self) -> bool {
        !matches!(self, ProcessEvent::Exit(Some(0)))
    }
}

impl fmt::Display for ProcessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessEvent::Error(message) => f.write_str(message),
            ProcessEvent::Exit(Some(code)) => write!(f, "proxy exited with code: {}", code),
            ProcessEvent::Exit(None) => f.write_str("proxy exited with signal"),
            ProcessEvent::Disconnect => f.write_str("Proxy disconnected communications"),
        }
    }
}

/// What to run: a program with arguments and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
}

impl LaunchRequest {
    pub fn new(program: impl AsRef<Path>) -> Self {
        LaunchRequest {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Looks up an environment variable set on this request.
    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Starts proxy processes.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> io::Result<Box<dyn ProxyProcess>>;
}

/// A running proxy process.
pub trait ProxyProcess: Send {
    fn take_stdout(&mut self) -> Option<OutputStream>;

    fn take_stderr(&mut self) -> Option<OutputStream>;

    /// Resolves once the process has ended.
    fn terminated(&mut self) -> Termination<'_>;

    /// Kills the process. Killing a process that already exited is a no-op.
    fn kill(&mut self);
}

/// Launches real child processes on the smol reactor.
///
/// The child inherits this process's environment plus whatever the request
/// sets, gets a null stdin, and is killed if its handle is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmolLauncher;

impl ProcessLauncher for SmolLauncher {
    fn launch(&self, request: &LaunchRequest) -> io::Result<Box<dyn ProxyProcess>> {
        let child = Command::new(&request.program)
            .args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(program = %request.program.display(), pid = child.id(), "spawned");
        Ok(Box::new(ChildProcess(child)))
    }
}

struct ChildProcess(Child);

impl ProxyProcess for ChildProcess {
    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.0
            .stdout
            .take()
            .map(|stdout| Box::pin(stdout) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.0
            .stderr
            .take()
            .map(|stderr| Box::pin(stderr) as OutputStream)
    }

    fn terminated(&mut self) -> Termination<'_> {
        Box::pin(async move {
            match self.0.status().await {
                Ok(status) => ProcessEvent::Exit(status.code()),
                Err(e) => ProcessEvent::Error(e.to_string()),
            }
        })
    }

    fn kill(&mut self) {
        // Fails with InvalidInput once the child has been reaped.
        if let Err(e) = self.0.kill() {
            debug!(pid = self.0.id(), "kill: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_is_error() {
        assert!(!ProcessEvent::Exit(Some(0)).is_error());
        assert!(ProcessEvent::Exit(Some(1)).is_error());
        assert!(ProcessEvent::Exit(None).is_error());
        assert!(ProcessEvent::Disconnect.is_error());
        assert!(ProcessEvent::Error("boom".into()).is_error());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(
            ProcessEvent::Exit(Some(2)).to_string(),
            "proxy exited with code: 2"
        );
        assert_eq!(ProcessEvent::Error("ENOENT".into()).to_string(), "ENOENT");
    }

    #[test]
    fn test_request_env_last_wins() {
        let request = LaunchRequest::new("/bin/proxy")
            .env("API_PREFIX", "/a")
            .env("API_PREFIX", "/b");
        assert_eq!(request.get_env("API_PREFIX"), Some("/b"));
        assert_eq!(request.get_env("KUBECONFIG"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_smol_launcher_reports_exit_code() {
        smol::block_on(async {
            let mut request = LaunchRequest::new("sh");
            request.args = vec!["-c".into(), "exit 3".into()];
            let mut process = SmolLauncher.launch(&request).unwrap();
            assert_eq!(process.terminated().await, ProcessEvent::Exit(Some(3)));
            // Already reaped.
            process.kill();
        });
    }

    #[test]
    fn test_smol_launcher_missing_binary() {
        let request = LaunchRequest::new("/nonexistent/kube-auth-proxy-12345");
        let err = SmolLauncher.launch(&request).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
