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
    env::consts::{ARCH, EXE_SUFFIX},
    ffi::OsString,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

/// File name of the proxy binary, without the platform executable suffix.
pub const PROXY_BINARY_NAME: &str = env!("KUBE_AUTH_PROXY_BINARY");

/// How long to wait for the proxy's port to accept connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub host: IpAddr,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            interval: Duration::from_millis(500),
            timeout: Duration::from_millis(10_000),
        }
    }
}

/// When to give up relaunching a proxy whose port never became ready.
///
/// The default retries forever without pausing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total launches allowed, the first included. `None` is unbounded.
    pub max_attempts: Option<u32>,
    /// Pause before each relaunch.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn bounded(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    pub fn with_backoff(self, backoff: Duration) -> Self {
        RetryPolicy { backoff, ..self }
    }

    /// Whether another launch may follow `attempts` failed ones.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub proxy_binary: PathBuf,
    pub proxy_args: Vec<OsString>,
    /// Passed to the proxy as `HTTPS_PROXY`.
    pub https_proxy: Option<String>,
    pub probe: ProbeSettings,
    pub retry: RetryPolicy,
}

impl SupervisorConfig {
    pub fn new(proxy_binary: impl Into<PathBuf>) -> Self {
        SupervisorConfig {
            proxy_binary: proxy_binary.into(),
            proxy_args: Vec::new(),
            https_proxy: None,
            probe: ProbeSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Maps a Rust target architecture to the directory name binaries ship under.
pub fn binary_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    }
}

/// Location of the bundled proxy binary for `arch` under `binaries_dir`.
pub fn proxy_binary_path(binaries_dir: &Path, arch: &str) -> PathBuf {
    binaries_dir
        .join(binary_arch(arch))
        .join(format!("{}{}", PROXY_BINARY_NAME, EXE_SUFFIX))
}

/// Location of the bundled proxy binary for the running architecture.
pub fn bundled_proxy_binary(binaries_dir: &Path) -> PathBuf {
    proxy_binary_path(binaries_dir, ARCH)
}
