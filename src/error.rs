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

use std::{io, path::PathBuf, time::Duration};

use crate::process::ProcessEvent;

/// A supervisor error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid cluster api url '{url}': {source}")]
    InvalidApiUrl { url: String, source: url::ParseError },
    #[error("cluster api url '{url}' has no host")]
    MissingHost { url: String },
    #[error("failed to generate certificate for {hostname}: {source:#}")]
    Certificate {
        hostname: String,
        source: anyhow::Error,
    },
    #[error("failed to spawn {}: {source}", .path.display())]
    Spawn { path: PathBuf, source: io::Error },
    #[error("invalid port pattern: {source}")]
    Pattern { source: regex::Error },
    #[error("proxy process has no stdout/stderr pipe")]
    MissingStream,
    #[error("stream closed before a line matched '{pattern}'")]
    StreamClosed { pattern: String },
    #[error("failed reading proxy output: {source}")]
    Io { source: io::Error },
    #[error("proxy terminated before reporting its port: {event}")]
    Terminated { event: ProcessEvent },
    #[error("port {port} was not in use within {timeout:?}")]
    PortTimeout { port: u16, timeout: Duration },
    #[error("proxy port never became ready after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("proxy launch cancelled")]
    Cancelled,
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Self::Io { source }
    }
}

impl Error {
    /// Whether a fresh launch attempt may recover from this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PortTimeout { .. })
    }
}

/// Result alias defaulting to the supervisor [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
