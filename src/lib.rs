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

//! Supervision of an authenticating Kubernetes API proxy.
//!
//! [`Supervisor::spawn_kube_auth_proxy`] starts the proxy binary for a
//! [`Cluster`], learns the port it serves on from its output, waits for the
//! port to accept connections and returns a [`ProxyHandle`].

pub mod abort;
pub mod certificate;
pub mod cluster;
pub mod config;
mod error;
pub mod line_matcher;
pub mod probe;
pub mod process;
mod supervisor;

#[cfg(test)]
mod testing;

pub use abort::{AbortController, AbortSignal};
pub use certificate::{CertificateProvider, EphemeralCertificate};
pub use cluster::{Cluster, ConnectUpdates, LogUpdates};
pub use config::{ProbeSettings, RetryPolicy, SupervisorConfig};
pub use error::{Error, Result};
pub use process::ProcessEvent;
pub use supervisor::{generate_api_prefix, ProxyHandle, ProxyState, Supervisor};
