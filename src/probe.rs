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
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use smol::{future, net::TcpStream, Timer};
use tracing::trace;

use crate::error::{Error, Result};

/// Waits for something to listen on a port.
pub trait PortProber: Send + Sync {
    /// Resolves once `port` accepts connections, checking every `interval`.
    /// Fails with [`Error::PortTimeout`] after `timeout`.
    fn wait_until_port_is_used(
        &self,
        port: u16,
        interval: Duration,
        timeout: Duration,
    ) -> future::Boxed<Result<()>>;
}

/// Probes by opening TCP connections.
#[derive(Debug, Clone, Copy)]
pub struct TcpPortProber {
    host: IpAddr,
}

impl Default for TcpPortProber {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl TcpPortProber {
    pub fn new(host: IpAddr) -> Self {
        TcpPortProber { host }
    }
}

impl PortProber for TcpPortProber {
    fn wait_until_port_is_used(
        &self,
        port: u16,
        interval: Duration,
        timeout: Duration,
    ) -> future::Boxed<Result<()>> {
        let addr = SocketAddr::new(self.host, port);
        Box::pin(async move {
            let poll = async {
                loop {
                    match TcpStream::connect(addr).await {
                        Ok(_) => return Ok(()),
                        Err(e) => trace!(%addr, "not in use yet: {}", e),
                    }
                    Timer::after(interval).await;
                }
            };
            let deadline = async {
                Timer::after(timeout).await;
                Err(Error::PortTimeout { port, timeout })
            };
            future::or(poll, deadline).await
        })
    }
}
