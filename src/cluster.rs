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

use std::{fmt, path::PathBuf, sync::Arc};

use tracing::{info, warn};
use url::Url;

use crate::error::{Error, Result};

/// Receives connection status messages for a cluster.
pub trait ConnectUpdates: Send + Sync {
    fn broadcast_connect_update(&self, cluster_id: &str, message: &str, is_error: bool);
}

/// Republishes connection updates as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUpdates;

impl ConnectUpdates for LogUpdates {
    fn broadcast_connect_update(&self, cluster_id: &str, message: &str, is_error: bool) {
        let message = message.trim_end();
        if is_error {
            warn!(cluster = cluster_id, "{}", message);
        } else {
            info!(cluster = cluster_id, "{}", message);
        }
    }
}

/// The cluster a proxy is started for.
#[derive(Clone)]
pub struct Cluster {
    pub id: String,
    pub api_url: String,
    pub kube_config_path: PathBuf,
    pub context_name: String,
    updates: Arc<dyn ConnectUpdates>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("api_url", &self.api_url)
            .field("kube_config_path", &self.kube_config_path)
            .field("context_name", &self.context_name)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    pub fn new(
        id: impl Into<String>,
        api_url: impl Into<String>,
        kube_config_path: impl Into<PathBuf>,
        context_name: impl Into<String>,
        updates: Arc<dyn ConnectUpdates>,
    ) -> Self {
        Cluster {
            id: id.into(),
            api_url: api_url.into(),
            kube_config_path: kube_config_path.into(),
            context_name: context_name.into(),
            updates,
        }
    }

    pub fn broadcast_connect_update(&self, message: &str, is_error: bool) {
        self.updates
            .broadcast_connect_update(&self.id, message, is_error);
    }

    /// Host part of the API server URL.
    pub fn api_host(&self) -> Result<String> {
        let url = Url::parse(&self.api_url).map_err(|source| Error::InvalidApiUrl {
            url: self.api_url.clone(),
            source,
        })?;
        url.host_str()
            .map(str::to_owned)
            .ok_or_else(|| Error::MissingHost {
                url: self.api_url.clone(),
            })
    }
}
