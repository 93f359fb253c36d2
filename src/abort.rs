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

use smol::{
    channel::{self, Receiver, Sender},
    future,
};

/// Owner side of a cancellation signal.
///
/// Aborting closes a channel that every [`AbortSignal`] clone watches. Dropping
/// the controller aborts as well.
#[derive(Debug)]
pub struct AbortController {
    tx: Sender<()>,
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(1);
        AbortController {
            tx,
            signal: AbortSignal { rx: Some(rx) },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self) {
        self.tx.close();
    }
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: Option<Receiver<()>>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        AbortSignal { rx: None }
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.as_ref().is_some_and(Receiver::is_closed)
    }

    /// Resolves once the signal fires.
    pub async fn aborted(&self) {
        match &self.rx {
            // Nothing is ever sent, so recv only returns once the channel closes.
            Some(rx) => while rx.recv().await.is_ok() {},
            None => future::pending().await,
        }
    }
}
