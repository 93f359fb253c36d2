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

//! Port discovery from a child's output stream.
//!
//! The proxy announces the address it bound with a log line such as
//! `Starting to serve on 127.0.0.1:54321`. Output arrives in arbitrary chunks,
//! so lines are reassembled before matching.

use regex::Regex;
use smol::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 4096;

/// Longest line kept while waiting for its newline.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Name of the capture group holding the announced address.
pub const ADDRESS_GROUP: &str = "address";

/// Compiles the pattern matching the proxy's "starting to serve" line.
pub fn starting_serve_pattern() -> Result<Regex, regex::Error> {
    Regex::new(r"(?i)starting to serve on (?P<address>.+)")
}

/// Extracts a non-zero port from `host:port` or `:port`.
pub fn parse_port(address: &str) -> Option<u16> {
    let (_, port) = address.trim().rsplit_once(':')?;
    port.parse().ok().filter(|&port| port != 0)
}

/// Incremental line matcher.
///
/// Bytes are buffered until a newline completes a line, so a match split over
/// several chunks is still found. Lines matching the pattern whose address
/// carries no usable port are skipped, as are lines longer than
/// [`MAX_LINE_LEN`].
pub struct LineMatcher<'p> {
    pattern: &'p Regex,
    pending: Vec<u8>,
    overlong: bool,
}

impl<'p> LineMatcher<'p> {
    pub fn new(pattern: &'p Regex) -> Self {
        LineMatcher {
            pattern,
            pending: Vec::new(),
            overlong: false,
        }
    }

    /// Feeds a chunk of output, returning the port from the first complete
    /// line that matches.
    pub fn push(&mut self, chunk: &[u8]) -> Option<u16> {
        self.pending.extend_from_slice(chunk);
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            if std::mem::take(&mut self.overlong) {
                continue;
            }
            if let Some(port) = self.match_line(&line) {
                return Some(port);
            }
        }
        if self.pending.len() > MAX_LINE_LEN {
            self.pending.clear();
            self.overlong = true;
        }
        None
    }

    /// Tests whatever unterminated line remains once the stream has ended.
    pub fn finish(&mut self) -> Option<u16> {
        let line = std::mem::take(&mut self.pending);
        if std::mem::take(&mut self.overlong) {
            return None;
        }
        self.match_line(&line)
    }

    fn match_line(&self, line: &[u8]) -> Option<u16> {
        let line = String::from_utf8_lossy(line);
        let captures = self.pattern.captures(line.trim_end_matches(['\r', '\n']))?;
        parse_port(captures.name(ADDRESS_GROUP)?.as_str())
    }
}

/// Reads `reader` until a line matches `pattern` and returns the port parsed
/// from its `address` group.
///
/// `on_find` runs once, right before the port is returned. The reader is only
/// borrowed, so the caller keeps the rest of the stream.
pub async fn port_from_stream<R, F>(reader: &mut R, pattern: &Regex, on_find: F) -> Result<u16>
where
    R: AsyncRead + Unpin + ?Sized,
    F: FnOnce(u16),
{
    let mut matcher = LineMatcher::new(pattern);
    let mut chunk = [0u8; CHUNK_SIZE];
    let found = loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break matcher.finish();
        }
        if let Some(port) = matcher.push(&chunk[..read]) {
            break Some(port);
        }
    };
    match found {
        Some(port) => {
            on_find(port);
            Ok(port)
        }
        None => Err(Error::StreamClosed {
            pattern: pattern.as_str().to_owned(),
        }),
    }
}
