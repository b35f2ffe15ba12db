// Copyright 2024 TideKV Contributors
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

use thiserror::Error;

use crate::types::Node;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Workspace-wide error type. The first six variants are surfaced on the
/// wire; `Busy` and `Stale` stay inside the data node.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("not leader, master is {master}")]
    NotLeader { master: Node },

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("stale epoch {remote}, local epoch is {local}")]
    StaleEpoch { local: i64, remote: i64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Whether a bounded retry against the same peer may succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::Io(std::io::Error::other("closed")).retryable());
        assert!(Error::Busy("send task".into()).retryable());
        assert!(!Error::Corruption("bad record".into()).retryable());
        assert!(!Error::NotLeader {
            master: Node::new("127.0.0.1", 9221)
        }
        .retryable());
    }
}
