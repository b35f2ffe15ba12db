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

//! Key routing. The hash function is pinned for the life of a cluster:
//! clients and servers must agree on it or routing diverges.

use std::hash::{BuildHasher, Hasher};

pub struct Crc32FastBuilder;

impl BuildHasher for Crc32FastBuilder {
    type Hasher = crc32fast::Hasher;

    fn build_hasher(&self) -> Self::Hasher {
        crc32fast::Hasher::new()
    }
}

/// Maps a key to the partition owning it: `crc32(key) mod partition_count`.
pub fn partition_for_key(key: &[u8], partition_count: u32) -> u32 {
    assert!(partition_count > 0);
    let mut hasher = Crc32FastBuilder.build_hasher();
    hasher.write(key);
    (hasher.finish() % partition_count as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_is_deterministic() {
        for key in [&b"k"[..], b"", b"some-much-longer-key", b"\x00\xff"] {
            assert_eq!(
                partition_for_key(key, 16),
                partition_for_key(key, 16),
                "routing must be stable for {key:?}"
            );
        }
    }

    #[test]
    fn test_routing_in_range() {
        for i in 0..1000u32 {
            let key = format!("key_{i}");
            assert!(partition_for_key(key.as_bytes(), 7) < 7);
        }
    }
}
