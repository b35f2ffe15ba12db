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

//! Wire protocol of the cluster: protobuf messages for the client, meta and
//! replication channels, and the length-prefixed frame codec they share.
//!
//! Every channel speaks the same framing: a 4-byte big-endian payload length
//! followed by the protobuf-encoded payload.

pub mod client;
pub mod codec;
pub mod common;
pub mod meta;
