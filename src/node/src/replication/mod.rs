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

//! The replication engine: ordered per-partition binlog streaming on the
//! master side, order-preserving sharded apply on the follower side, the
//! catch-up handshake, and the snapshot transfer used to seed cold
//! followers.

pub mod peer;
pub mod receiver;
pub mod sender;
pub mod transfer;
pub mod trysync;
