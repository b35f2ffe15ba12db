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

//! The data-node runtime: hosts partition replicas, serves client traffic
//! for partitions it masters, streams binlog to followers, applies binlog
//! from its masters, and obeys the partition map pulled from meta.

pub mod background;
pub mod command;
pub mod meta;
pub mod partition;
pub mod replication;
pub mod server;
pub mod service;
pub mod stats;
pub mod table;
pub mod test_utils;

pub use server::DataServer;
