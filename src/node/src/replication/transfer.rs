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

//! Boundary to the rsync-style file transfer used for snapshot bootstrap.
//! A follower starts a daemon exporting its staging area under a module
//! name qualified by its own `ip:port`, so a stale daemon from a previous
//! master cannot deliver files; the master pushes checkpoint files into
//! that module. The marker file is always delivered last: its arrival
//! means the snapshot is complete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use parking_lot::Mutex;
use tidekv_common::error::{Error, Result};
use tidekv_common::types::Node;

use crate::partition::DB_SYNC_INFO_FILE;

pub fn module_name(node: &Node) -> String {
    format!("tidekv_{}_{}", node.ip, node.port)
}

#[async_trait]
pub trait SnapshotTransfer: Send + Sync + 'static {
    /// Starts (or keeps) a daemon exporting `export_dir` as `module`.
    async fn start(&self, module: &str, export_dir: &Path) -> Result<()>;

    async fn stop(&self, module: &str) -> Result<()>;

    /// Pushes the files of `src` into `<module>/<subpath>` on the node
    /// exporting `module`.
    async fn push(&self, src: &Path, module: &str, subpath: &str) -> Result<()>;
}

static MODULES: LazyLock<Mutex<HashMap<String, PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Same-host transfer: modules resolve through a process-wide registry and
/// pushes are filesystem copies. Stands in for the external rsync daemon
/// wherever master and follower share a filesystem, which is also what the
/// multi-node tests run on.
pub struct LocalTransfer;

#[async_trait]
impl SnapshotTransfer for LocalTransfer {
    async fn start(&self, module: &str, export_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(export_dir)?;
        MODULES
            .lock()
            .insert(module.to_string(), export_dir.to_path_buf());
        tracing::info!(module, path = %export_dir.display(), "snapshot transfer started");
        Ok(())
    }

    async fn stop(&self, module: &str) -> Result<()> {
        MODULES.lock().remove(module);
        tracing::info!(module, "snapshot transfer stopped");
        Ok(())
    }

    async fn push(&self, src: &Path, module: &str, subpath: &str) -> Result<()> {
        let export_dir = MODULES
            .lock()
            .get(module)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transfer module {module}")))?;
        let dest = export_dir.join(subpath);
        std::fs::create_dir_all(&dest)?;

        let mut marker = None;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.file_name() == DB_SYNC_INFO_FILE {
                marker = Some(entry.path());
                continue;
            }
            std::fs::copy(entry.path(), dest.join(entry.file_name()))?;
        }
        if let Some(marker) = marker {
            std::fs::copy(&marker, dest.join(DB_SYNC_INFO_FILE))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_requires_started_module() {
        let src = tempfile::tempdir().unwrap();
        let err = LocalTransfer
            .push(src.path(), "tidekv_127.0.0.1_1", "t/0")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_push_delivers_marker_last() {
        let node = Node::new("127.0.0.1", 18821);
        let module = module_name(&node);
        let export = tempfile::tempdir().unwrap();
        LocalTransfer.start(&module, export.path()).await.unwrap();

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("SNAPSHOT"), b"data").unwrap();
        std::fs::write(src.path().join(DB_SYNC_INFO_FILE), b"marker").unwrap();
        LocalTransfer.push(src.path(), &module, "t/3").await.unwrap();

        let dest = export.path().join("t/3");
        assert_eq!(std::fs::read(dest.join("SNAPSHOT")).unwrap(), b"data");
        assert_eq!(
            std::fs::read(dest.join(DB_SYNC_INFO_FILE)).unwrap(),
            b"marker"
        );

        LocalTransfer.stop(&module).await.unwrap();
    }
}
