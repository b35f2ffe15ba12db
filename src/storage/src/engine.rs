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

//! The embedded KV engine boundary. The data node treats the engine as an
//! opaque store with point operations and directory checkpoints; everything
//! above it (roles, replication, routing) is engine-agnostic.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use tidekv_common::error::{Error, Result};

const SNAPSHOT_FILE: &str = "SNAPSHOT";
const SNAPSHOT_MAGIC: &[u8; 8] = b"TDKVSNP1";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineUsage {
    pub keys: u64,
    pub bytes: u64,
}

pub trait KvEngine: Send + Sync + 'static {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Writes a consistent point-in-time snapshot of the store into `dir`,
    /// in the same layout [`MemEngine::open`] reads back.
    fn checkpoint(&self, dir: &Path) -> Result<()>;

    fn usage(&self) -> EngineUsage;
}

pub type EngineRef = Arc<dyn KvEngine>;

/// In-memory engine backed by a `BTreeMap`, durable only through its
/// snapshot file. Restart recovery is the caller's job: load the snapshot,
/// then replay the binlog from the snapshot's offset marker.
pub struct MemEngine {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemEngine {
    /// Opens the engine at `dir`, loading a snapshot if one exists.
    pub fn open(dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let snapshot = dir.join(SNAPSHOT_FILE);
        let map = if snapshot.exists() {
            read_snapshot(&snapshot)?
        } else {
            BTreeMap::new()
        };
        Ok(Arc::new(Self {
            inner: RwLock::new(map),
        }))
    }
}

impl KvEngine for MemEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn checkpoint(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        // Clone under the read lock so the snapshot is a consistent cut.
        let map = self.inner.read().clone();
        let tmp = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        write_snapshot(&tmp, &map)?;
        std::fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;
        Ok(())
    }

    fn usage(&self) -> EngineUsage {
        let map = self.inner.read();
        EngineUsage {
            keys: map.len() as u64,
            bytes: map.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum(),
        }
    }
}

fn write_snapshot(path: &Path, map: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut hasher = crc32fast::Hasher::new();

    writer.write_all(SNAPSHOT_MAGIC)?;
    writer.write_u64::<BigEndian>(map.len() as u64)?;
    for (key, value) in map {
        let mut record = Vec::with_capacity(8 + key.len() + value.len());
        record.write_u32::<BigEndian>(key.len() as u32)?;
        record.write_u32::<BigEndian>(value.len() as u32)?;
        record.extend_from_slice(key);
        record.extend_from_slice(value);
        hasher.update(&record);
        writer.write_all(&record)?;
    }
    writer.write_u32::<BigEndian>(hasher.finalize())?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(Error::Corruption(format!(
            "bad snapshot magic in {}",
            path.display()
        )));
    }

    let count = reader.read_u64::<BigEndian>()?;
    let mut hasher = crc32fast::Hasher::new();
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key_len = reader.read_u32::<BigEndian>()? as usize;
        let value_len = reader.read_u32::<BigEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        let mut value = vec![0u8; value_len];
        reader.read_exact(&mut key)?;
        reader.read_exact(&mut value)?;

        hasher.update(&(key_len as u32).to_be_bytes());
        hasher.update(&(value_len as u32).to_be_bytes());
        hasher.update(&key);
        hasher.update(&value);
        map.insert(key, value);
    }

    let expected = reader.read_u32::<BigEndian>()?;
    if hasher.finalize() != expected {
        return Err(Error::Corruption(format!(
            "snapshot checksum mismatch in {}",
            path.display()
        )));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemEngine::open(dir.path()).unwrap();

        engine.put(b"k", b"v1").unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v1".to_vec()));
        engine.put(b"k", b"v2").unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
        engine.delete(b"k").unwrap();
        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_checkpoint_restore() {
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let engine = MemEngine::open(dir.path()).unwrap();
        for i in 0..100 {
            engine
                .put(format!("key_{i}").as_bytes(), format!("val_{i}").as_bytes())
                .unwrap();
        }
        engine.checkpoint(staging.path()).unwrap();

        let restored = MemEngine::open(staging.path()).unwrap();
        assert_eq!(restored.usage().keys, 100);
        for i in 0..100 {
            assert_eq!(
                restored.get(format!("key_{i}").as_bytes()).unwrap(),
                Some(format!("val_{i}").into_bytes())
            );
        }
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemEngine::open(dir.path()).unwrap();
        engine.put(b"k", b"v").unwrap();
        engine.checkpoint(dir.path()).unwrap();

        let path = dir.path().join(SNAPSHOT_FILE);
        let mut content = std::fs::read(&path).unwrap();
        let mid = content.len() / 2;
        content[mid] ^= 0xff;
        std::fs::write(&path, content).unwrap();

        assert!(MemEngine::open(dir.path()).is_err());
    }

    #[test]
    fn test_usage() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemEngine::open(dir.path()).unwrap();
        engine.put(b"ab", b"cdef").unwrap();
        let usage = engine.usage();
        assert_eq!(usage.keys, 1);
        assert_eq!(usage.bytes, 6);
    }
}
