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

//! One replica of one shard. The partition owns its KV store and binlog,
//! enforces the role/state discipline on every operation, and keeps the
//! invariant that its offset always equals the binlog append position by
//! running apply-then-append under a single write mutex.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use prost::Message;
use tidekv_common::config::NodeConfig;
use tidekv_common::error::{Error, Result};
use tidekv_common::types::{BinlogOffset, Node, PartitionState, Role};
use tidekv_proto::client::{cmd_request, CmdRequest};
use tidekv_proto::meta::PartitionMapState;
use tidekv_storage::{Binlog, BinlogReader, EngineRef, EngineUsage, MemEngine};

const MANIFEST_FILE: &str = "MANIFEST";
/// Marker file closing a snapshot transfer; carries the checkpoint offset.
pub const DB_SYNC_INFO_FILE: &str = "info";

/// Side effects of applying one partition-map entry, acted on by the caller
/// (scheduling catch-up, dropping send tasks).
#[derive(Debug, Default)]
pub struct MapEffects {
    pub need_trysync: bool,
    pub lost_mastership: bool,
    pub removed_slaves: Vec<Node>,
}

#[derive(Clone, Debug, Default)]
struct Status {
    state: PartitionState,
    role: Role,
    master: Node,
    slaves: Vec<Node>,
    /// Set once the replica has served in `Active`; gates reads in `Stuck`.
    served_active: bool,
}

pub struct Partition {
    table_name: String,
    id: u32,
    local_node: Node,
    data_dir: PathBuf,
    sync_dir: PathBuf,
    engine: RwLock<EngineRef>,
    binlog: Arc<Binlog>,
    /// Serializes apply-to-store with binlog append, making commit order,
    /// append order and send-cursor order the same order.
    write_lock: Mutex<()>,
    status: RwLock<Status>,
}

impl Partition {
    pub fn new(
        table_name: &str,
        id: u32,
        config: &NodeConfig,
        local_node: Node,
    ) -> Result<Arc<Self>> {
        let subdir = format!("{table_name}/{id}");
        let data_dir = config.data_path.join(&subdir);
        let log_dir = config.log_path.join(&subdir);
        let sync_dir = config.db_sync_path.join(&subdir);

        let engine: EngineRef = MemEngine::open(&data_dir)?;
        let binlog = Binlog::open(log_dir, config.binlog_file_size)?;

        let partition = Self {
            table_name: table_name.to_string(),
            id,
            local_node,
            data_dir,
            sync_dir,
            engine: RwLock::new(engine),
            binlog,
            write_lock: Mutex::new(()),
            status: RwLock::new(Status::default()),
        };
        partition.recover()?;
        Ok(Arc::new(partition))
    }

    /// Replays the binlog suffix not covered by the last store checkpoint,
    /// so the store again equals a genesis-to-tail replay.
    fn recover(&self) -> Result<()> {
        let replay_from = match self.read_manifest()? {
            Some(offset) => offset,
            None => self.binlog.earliest_offset(),
        };
        let engine = self.engine.read().clone();

        let mut reader = match BinlogReader::new(self.binlog.clone(), replay_from) {
            Ok(reader) => reader,
            Err(_) => {
                // The checkpoint is ahead of the recovered log tail, which
                // only happens when unsynced segments were lost in a crash.
                // The store is authoritative; resume the log at the
                // checkpoint position and let replication fall back.
                tracing::warn!(
                    table = self.table_name,
                    partition = self.id,
                    offset = %replay_from,
                    "binlog behind checkpoint, resetting producer"
                );
                self.binlog.reset_to(replay_from)?;
                return Ok(());
            }
        };
        while let Some((payload, _)) = reader.next()? {
            let request = CmdRequest::decode(payload.as_slice())
                .map_err(|e| Error::Corruption(format!("unreplayable binlog record: {e}")))?;
            if let Some(cmd) = &request.cmd {
                apply_cmd(&engine, cmd)?;
            }
        }
        Ok(())
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn binlog(&self) -> Arc<Binlog> {
        self.binlog.clone()
    }

    pub fn binlog_offset(&self) -> BinlogOffset {
        self.binlog.latest_offset()
    }

    pub fn state(&self) -> PartitionState {
        self.status.read().state
    }

    pub fn is_master(&self) -> bool {
        self.status.read().role == Role::Master
    }

    pub fn master_node(&self) -> Node {
        self.status.read().master.clone()
    }

    pub fn slaves(&self) -> Vec<Node> {
        self.status.read().slaves.clone()
    }

    pub fn sync_dir(&self) -> &PathBuf {
        &self.sync_dir
    }

    /// Applies one client write. Only an `Active` master takes writes.
    pub fn handle_write(&self, cmd: &cmd_request::Cmd) -> Result<BinlogOffset> {
        {
            let status = self.status.read();
            if status.role != Role::Master {
                return Err(Error::NotLeader {
                    master: status.master.clone(),
                });
            }
            if status.state != PartitionState::Active {
                return Err(Error::Unavailable(format!(
                    "partition in state {}",
                    status.state
                )));
            }
        }

        let _guard = self.write_lock.lock();
        let engine = self.engine.read().clone();
        apply_cmd(&engine, cmd)?;
        let payload = CmdRequest {
            cmd: Some(cmd.clone()),
        }
        .encode_to_vec();
        self.binlog.append(&payload)
    }

    /// Serves one read under the role policy: the master serves unless it
    /// never reached `Active`; a slave serves only while `Active`.
    pub fn handle_read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        {
            let status = self.status.read();
            let allowed = match (status.role, status.state) {
                (Role::Master, PartitionState::Active) => true,
                (Role::Master, PartitionState::Stuck) => status.served_active,
                (Role::Slave, PartitionState::Active) => true,
                _ => false,
            };
            if !allowed {
                if status.role == Role::Slave && !status.master.is_empty() {
                    return Err(Error::NotLeader {
                        master: status.master.clone(),
                    });
                }
                return Err(Error::Unavailable(format!(
                    "partition in state {}",
                    status.state
                )));
            }
        }
        self.engine.read().get(key)
    }

    /// Applies one replicated command at exactly the next expected offset.
    /// An offset gap means this replica diverged from its master.
    pub fn apply_replicated(&self, request: &CmdRequest, expected: BinlogOffset) -> Result<()> {
        {
            let status = self.status.read();
            // `TrySync` also accepts: the first frames legitimately race
            // ahead of the handshake answer, and the offset check below is
            // what actually protects the stream.
            let accepting = status.role == Role::Slave
                && matches!(
                    status.state,
                    PartitionState::Active | PartitionState::TrySync
                );
            if !accepting {
                return Err(Error::Unavailable(format!(
                    "replica not accepting stream in state {}",
                    status.state
                )));
            }
        }

        let _guard = self.write_lock.lock();
        let tail = self.binlog.latest_offset();
        if expected != tail {
            return Err(Error::InvalidArgument(format!(
                "replication offset gap: stream at {expected}, replica at {tail}"
            )));
        }

        let cmd = request
            .cmd
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("empty replicated command".to_string()))?;
        let engine = self.engine.read().clone();
        if let Err(e) = apply_cmd(&engine, cmd) {
            // Divergence must not be silently masked.
            self.set_stuck();
            return Err(e);
        }
        match self.binlog.append(&request.encode_to_vec()) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_stuck();
                Err(e)
            }
        }
    }

    /// Reconciles this replica with one partition-map entry.
    pub fn update_from_map(
        &self,
        map_state: PartitionMapState,
        master: Node,
        slaves: Vec<Node>,
    ) -> MapEffects {
        let mut status = self.status.write();
        let old = status.clone();

        let new_role = if master == self.local_node {
            Role::Master
        } else {
            Role::Slave
        };
        status.role = new_role;
        status.slaves = slaves.into_iter().filter(|s| *s != master).collect();
        status.master = master;

        let mut effects = MapEffects {
            lost_mastership: old.role == Role::Master && new_role == Role::Slave,
            ..Default::default()
        };
        if old.role == Role::Master && new_role == Role::Master {
            effects.removed_slaves = old
                .slaves
                .iter()
                .filter(|s| !status.slaves.contains(s))
                .cloned()
                .collect();
        }

        status.state = match map_state {
            PartitionMapState::Stuck => PartitionState::Stuck,
            PartitionMapState::Active => match new_role {
                Role::Master => {
                    status.served_active = true;
                    PartitionState::Active
                }
                Role::Slave => {
                    let undisturbed = old.role == Role::Slave
                        && old.master == status.master
                        && matches!(
                            old.state,
                            PartitionState::Active
                                | PartitionState::TrySync
                                | PartitionState::WaitDbSync
                        );
                    if undisturbed {
                        old.state
                    } else {
                        effects.need_trysync = true;
                        PartitionState::TrySync
                    }
                }
            },
        };

        if old.state != status.state || old.role != status.role {
            tracing::info!(
                table = self.table_name,
                partition = self.id,
                from = %old.state,
                to = %status.state,
                master = %status.master,
                "partition updated from map"
            );
        }
        effects
    }

    /// Marks the replica divergent so the catch-up handshake runs again.
    /// Returns whether this call performed the transition.
    pub fn set_trysync(&self) -> bool {
        let mut status = self.status.write();
        if status.role == Role::Slave && status.state == PartitionState::Active {
            status.state = PartitionState::TrySync;
            true
        } else {
            false
        }
    }

    pub fn should_try_sync(&self) -> bool {
        let status = self.status.read();
        status.role == Role::Slave && status.state == PartitionState::TrySync
    }

    pub fn try_sync_done(&self) {
        let mut status = self.status.write();
        status.state = PartitionState::Active;
        status.served_active = true;
    }

    pub fn should_wait_db_sync(&self) -> bool {
        self.status.read().state == PartitionState::WaitDbSync
    }

    pub fn set_wait_db_sync(&self) {
        self.status.write().state = PartitionState::WaitDbSync;
    }

    /// Bootstrap finished: the received store is in place, go back to the
    /// handshake to start streaming from the checkpoint offset.
    pub fn wait_db_sync_done(&self) {
        let mut status = self.status.write();
        if status.state == PartitionState::WaitDbSync {
            status.state = PartitionState::TrySync;
        }
    }

    pub fn leave(&self) {
        self.status.write().state = PartitionState::Leaving;
    }

    pub(crate) fn set_stuck(&self) {
        let mut status = self.status.write();
        tracing::error!(
            table = self.table_name,
            partition = self.id,
            state = %status.state,
            "partition stuck, operator intervention required"
        );
        status.state = PartitionState::Stuck;
    }

    /// Catch-up fallback: repositions the local log at `offset` as dictated
    /// by the master. The confirmed prefix is kept when `offset` is within
    /// the retained log; otherwise the log restarts there.
    pub fn set_binlog_offset(&self, offset: BinlogOffset) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.binlog.contains(offset) {
            self.binlog.truncate(offset)
        } else {
            self.binlog.reset_to(offset)
        }
    }

    /// Polls for the marker file left by the snapshot transfer; on arrival,
    /// swaps the received store in and repositions the binlog at the
    /// checkpoint offset.
    pub fn try_update_master_offset(&self) -> Result<bool> {
        let info_path = self.sync_dir.join(DB_SYNC_INFO_FILE);
        if !info_path.exists() {
            return Ok(false);
        }
        let content = std::fs::read_to_string(&info_path)?;
        let mut lines = content.lines();
        let sender = lines.next().unwrap_or_default().to_string();
        let offset = parse_offset_line(lines.next().unwrap_or_default()).ok_or_else(|| {
            Error::Corruption(format!("malformed db-sync marker {}", info_path.display()))
        })?;

        let _guard = self.write_lock.lock();
        // Clear the old store files, move the received ones in.
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
            }
        }
        for entry in std::fs::read_dir(&self.sync_dir)? {
            let entry = entry?;
            if entry.file_name() == DB_SYNC_INFO_FILE || !entry.file_type()?.is_file() {
                continue;
            }
            std::fs::rename(entry.path(), self.data_dir.join(entry.file_name()))?;
        }

        *self.engine.write() = MemEngine::open(&self.data_dir)?;
        self.binlog.reset_to(offset)?;
        self.write_manifest(offset)?;
        std::fs::remove_file(&info_path)?;

        tracing::info!(
            table = self.table_name,
            partition = self.id,
            from = sender,
            offset = %offset,
            "snapshot bootstrap complete"
        );
        Ok(true)
    }

    /// Checkpoints the store into `dir` together with the marker file a
    /// bootstrapping follower waits for. The write mutex makes the
    /// checkpoint and the recorded offset one consistent cut.
    pub fn bgsave_to(&self, dir: &std::path::Path) -> Result<BinlogOffset> {
        let _guard = self.write_lock.lock();
        let offset = self.binlog.latest_offset();
        self.engine.read().checkpoint(dir)?;
        std::fs::write(
            dir.join(DB_SYNC_INFO_FILE),
            format!(
                "{}\n{} {}\n",
                self.local_node, offset.file_num, offset.offset
            ),
        )?;
        Ok(offset)
    }

    pub fn usage(&self) -> EngineUsage {
        self.engine.read().usage()
    }

    /// Periodic maintenance from the server cron; decides the fsync cadence
    /// of the binlog.
    pub fn do_timing_task(&self) {
        if let Err(e) = self.binlog.sync() {
            tracing::warn!(
                table = self.table_name,
                partition = self.id,
                error = %e,
                "binlog fsync failed"
            );
        }
    }

    /// Graceful close: checkpoint into the data directory so a restart
    /// replays only the binlog suffix.
    pub fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let offset = self.binlog.latest_offset();
        self.engine.read().checkpoint(&self.data_dir)?;
        self.write_manifest(offset)?;
        self.binlog.sync()
    }

    pub fn dump(&self) {
        let status = self.status.read();
        tracing::debug!(
            table = self.table_name,
            partition = self.id,
            state = %status.state,
            role = ?status.role,
            master = %status.master,
            slaves = ?status.slaves.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            offset = %self.binlog.latest_offset(),
            "partition"
        );
    }

    fn write_manifest(&self, offset: BinlogOffset) -> Result<()> {
        let tmp = self.data_dir.join(format!("{MANIFEST_FILE}.tmp"));
        std::fs::write(&tmp, format!("{} {}\n", offset.file_num, offset.offset))?;
        std::fs::rename(tmp, self.data_dir.join(MANIFEST_FILE))?;
        Ok(())
    }

    fn read_manifest(&self) -> Result<Option<BinlogOffset>> {
        let path = self.data_dir.join(MANIFEST_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let offset = parse_offset_line(content.trim()).ok_or_else(|| {
            Error::Corruption(format!("malformed manifest {}", path.display()))
        })?;
        Ok(Some(offset))
    }
}

fn parse_offset_line(line: &str) -> Option<BinlogOffset> {
    let (file_num, offset) = line.trim().split_once(' ')?;
    Some(BinlogOffset::new(
        file_num.parse().ok()?,
        offset.parse().ok()?,
    ))
}

fn apply_cmd(engine: &EngineRef, cmd: &cmd_request::Cmd) -> Result<()> {
    match cmd {
        cmd_request::Cmd::Set(set) => engine.put(&set.key, &set.value),
        cmd_request::Cmd::Del(del) => engine.delete(&del.key),
        _ => Err(Error::InvalidArgument(
            "only writes reach the apply path".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use tidekv_proto::client::{DelRequest, SetRequest};

    use super::*;

    fn test_config(dir: &std::path::Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.data_path = dir.join("data");
        config.log_path = dir.join("log");
        config.db_sync_path = dir.join("dbsync");
        config.binlog_file_size = 4096;
        config
    }

    fn local() -> Node {
        Node::new("127.0.0.1", 9221)
    }

    fn other() -> Node {
        Node::new("127.0.0.1", 9321)
    }

    fn set_cmd(key: &str, value: &str) -> cmd_request::Cmd {
        cmd_request::Cmd::Set(SetRequest {
            table_name: "t".to_string(),
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        })
    }

    fn del_cmd(key: &str) -> cmd_request::Cmd {
        cmd_request::Cmd::Del(DelRequest {
            table_name: "t".to_string(),
            key: key.as_bytes().to_vec(),
        })
    }

    fn master_partition(dir: &std::path::Path) -> Arc<Partition> {
        let partition = Partition::new("t", 0, &test_config(dir), local()).unwrap();
        partition.update_from_map(PartitionMapState::Active, local(), vec![other()]);
        partition
    }

    #[test]
    fn test_write_requires_active_master() {
        let dir = tempfile::tempdir().unwrap();
        let partition = Partition::new("t", 0, &test_config(dir.path()), local()).unwrap();

        // Fresh replica: no role assigned yet.
        assert!(matches!(
            partition.handle_write(&set_cmd("k", "v")),
            Err(Error::NotLeader { .. })
        ));

        partition.update_from_map(PartitionMapState::Active, other(), vec![local()]);
        let err = partition.handle_write(&set_cmd("k", "v")).unwrap_err();
        match err {
            Error::NotLeader { master } => assert_eq!(master, other()),
            other => panic!("unexpected error {other}"),
        }

        partition.update_from_map(PartitionMapState::Active, local(), vec![other()]);
        partition.handle_write(&set_cmd("k", "v")).unwrap();
        assert_eq!(
            partition.handle_read(b"k").unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn test_write_advances_offset_in_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        let partition = master_partition(dir.path());

        let mut last = BinlogOffset::default();
        for i in 0..10 {
            let offset = partition
                .handle_write(&set_cmd("k", &format!("v{i}")))
                .unwrap();
            assert!(offset > last);
            last = offset;
        }
        assert_eq!(partition.binlog_offset(), last);
    }

    #[test]
    fn test_stuck_master_serves_reads_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let partition = master_partition(dir.path());
        partition.handle_write(&set_cmd("k", "v")).unwrap();

        partition.update_from_map(PartitionMapState::Stuck, local(), vec![other()]);
        assert!(matches!(
            partition.handle_write(&set_cmd("k", "v2")),
            Err(Error::Unavailable(_))
        ));
        assert_eq!(partition.handle_read(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_slave_read_only_when_active() {
        let dir = tempfile::tempdir().unwrap();
        let partition = Partition::new("t", 0, &test_config(dir.path()), local()).unwrap();
        partition.update_from_map(PartitionMapState::Active, other(), vec![local()]);

        assert!(partition.should_try_sync());
        assert!(partition.handle_read(b"k").is_err());

        partition.try_sync_done();
        assert_eq!(partition.handle_read(b"k").unwrap(), None);
    }

    #[test]
    fn test_apply_replicated_enforces_exact_offset() {
        let master_dir = tempfile::tempdir().unwrap();
        let master = master_partition(master_dir.path());

        let slave_dir = tempfile::tempdir().unwrap();
        let slave = Partition::new("t", 0, &test_config(slave_dir.path()), local()).unwrap();
        slave.update_from_map(PartitionMapState::Active, other(), vec![local()]);
        slave.try_sync_done();

        // Replicate three writes and a delete, checking offset lockstep.
        for cmd in [
            set_cmd("x", "1"),
            set_cmd("x", "2"),
            set_cmd("y", "3"),
            del_cmd("x"),
        ] {
            let expected = master.binlog_offset();
            assert_eq!(expected, slave.binlog_offset());
            master.handle_write(&cmd).unwrap();
            let request = CmdRequest { cmd: Some(cmd) };
            slave.apply_replicated(&request, expected).unwrap();
        }
        assert_eq!(master.binlog_offset(), slave.binlog_offset());
        assert_eq!(slave.handle_read(b"x").unwrap(), None);
        assert_eq!(slave.handle_read(b"y").unwrap(), Some(b"3".to_vec()));

        // A gap is rejected and leaves no partial effect.
        let before = slave.binlog_offset();
        let request = CmdRequest {
            cmd: Some(set_cmd("z", "9")),
        };
        assert!(slave
            .apply_replicated(&request, BinlogOffset::new(9, 9))
            .is_err());
        assert_eq!(slave.binlog_offset(), before);
        assert_eq!(slave.handle_read(b"z").unwrap(), None);
    }

    #[test]
    fn test_concurrent_writes_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let partition = master_partition(dir.path());

        let writers: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|value| {
                let partition = partition.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        partition.handle_write(&set_cmd("k", value)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        // The final value is exactly one of the two, and the binlog holds
        // every write in one total order that replays to the same state.
        let stored = partition.handle_read(b"k").unwrap().unwrap();
        assert!(stored == b"left" || stored == b"right");

        let mut reader =
            BinlogReader::new(partition.binlog(), partition.binlog.earliest_offset()).unwrap();
        let mut count = 0;
        let mut last = Vec::new();
        while let Some((payload, _)) = reader.next().unwrap() {
            let request = CmdRequest::decode(payload.as_slice()).unwrap();
            if let Some(cmd_request::Cmd::Set(set)) = request.cmd {
                last = set.value;
            }
            count += 1;
        }
        assert_eq!(count, 100);
        assert_eq!(last, stored);
    }

    #[test]
    fn test_restart_replays_binlog() {
        let dir = tempfile::tempdir().unwrap();
        {
            let partition = master_partition(dir.path());
            for i in 0..50 {
                partition
                    .handle_write(&set_cmd(&format!("k{i}"), &format!("v{i}")))
                    .unwrap();
            }
            partition.handle_write(&del_cmd("k0")).unwrap();
        }

        // Reopen without a checkpoint: the store is rebuilt from genesis.
        let partition = master_partition(dir.path());
        assert_eq!(partition.handle_read(b"k0").unwrap(), None);
        assert_eq!(
            partition.handle_read(b"k49").unwrap(),
            Some(b"v49".to_vec())
        );
    }

    #[test]
    fn test_close_then_restart_replays_residual_only() {
        let dir = tempfile::tempdir().unwrap();
        {
            let partition = master_partition(dir.path());
            partition.handle_write(&set_cmd("a", "1")).unwrap();
            partition.close().unwrap();
        }
        {
            let partition = master_partition(dir.path());
            assert_eq!(partition.handle_read(b"a").unwrap(), Some(b"1".to_vec()));
            partition.handle_write(&set_cmd("b", "2")).unwrap();
        }
        let partition = master_partition(dir.path());
        assert_eq!(partition.handle_read(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(partition.handle_read(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_bootstrap_swap() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = master_partition(source_dir.path());
        for i in 0..20 {
            source
                .handle_write(&set_cmd(&format!("k{i}"), &format!("v{i}")))
                .unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let partition = Partition::new("t", 0, &config, local()).unwrap();
        partition.update_from_map(PartitionMapState::Active, other(), vec![local()]);
        partition.set_wait_db_sync();

        // Nothing staged yet.
        assert!(!partition.try_update_master_offset().unwrap());

        // Master dumps its checkpoint straight into the staging dir.
        let offset = source.bgsave_to(partition.sync_dir()).unwrap();

        assert!(partition.try_update_master_offset().unwrap());
        partition.wait_db_sync_done();
        assert!(partition.should_try_sync());
        assert_eq!(partition.binlog_offset(), offset);

        partition.try_sync_done();
        assert_eq!(
            partition.handle_read(b"k7").unwrap(),
            Some(b"v7".to_vec())
        );
    }

    #[test]
    fn test_map_rotation_effects() {
        let dir = tempfile::tempdir().unwrap();
        let partition = master_partition(dir.path());

        // Master loses the partition to the other node.
        let effects =
            partition.update_from_map(PartitionMapState::Active, other(), vec![local()]);
        assert!(effects.lost_mastership);
        assert!(effects.need_trysync);
        assert!(partition.should_try_sync());

        // An undisturbed follower map entry does not restart catch-up.
        let effects =
            partition.update_from_map(PartitionMapState::Active, other(), vec![local()]);
        assert!(!effects.need_trysync);

        // Slave removal on a stable master is reported for task cleanup.
        partition.update_from_map(PartitionMapState::Active, local(), vec![other()]);
        let effects = partition.update_from_map(PartitionMapState::Active, local(), vec![]);
        assert_eq!(effects.removed_slaves, vec![other()]);
    }
}
