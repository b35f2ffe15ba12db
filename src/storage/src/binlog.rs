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

//! Append-only per-partition log of serialized write commands, segmented by
//! file number. Offsets are `(file_num, byte_offset)` pairs pointing at the
//! position *after* a record; the same command stream written with the same
//! segment size bound lands at identical offsets on every replica, which is
//! what lets a follower verify the stream by offset equality alone.
//!
//! On-disk record: `[payload_len u32 BE][crc32(payload) u32 BE][payload]`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use parking_lot::Mutex;
use tidekv_common::error::{Error, Result};
use tidekv_common::types::BinlogOffset;

const RECORD_HEADER_LEN: u64 = 8;
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;
const SEGMENT_PREFIX: &str = "binlog-";
const GENESIS_FILE: &str = "genesis";

fn segment_path(dir: &Path, file_num: u32) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{file_num}"))
}

fn parse_segment_name(name: &str) -> Option<u32> {
    name.strip_prefix(SEGMENT_PREFIX)?.parse().ok()
}

/// The genesis marker records where valid data begins after a producer
/// reset: the reset segment starts with a hole, which the recovery scan
/// must not try to parse.
fn write_genesis(dir: &Path, offset: BinlogOffset) -> Result<()> {
    let tmp = dir.join(format!("{GENESIS_FILE}.tmp"));
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&offset.file_num.to_be_bytes());
    buf.extend_from_slice(&offset.offset.to_be_bytes());
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(tmp, dir.join(GENESIS_FILE))?;
    Ok(())
}

fn read_genesis(dir: &Path) -> Result<Option<BinlogOffset>> {
    let path = dir.join(GENESIS_FILE);
    let content = match std::fs::read(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if content.len() != 12 {
        return Err(Error::Corruption(format!(
            "malformed genesis marker in {}",
            path.display()
        )));
    }
    let file_num = u32::from_be_bytes(content[0..4].try_into().unwrap());
    let offset = u64::from_be_bytes(content[4..12].try_into().unwrap());
    Ok(Some(BinlogOffset::new(file_num, offset)))
}

struct BinlogCore {
    writer: File,
    tail: BinlogOffset,
    earliest: BinlogOffset,
}

pub struct Binlog {
    dir: PathBuf,
    max_file_size: u64,
    core: Mutex<BinlogCore>,
}

impl Binlog {
    /// Opens (or creates) the log at `dir`, recovering the tail segment by
    /// truncating a torn trailing record if the last append never completed.
    pub fn open(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut file_nums: Vec<u32> = std::fs::read_dir(&dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                parse_segment_name(&entry.file_name().to_string_lossy())
            })
            .collect();
        file_nums.sort_unstable();

        let (first, last) = match (file_nums.first(), file_nums.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => {
                File::create(segment_path(&dir, 0))?;
                (0, 0)
            }
        };
        let earliest = match read_genesis(&dir)? {
            Some(genesis) if genesis.file_num == first => genesis,
            _ => BinlogOffset::new(first, 0),
        };

        let scan_base = if earliest.file_num == last {
            earliest.offset
        } else {
            0
        };
        let tail_offset = recover_segment(&segment_path(&dir, last), scan_base)?;
        let mut writer = OpenOptions::new()
            .write(true)
            .open(segment_path(&dir, last))?;
        writer.seek(SeekFrom::Start(tail_offset))?;

        Ok(Arc::new(Self {
            dir,
            max_file_size,
            core: Mutex::new(BinlogCore {
                writer,
                tail: BinlogOffset::new(last, tail_offset),
                earliest,
            }),
        }))
    }

    /// Appends one record and returns the new tail. The record is flushed to
    /// the OS before this returns; fsync cadence is the caller's call via
    /// [`Binlog::sync`].
    ///
    /// Rollover is a pure function of `(tail, payload len, max_file_size)`,
    /// so replicas appending the same stream stay offset-identical.
    pub fn append(&self, payload: &[u8]) -> Result<BinlogOffset> {
        if payload.len() > MAX_RECORD_LEN {
            return Err(Error::InvalidArgument(format!(
                "binlog record of {} bytes exceeds cap",
                payload.len()
            )));
        }
        let mut core = self.core.lock();

        let record_len = RECORD_HEADER_LEN + payload.len() as u64;
        if core.tail.offset > 0 && core.tail.offset + record_len > self.max_file_size {
            self.roll_segment(&mut core)?;
        }

        let mut buf = Vec::with_capacity(record_len as usize);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
        buf.extend_from_slice(payload);
        core.writer.write_all(&buf)?;
        core.writer.flush()?;

        core.tail.offset += record_len;
        Ok(core.tail)
    }

    fn roll_segment(&self, core: &mut BinlogCore) -> Result<()> {
        let next = core.tail.file_num + 1;
        let file = File::create(segment_path(&self.dir, next))?;
        core.writer.sync_data()?;
        core.writer = file;
        core.tail = BinlogOffset::new(next, 0);
        Ok(())
    }

    /// Flushes the current segment to disk.
    pub fn sync(&self) -> Result<()> {
        let core = self.core.lock();
        core.writer.sync_data()?;
        Ok(())
    }

    pub fn latest_offset(&self) -> BinlogOffset {
        self.core.lock().tail
    }

    pub fn earliest_offset(&self) -> BinlogOffset {
        self.core.lock().earliest
    }

    /// Whether a follower could resume streaming from `offset`: it must lie
    /// between the earliest retained position and the tail.
    pub fn contains(&self, offset: BinlogOffset) -> bool {
        let core = self.core.lock();
        offset >= core.earliest && offset <= core.tail
    }

    /// Recovery-only: discards everything after `offset` and resumes
    /// appending there. `offset` must not precede the earliest retained
    /// position.
    pub fn truncate(&self, offset: BinlogOffset) -> Result<()> {
        let mut core = self.core.lock();
        if offset < core.earliest || offset > core.tail {
            return Err(Error::InvalidArgument(format!(
                "truncate target {offset} outside [{}, {}]",
                core.earliest, core.tail
            )));
        }
        for file_num in (offset.file_num + 1)..=core.tail.file_num {
            std::fs::remove_file(segment_path(&self.dir, file_num))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .open(segment_path(&self.dir, offset.file_num))?;
        file.set_len(offset.offset)?;
        core.writer = file;
        core.writer.seek(SeekFrom::End(0))?;
        core.tail = offset;
        Ok(())
    }

    /// Catch-up fallback: abandons the local log entirely and repositions
    /// the producer at `offset`, so the next append lands exactly there.
    /// Used when the master dictates a resume point this replica does not
    /// hold, which makes the discarded suffix (and prefix) unusable anyway.
    pub fn reset_to(&self, offset: BinlogOffset) -> Result<()> {
        let mut core = self.core.lock();
        let file_nums: Vec<u32> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                parse_segment_name(&entry.file_name().to_string_lossy())
            })
            .collect();
        for file_num in file_nums {
            std::fs::remove_file(segment_path(&self.dir, file_num))?;
        }
        write_genesis(&self.dir, offset)?;
        let file = File::create(segment_path(&self.dir, offset.file_num))?;
        file.set_len(offset.offset)?;
        core.writer = file;
        core.writer.seek(SeekFrom::End(0))?;
        core.tail = offset;
        core.earliest = offset;
        Ok(())
    }

    /// Deletes segments strictly below `file_num`. The caller is responsible
    /// for eligibility (send cursors and the retention watermark).
    pub fn purge_to(&self, file_num: u32) -> Result<u32> {
        let mut core = self.core.lock();
        let upper = file_num.min(core.tail.file_num);
        let mut purged = 0;
        for num in core.earliest.file_num..upper {
            std::fs::remove_file(segment_path(&self.dir, num))?;
            purged += 1;
        }
        if upper > core.earliest.file_num {
            core.earliest = BinlogOffset::new(upper, 0);
        }
        Ok(purged)
    }

}

/// Sequential reader over the log. `next` transparently crosses segment
/// boundaries and returns `None` at the tail, so a caller may poll it again
/// after more appends.
pub struct BinlogReader {
    binlog: Arc<Binlog>,
    pos: BinlogOffset,
    file: Option<(u32, File)>,
}

impl BinlogReader {
    /// A reader positioned at `offset`, which must be a record boundary
    /// within the retained log.
    pub fn new(binlog: Arc<Binlog>, offset: BinlogOffset) -> Result<Self> {
        if !binlog.contains(offset) {
            return Err(Error::InvalidArgument(format!(
                "reader position {offset} outside retained log"
            )));
        }
        Ok(Self {
            binlog,
            pos: offset,
            file: None,
        })
    }

    pub fn position(&self) -> BinlogOffset {
        self.pos
    }

    fn segment(&mut self, file_num: u32) -> Result<&mut File> {
        if self.file.as_ref().map(|(num, _)| *num) != Some(file_num) {
            let file = File::open(segment_path(&self.binlog.dir, file_num))?;
            self.file = Some((file_num, file));
        }
        Ok(&mut self.file.as_mut().unwrap().1)
    }

    /// Reads the record at the current position, advancing past it. Only
    /// data at or below the tail is ever touched, so a record is never
    /// observed half-written.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, BinlogOffset)>> {
        let tail = self.binlog.latest_offset();
        if self.pos >= tail {
            return Ok(None);
        }

        // The position may sit at a sealed segment's end: the next record
        // went to the following segment.
        if self.pos.file_num < tail.file_num {
            let len = self.segment(self.pos.file_num)?.metadata()?.len();
            if self.pos.offset >= len {
                self.pos = BinlogOffset::new(self.pos.file_num + 1, 0);
            }
        }

        let pos = self.pos;
        let file = self.segment(pos.file_num)?;
        file.seek(SeekFrom::Start(pos.offset))?;

        let payload_len = file.read_u32::<BigEndian>()? as usize;
        let expected_crc = file.read_u32::<BigEndian>()?;
        if payload_len > MAX_RECORD_LEN {
            return Err(Error::Corruption(format!(
                "binlog record length {payload_len} at {pos} exceeds cap"
            )));
        }
        let mut payload = vec![0u8; payload_len];
        file.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != expected_crc {
            return Err(Error::Corruption(format!(
                "binlog record checksum mismatch at {pos}"
            )));
        }

        self.pos = BinlogOffset::new(
            pos.file_num,
            pos.offset + RECORD_HEADER_LEN + payload_len as u64,
        );
        Ok(Some((payload, self.pos)))
    }
}

/// Scans one segment from `base`, returning the end of the last intact
/// record and truncating anything after it.
fn recover_segment(path: &Path, base: u64) -> Result<u64> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len < base {
        file.set_len(base)?;
        return Ok(base);
    }
    let mut good = base;

    loop {
        if good + RECORD_HEADER_LEN > len {
            break;
        }
        file.seek(SeekFrom::Start(good))?;
        let payload_len = file.read_u32::<BigEndian>()? as u64;
        let expected_crc = file.read_u32::<BigEndian>()?;
        if payload_len as usize > MAX_RECORD_LEN || good + RECORD_HEADER_LEN + payload_len > len {
            break;
        }
        let mut payload = vec![0u8; payload_len as usize];
        file.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != expected_crc {
            break;
        }
        good += RECORD_HEADER_LEN + payload_len;
    }

    if good < len {
        tracing::warn!(
            path = %path.display(),
            tail = len - good,
            "truncating torn binlog tail"
        );
        file.set_len(good)?;
    }
    Ok(good)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path, max_file_size: u64) -> Arc<Binlog> {
        Binlog::open(dir.join("log"), max_file_size).unwrap()
    }

    #[test]
    fn test_append_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let binlog = open(dir.path(), 1024 * 1024);

        let records: Vec<Vec<u8>> = (0..10).map(|i| format!("record_{i}").into_bytes()).collect();
        for record in &records {
            binlog.append(record).unwrap();
        }

        let mut reader = BinlogReader::new(binlog.clone(), BinlogOffset::default()).unwrap();
        for record in &records {
            let (payload, _) = reader.next().unwrap().unwrap();
            assert_eq!(&payload, record);
        }
        assert!(reader.next().unwrap().is_none());
        assert_eq!(reader.position(), binlog.latest_offset());
    }

    #[test]
    fn test_segment_rollover() {
        let dir = tempfile::tempdir().unwrap();
        // Room for two small records per segment.
        let binlog = open(dir.path(), 64);

        let mut offsets = vec![];
        for i in 0..7u32 {
            offsets.push(binlog.append(format!("rec{i:017}").as_bytes()).unwrap());
        }
        assert!(binlog.latest_offset().file_num >= 2);

        // Records straddling rollovers read back identically and in order.
        let mut reader = BinlogReader::new(binlog.clone(), BinlogOffset::default()).unwrap();
        for i in 0..7u32 {
            let (payload, end) = reader.next().unwrap().unwrap();
            assert_eq!(payload, format!("rec{i:017}").into_bytes());
            assert_eq!(end, offsets[i as usize]);
        }
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn test_reader_resumes_after_appends() {
        let dir = tempfile::tempdir().unwrap();
        let binlog = open(dir.path(), 1024);

        binlog.append(b"a").unwrap();
        let mut reader = BinlogReader::new(binlog.clone(), BinlogOffset::default()).unwrap();
        assert!(reader.next().unwrap().is_some());
        assert!(reader.next().unwrap().is_none());

        binlog.append(b"b").unwrap();
        let (payload, _) = reader.next().unwrap().unwrap();
        assert_eq!(payload, b"b");
    }

    #[test]
    fn test_recovery_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let good_tail;
        {
            let binlog = open(dir.path(), 1024 * 1024);
            binlog.append(b"one").unwrap();
            good_tail = binlog.append(b"two").unwrap();
        }
        // Simulate a crash mid-append: half a record at the tail.
        let path = dir.path().join("log").join("binlog-0");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0, 0, 0, 42, 1, 2]).unwrap();
        drop(file);

        let binlog = open(dir.path(), 1024 * 1024);
        assert_eq!(binlog.latest_offset(), good_tail);

        let mut reader = BinlogReader::new(binlog.clone(), BinlogOffset::default()).unwrap();
        assert_eq!(reader.next().unwrap().unwrap().0, b"one");
        assert_eq!(reader.next().unwrap().unwrap().0, b"two");
        assert!(reader.next().unwrap().is_none());

        // Appends resume cleanly at the truncated tail.
        let after = binlog.append(b"three").unwrap();
        assert!(after > good_tail);
    }

    #[test]
    fn test_recovery_detects_corrupt_payload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let binlog = open(dir.path(), 1024 * 1024);
            binlog.append(b"aaaa").unwrap();
            binlog.append(b"bbbb").unwrap();
        }
        let path = dir.path().join("log").join("binlog-0");
        let mut content = std::fs::read(&path).unwrap();
        // Flip a byte inside the second record's payload.
        let n = content.len();
        content[n - 1] ^= 0xff;
        std::fs::write(&path, content).unwrap();

        let binlog = open(dir.path(), 1024 * 1024);
        // Only the first record survives.
        assert_eq!(binlog.latest_offset().offset, 8 + 4);
    }

    #[test]
    fn test_purge_and_contains() {
        let dir = tempfile::tempdir().unwrap();
        let binlog = open(dir.path(), 64);
        for i in 0..12u32 {
            binlog.append(format!("rec{i:017}").as_bytes()).unwrap();
        }
        let tail = binlog.latest_offset();
        assert!(tail.file_num >= 3);

        let purged = binlog.purge_to(2).unwrap();
        assert_eq!(purged, 2);
        assert_eq!(binlog.earliest_offset(), BinlogOffset::new(2, 0));
        assert!(!binlog.contains(BinlogOffset::new(1, 0)));
        assert!(binlog.contains(tail));
        assert!(BinlogReader::new(binlog.clone(), BinlogOffset::new(0, 0)).is_err());

        // Purging never removes the active segment.
        binlog.purge_to(u32::MAX).unwrap();
        assert!(binlog.contains(tail));
        assert_eq!(binlog.earliest_offset().file_num, tail.file_num);
    }

    #[test]
    fn test_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let binlog = open(dir.path(), 1024 * 1024);
        binlog.append(b"one").unwrap();
        let keep = binlog.append(b"two").unwrap();
        binlog.append(b"three").unwrap();

        binlog.truncate(keep).unwrap();
        assert_eq!(binlog.latest_offset(), keep);

        binlog.append(b"replacement").unwrap();
        let mut reader = BinlogReader::new(binlog.clone(), keep).unwrap();
        assert_eq!(reader.next().unwrap().unwrap().0, b"replacement");
    }

    #[test]
    fn test_reset_to() {
        let dir = tempfile::tempdir().unwrap();
        let binlog = open(dir.path(), 1024 * 1024);
        binlog.append(b"old").unwrap();

        let target = BinlogOffset::new(5, 300);
        binlog.reset_to(target).unwrap();
        assert_eq!(binlog.latest_offset(), target);
        assert_eq!(binlog.earliest_offset(), target);

        let end = binlog.append(b"new").unwrap();
        assert_eq!(end, BinlogOffset::new(5, 300 + 8 + 3));
        let mut reader = BinlogReader::new(binlog.clone(), target).unwrap();
        assert_eq!(reader.next().unwrap().unwrap().0, b"new");
    }

    #[test]
    fn test_reopen_after_reset() {
        let dir = tempfile::tempdir().unwrap();
        let target = BinlogOffset::new(3, 128);
        let end;
        {
            let binlog = open(dir.path(), 1024 * 1024);
            binlog.append(b"doomed").unwrap();
            binlog.reset_to(target).unwrap();
            end = binlog.append(b"kept").unwrap();
        }

        // The hole before the reset point must not confuse recovery.
        let binlog = open(dir.path(), 1024 * 1024);
        assert_eq!(binlog.latest_offset(), end);
        assert_eq!(binlog.earliest_offset(), target);
        let mut reader = BinlogReader::new(binlog.clone(), target).unwrap();
        assert_eq!(reader.next().unwrap().unwrap().0, b"kept");
        assert!(reader.next().unwrap().is_none());
    }
}
