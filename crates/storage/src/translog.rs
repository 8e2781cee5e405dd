//! Transaction (undo) log
//!
//! Two log files rotate as the write-ahead undo log for chunk creation.
//! Each record describes one chunk (or tombstone) created by an
//! uncommitted version; replaying a log in order and rewriting the named
//! descriptor slots rolls a partial version back. Records are fixed
//! size, CRC-checked, and every append also writes an all-zero
//! terminator record so a reader always finds a definite end of log.
//!
//! # Record layout (144 bytes)
//!
//! ```text
//! ┌──────┬──────┬────────────────────────────────┐
//! │ off  │ size │ field                          │
//! ├──────┼──────┼────────────────────────────────┤
//! │ 0    │ 8    │ array_uaid (0 = end of log)    │
//! │ 8    │ 8    │ array_id                       │
//! │ 16   │ 8    │ version                        │
//! │ 24   │ 96   │ chunk header                   │
//! │ 120  │ 8    │ old_size                       │
//! │ 128  │ 4    │ hdr_crc (CRC32 of bytes 0-127) │
//! │ 132  │ 12   │ reserved (zero)                │
//! └──────┴──────┴────────────────────────────────┘
//! ```
//!
//! `old_size` bytes of old image follow a record; fresh writes and
//! tombstones always log `old_size = 0`. The files are opened with
//! synchronous writes, so an append is durable when it returns.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tessera_core::{ChunkHeader, Result, CHUNK_HEADER_SIZE};
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::fs::{FileExt, OpenOptionsExt};

/// Serialized size of one log record.
pub const TRANS_LOG_RECORD_SIZE: usize = 144;

const CRC_OFFSET: usize = 128;

/// One undo-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransLogRecord {
    /// Unversioned array the chunk belongs to; zero marks end of log.
    pub array_uaid: u64,
    /// Versioned array id of the chunk.
    pub array_id: u64,
    /// Version sequence number being created.
    pub version: u64,
    /// Copy of the chunk header as written.
    pub hdr: ChunkHeader,
    /// Length of the old image following the record (always 0 here).
    pub old_size: u64,
    /// CRC32 over the record body.
    pub hdr_crc: u32,
}

impl TransLogRecord {
    /// Build a record for a freshly created chunk, computing the CRC.
    pub fn new(array_uaid: u64, array_id: u64, version: u64, hdr: ChunkHeader) -> Self {
        let mut rec = TransLogRecord {
            array_uaid,
            array_id,
            version,
            hdr,
            old_size: 0,
            hdr_crc: 0,
        };
        rec.hdr_crc = rec.compute_crc();
        rec
    }

    fn body_bytes(&self) -> [u8; CRC_OFFSET] {
        let mut b = [0u8; CRC_OFFSET];
        b[0..8].copy_from_slice(&self.array_uaid.to_le_bytes());
        b[8..16].copy_from_slice(&self.array_id.to_le_bytes());
        b[16..24].copy_from_slice(&self.version.to_le_bytes());
        b[24..24 + CHUNK_HEADER_SIZE].copy_from_slice(&self.hdr.to_bytes());
        b[120..128].copy_from_slice(&self.old_size.to_le_bytes());
        b
    }

    fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.body_bytes());
        hasher.finalize()
    }

    /// True when the stored CRC matches the record body.
    pub fn crc_ok(&self) -> bool {
        self.hdr_crc == self.compute_crc()
    }

    /// Serialize to the fixed layout.
    pub fn to_bytes(&self) -> [u8; TRANS_LOG_RECORD_SIZE] {
        let mut b = [0u8; TRANS_LOG_RECORD_SIZE];
        b[..CRC_OFFSET].copy_from_slice(&self.body_bytes());
        b[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&self.hdr_crc.to_le_bytes());
        b
    }

    /// Deserialize from the fixed layout.
    pub fn from_bytes(b: &[u8; TRANS_LOG_RECORD_SIZE]) -> Self {
        let hdr_bytes: [u8; CHUNK_HEADER_SIZE] = b[24..24 + CHUNK_HEADER_SIZE].try_into().unwrap();
        TransLogRecord {
            array_uaid: u64::from_le_bytes(b[0..8].try_into().unwrap()),
            array_id: u64::from_le_bytes(b[8..16].try_into().unwrap()),
            version: u64::from_le_bytes(b[16..24].try_into().unwrap()),
            hdr: ChunkHeader::from_bytes(&hdr_bytes),
            old_size: u64::from_le_bytes(b[120..128].try_into().unwrap()),
            hdr_crc: u32::from_le_bytes(b[CRC_OFFSET..CRC_OFFSET + 4].try_into().unwrap()),
        }
    }
}

/// The two-file rotating transaction log.
pub struct TransLog {
    files: [File; 2],
    paths: [PathBuf; 2],
    curr: usize,
    log_size: u64,
    size_limit: u64,
}

impl TransLog {
    /// Open (creating as needed) `<base>_1` and `<base>_2` with
    /// synchronous write semantics. `size_limit` is the per-file byte
    /// limit driving rotation.
    pub fn open(base: &Path, size_limit: u64) -> Result<Self> {
        let paths = [
            with_suffix(base, "_1"),
            with_suffix(base, "_2"),
        ];
        let open = |p: &PathBuf| -> Result<File> {
            let mut opts = OpenOptions::new();
            opts.read(true).write(true).create(true);
            #[cfg(unix)]
            opts.custom_flags(libc::O_SYNC);
            Ok(opts.open(p)?)
        };
        let files = [open(&paths[0])?, open(&paths[1])?];
        Ok(TransLog {
            files,
            paths,
            curr: 0,
            log_size: 0,
            size_limit,
        })
    }

    /// Index of the active log file (0 or 1).
    pub fn current_log(&self) -> usize {
        self.curr
    }

    /// Bytes appended to the active file since its last reset.
    pub fn log_size(&self) -> u64 {
        self.log_size
    }

    /// Append a record (plus the end-of-log terminator) durably.
    ///
    /// Rotates to the other file when the active one would exceed the
    /// size limit, truncating it first.
    pub fn append(&mut self, rec: &TransLogRecord) -> Result<()> {
        debug_assert!(rec.array_uaid != 0);
        debug_assert!(rec.crc_ok());
        if self.log_size + TRANS_LOG_RECORD_SIZE as u64 > self.size_limit {
            self.curr ^= 1;
            self.log_size = 0;
            self.files[self.curr].set_len(0)?;
            debug!(log = self.curr, "rotated transaction log");
        }
        // Record and terminator in one synchronous write.
        let mut buf = [0u8; TRANS_LOG_RECORD_SIZE * 2];
        buf[..TRANS_LOG_RECORD_SIZE].copy_from_slice(&rec.to_bytes());
        self.files[self.curr].write_all_at(&buf, self.log_size)?;
        self.log_size += TRANS_LOG_RECORD_SIZE as u64;
        Ok(())
    }

    /// Read every valid record of log file `index`, stopping at the
    /// terminator, a short read, or a CRC mismatch.
    pub fn records(&self, index: usize) -> Result<Vec<TransLogRecord>> {
        let file = &self.files[index];
        let len = file.metadata()?.len();
        let mut out = Vec::new();
        let mut pos = 0u64;
        loop {
            if pos + TRANS_LOG_RECORD_SIZE as u64 > len {
                break;
            }
            let mut buf = [0u8; TRANS_LOG_RECORD_SIZE];
            file.read_exact_at(&mut buf, pos)?;
            let rec = TransLogRecord::from_bytes(&buf);
            if rec.array_uaid == 0 {
                break;
            }
            if !rec.crc_ok() {
                warn!(
                    log = index,
                    pos,
                    "transaction log record failed CRC check, truncating replay"
                );
                break;
            }
            pos += TRANS_LOG_RECORD_SIZE as u64 + rec.old_size;
            out.push(rec);
        }
        Ok(out)
    }

    /// Truncate both files; used once recovery has fully replayed them.
    pub fn reset(&mut self) -> Result<()> {
        for f in &self.files {
            f.set_len(0)?;
        }
        self.curr = 0;
        self.log_size = 0;
        Ok(())
    }

    /// Paths of the two log files.
    pub fn paths(&self) -> (&Path, &Path) {
        (&self.paths[0], &self.paths[1])
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tessera_core::{ChunkFlags, DiskPos};

    fn record(uaid: u64, arr_id: u64, version: u64, offs: u64) -> TransLogRecord {
        let hdr = ChunkHeader {
            arr_id,
            allocated_size: 256,
            pos: DiskPos {
                ds_guid: uaid,
                offs,
                hdr_pos: 64,
            },
            ..ChunkHeader::default()
        };
        TransLogRecord::new(uaid, arr_id, version, hdr)
    }

    #[test]
    fn record_roundtrip_and_crc() {
        let rec = record(5, 7, 2, 1024);
        assert!(rec.crc_ok());
        let parsed = TransLogRecord::from_bytes(&rec.to_bytes());
        assert_eq!(parsed, rec);
        assert!(parsed.crc_ok());

        let mut bytes = rec.to_bytes();
        bytes[30] ^= 0xFF; // corrupt the header copy
        assert!(!TransLogRecord::from_bytes(&bytes).crc_ok());
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempdir().unwrap();
        let mut log = TransLog::open(&dir.path().join("db.log"), 1 << 20).unwrap();
        let recs: Vec<_> = (0..5).map(|i| record(1, 3, 2, i * 256)).collect();
        for r in &recs {
            log.append(r).unwrap();
        }
        let read = log.records(0).unwrap();
        assert_eq!(read, recs);
        // The other log is empty.
        assert!(log.records(1).unwrap().is_empty());
    }

    #[test]
    fn terminator_hides_stale_tail() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("db.log");
        let mut log = TransLog::open(&base, 1 << 20).unwrap();
        for i in 0..4 {
            log.append(&record(1, 3, 2, i * 256)).unwrap();
        }
        drop(log);
        // Reopen: appends restart at position 0, overwriting; old records
        // past the new terminator must not be replayed.
        let mut log = TransLog::open(&base, 1 << 20).unwrap();
        log.append(&record(2, 9, 4, 0)).unwrap();
        let read = log.records(0).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].array_uaid, 2);
    }

    #[test]
    fn rotation_switches_files() {
        let dir = tempdir().unwrap();
        // Limit fits exactly two records.
        let limit = (TRANS_LOG_RECORD_SIZE * 2) as u64;
        let mut log = TransLog::open(&dir.path().join("db.log"), limit).unwrap();
        log.append(&record(1, 1, 1, 0)).unwrap();
        log.append(&record(1, 1, 1, 256)).unwrap();
        assert_eq!(log.current_log(), 0);
        log.append(&record(1, 1, 1, 512)).unwrap();
        assert_eq!(log.current_log(), 1);
        assert_eq!(log.log_size(), TRANS_LOG_RECORD_SIZE as u64);
        assert_eq!(log.records(0).unwrap().len(), 2);
        assert_eq!(log.records(1).unwrap().len(), 1);
    }

    #[test]
    fn crc_mismatch_truncates_replay() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("db.log");
        let mut log = TransLog::open(&base, 1 << 20).unwrap();
        for i in 0..3 {
            log.append(&record(1, 3, 2, i * 256)).unwrap();
        }
        drop(log);
        // Flip a byte in the second record on disk.
        let path = with_suffix(&base, "_1");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[TRANS_LOG_RECORD_SIZE + 40] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let log = TransLog::open(&base, 1 << 20).unwrap();
        let read = log.records(0).unwrap();
        assert_eq!(read.len(), 1, "replay stops at the corrupt record");
    }

    #[test]
    fn reset_clears_both_files() {
        let dir = tempdir().unwrap();
        let mut log = TransLog::open(&dir.path().join("db.log"), 1 << 20).unwrap();
        log.append(&record(1, 1, 1, 0)).unwrap();
        log.reset().unwrap();
        assert!(log.records(0).unwrap().is_empty());
        assert!(log.records(1).unwrap().is_empty());
        assert_eq!(log.log_size(), 0);
    }

    #[test]
    fn tombstone_record_replayable() {
        let dir = tempdir().unwrap();
        let mut log = TransLog::open(&dir.path().join("db.log"), 1 << 20).unwrap();
        let mut hdr = ChunkHeader::default();
        hdr.arr_id = 4;
        hdr.flags.set(ChunkFlags::TOMBSTONE, true);
        hdr.pos.hdr_pos = 288;
        let rec = TransLogRecord::new(9, 4, 3, hdr);
        log.append(&rec).unwrap();
        let read = log.records(0).unwrap();
        assert!(read[0].hdr.is_tombstone());
        assert_eq!(read[0].old_size, 0);
    }
}
