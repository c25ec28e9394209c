// Write-ahead log.
//
// Append-only, single-file log whose byte positions are the LSNs handed
// out across the crate. The host database would normally own this; here it
// is reduced to exactly what the coordination subsystems consume: append
// with captured (start, end) LSNs, explicit flush as the durability event,
// and a replay iterator for recovery.
//
// On-disk layout:
//
// ```text
// file      := header record*
// header    := magic:u32 LE, version:u32 LE
// record    := body_len:u32 LE, kind:u8, crc:u32 LE, body
// ```
//
// The CRC32C covers the kind byte and the body. A record's start LSN is
// the offset of its frame; its end LSN is the offset just past the body.
// Replay stops at the first torn or mismatching record, which truncates a
// partial tail after a crash.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::{
    DatabaseId, FdwXactId, Lsn, ServerId, TransactionId, UserId, UserMappingId,
};
use crate::error::Result;

const WAL_MAGIC: u32 = 0x5746_5841; // "AXFW"
const WAL_VERSION: u32 = 1;
const WAL_HEADER_LEN: u64 = 8;
const FRAME_OVERHEAD: u64 = 9; // body_len + kind + crc

const KIND_FDWXACT_INSERT: u8 = 0x01;
const KIND_FDWXACT_REMOVE: u8 = 0x02;
const KIND_XACT_COMMIT: u8 = 0x10;
const KIND_XACT_ABORT: u8 = 0x11;
const KIND_CHECKPOINT: u8 = 0x20;

/// A decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// A participant was prepared under a distributed transaction.
    FdwXactInsert {
        dbid: DatabaseId,
        serverid: ServerId,
        userid: UserId,
        umid: UserMappingId,
        local_xid: TransactionId,
        fdwxact_id: FdwXactId,
    },
    /// A prepared participant reached its terminal resolution.
    FdwXactRemove {
        dbid: DatabaseId,
        serverid: ServerId,
        userid: UserId,
        local_xid: TransactionId,
    },
    /// Local transaction committed.
    XactCommit { xid: TransactionId },
    /// Local transaction aborted.
    XactAbort { xid: TransactionId },
    /// Checkpoint with the redo horizon in force when it was taken.
    Checkpoint { redo_horizon: Lsn },
}

impl WalRecord {
    fn kind(&self) -> u8 {
        match self {
            WalRecord::FdwXactInsert { .. } => KIND_FDWXACT_INSERT,
            WalRecord::FdwXactRemove { .. } => KIND_FDWXACT_REMOVE,
            WalRecord::XactCommit { .. } => KIND_XACT_COMMIT,
            WalRecord::XactAbort { .. } => KIND_XACT_ABORT,
            WalRecord::Checkpoint { .. } => KIND_CHECKPOINT,
        }
    }

    /// Encodes the record body. Integers are little-endian; the
    /// prepared-transaction identifier is length-prefixed with a u16.
    fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        match self {
            WalRecord::FdwXactInsert {
                dbid,
                serverid,
                userid,
                umid,
                local_xid,
                fdwxact_id,
            } => {
                buf.put_u32_le(*dbid);
                buf.put_u32_le(*serverid);
                buf.put_u32_le(*userid);
                buf.put_u32_le(*umid);
                buf.put_u32_le(*local_xid);
                buf.put_u16_le(fdwxact_id.len() as u16);
                buf.put_slice(fdwxact_id.as_bytes());
            }
            WalRecord::FdwXactRemove {
                dbid,
                serverid,
                userid,
                local_xid,
            } => {
                buf.put_u32_le(*dbid);
                buf.put_u32_le(*serverid);
                buf.put_u32_le(*userid);
                buf.put_u32_le(*local_xid);
            }
            WalRecord::XactCommit { xid } => buf.put_u32_le(*xid),
            WalRecord::XactAbort { xid } => buf.put_u32_le(*xid),
            WalRecord::Checkpoint { redo_horizon } => buf.put_u64_le(*redo_horizon),
        }
        buf
    }

    fn decode_body(kind: u8, mut body: &[u8]) -> Option<WalRecord> {
        match kind {
            KIND_FDWXACT_INSERT => {
                if body.remaining() < 22 {
                    return None;
                }
                let dbid = body.get_u32_le();
                let serverid = body.get_u32_le();
                let userid = body.get_u32_le();
                let umid = body.get_u32_le();
                let local_xid = body.get_u32_le();
                let id_len = body.get_u16_le() as usize;
                if body.remaining() != id_len {
                    return None;
                }
                let fdwxact_id = FdwXactId::new(body.copy_to_bytes(id_len).to_vec()).ok()?;
                Some(WalRecord::FdwXactInsert {
                    dbid,
                    serverid,
                    userid,
                    umid,
                    local_xid,
                    fdwxact_id,
                })
            }
            KIND_FDWXACT_REMOVE => {
                if body.remaining() != 16 {
                    return None;
                }
                Some(WalRecord::FdwXactRemove {
                    dbid: body.get_u32_le(),
                    serverid: body.get_u32_le(),
                    userid: body.get_u32_le(),
                    local_xid: body.get_u32_le(),
                })
            }
            KIND_XACT_COMMIT => {
                if body.remaining() != 4 {
                    return None;
                }
                Some(WalRecord::XactCommit {
                    xid: body.get_u32_le(),
                })
            }
            KIND_XACT_ABORT => {
                if body.remaining() != 4 {
                    return None;
                }
                Some(WalRecord::XactAbort {
                    xid: body.get_u32_le(),
                })
            }
            KIND_CHECKPOINT => {
                if body.remaining() != 8 {
                    return None;
                }
                Some(WalRecord::Checkpoint {
                    redo_horizon: body.get_u64_le(),
                })
            }
            _ => None,
        }
    }
}

struct WalFile {
    writer: BufWriter<File>,
    write_pos: u64,
}

/// The write-ahead log handle.
///
/// Appends serialize on an internal lock; LSN reads are lock-free.
pub struct Wal {
    file: Mutex<WalFile>,
    current_lsn: AtomicU64,
    flushed_lsn: AtomicU64,
    redo_horizon: AtomicU64,
    path: PathBuf,
}

impl Wal {
    /// Opens the log, creating it if absent. On open, a torn tail left by
    /// a crash is truncated to the last intact record boundary.
    pub fn open_or_create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let end = if exists {
            let valid_end = scan_valid_end(&mut file)?;
            file.set_len(valid_end)?;
            file.seek(SeekFrom::Start(valid_end))?;
            valid_end
        } else {
            let mut header = Vec::with_capacity(WAL_HEADER_LEN as usize);
            header.put_u32_le(WAL_MAGIC);
            header.put_u32_le(WAL_VERSION);
            file.write_all(&header)?;
            file.sync_all()?;
            WAL_HEADER_LEN
        };

        debug!(path = %path.display(), end, "write-ahead log opened");
        Ok(Self {
            file: Mutex::new(WalFile {
                writer: BufWriter::new(file),
                write_pos: end,
            }),
            current_lsn: AtomicU64::new(end),
            flushed_lsn: AtomicU64::new(end),
            redo_horizon: AtomicU64::new(WAL_HEADER_LEN),
            path,
        })
    }

    /// Appends a record and returns its (start, end) LSNs. The record is
    /// durable only after a `flush` whose result covers the end LSN.
    pub fn append(&self, record: &WalRecord) -> Result<(Lsn, Lsn)> {
        let body = record.encode_body();
        let kind = record.kind();
        let crc = crc32c::crc32c_append(crc32c::crc32c(&[kind]), &body);

        let mut frame = Vec::with_capacity(FRAME_OVERHEAD as usize + body.len());
        frame.put_u32_le(body.len() as u32);
        frame.put_u8(kind);
        frame.put_u32_le(crc);
        frame.put_slice(&body);

        let mut file = self.file.lock();
        let start = file.write_pos;
        file.writer.write_all(&frame)?;
        file.write_pos += frame.len() as u64;
        let end = file.write_pos;
        self.current_lsn.store(end, Ordering::Release);
        Ok((start, end))
    }

    /// Flushes everything appended so far and returns the durable LSN.
    /// This is the commit durability event.
    pub fn flush(&self) -> Result<Lsn> {
        let mut file = self.file.lock();
        file.writer.flush()?;
        file.writer.get_ref().sync_data()?;
        let end = file.write_pos;
        self.flushed_lsn.store(end, Ordering::Release);
        Ok(end)
    }

    pub fn current_lsn(&self) -> Lsn {
        self.current_lsn.load(Ordering::Acquire)
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::Acquire)
    }

    /// Records a checkpoint. Entries inserted at or below the returned
    /// redo horizon must be carried by state files rather than by WAL
    /// replay, which makes earlier segments eligible for recycling.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let horizon = self.flush()?;
        self.append(&WalRecord::Checkpoint {
            redo_horizon: horizon,
        })?;
        self.flush()?;
        self.redo_horizon.store(horizon, Ordering::Release);
        Ok(horizon)
    }

    /// The WAL position below which replay is not required.
    pub fn recycle_point(&self) -> Lsn {
        self.redo_horizon.load(Ordering::Acquire)
    }

    /// Opens an independent replay cursor over the flushed log.
    pub fn reader(&self) -> Result<WalReader> {
        WalReader::open(&self.path)
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("current_lsn", &self.current_lsn())
            .field("flushed_lsn", &self.flushed_lsn())
            .finish()
    }
}

/// Sequential reader over the log, yielding `(start_lsn, end_lsn, record)`.
///
/// Iteration ends at the first torn or corrupt frame; a damaged tail
/// reads the same as the end of the log.
pub struct WalReader {
    reader: BufReader<File>,
    pos: u64,
}

impl WalReader {
    fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header = [0u8; WAL_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        let mut slice = &header[..];
        let magic = slice.get_u32_le();
        let version = slice.get_u32_le();
        if magic != WAL_MAGIC || version != WAL_VERSION {
            warn!(magic, version, "unrecognized write-ahead log header");
        }
        Ok(Self {
            reader: BufReader::new(file),
            pos: WAL_HEADER_LEN,
        })
    }

    fn read_one(&mut self) -> Option<(Lsn, Lsn, WalRecord)> {
        let start = self.pos;
        let mut frame_head = [0u8; FRAME_OVERHEAD as usize];
        if self.reader.read_exact(&mut frame_head).is_err() {
            return None;
        }
        let mut head = &frame_head[..];
        let body_len = head.get_u32_le() as usize;
        let kind = head.get_u8();
        let crc = head.get_u32_le();

        let mut body = vec![0u8; body_len];
        if self.reader.read_exact(&mut body).is_err() {
            warn!(lsn = start, "torn record at end of write-ahead log");
            return None;
        }
        let actual = crc32c::crc32c_append(crc32c::crc32c(&[kind]), &body);
        if actual != crc {
            warn!(lsn = start, expected = crc, actual, "bad record checksum, ending replay");
            return None;
        }
        let record = WalRecord::decode_body(kind, &body)?;
        self.pos = start + FRAME_OVERHEAD + body_len as u64;
        Some((start, self.pos, record))
    }
}

impl Iterator for WalReader {
    type Item = (Lsn, Lsn, WalRecord);

    fn next(&mut self) -> Option<Self::Item> {
        self.read_one()
    }
}

/// Scans an existing log and returns the offset just past the last intact
/// record.
fn scan_valid_end(file: &mut File) -> Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; WAL_HEADER_LEN as usize];
    if file.read_exact(&mut header).is_err() {
        // Shorter than a header: treat as empty and rewrite below.
        file.seek(SeekFrom::Start(0))?;
        let mut fresh = Vec::with_capacity(WAL_HEADER_LEN as usize);
        fresh.put_u32_le(WAL_MAGIC);
        fresh.put_u32_le(WAL_VERSION);
        file.write_all(&fresh)?;
        file.sync_all()?;
        return Ok(WAL_HEADER_LEN);
    }

    let mut reader = BufReader::new(file.try_clone()?);
    let mut pos = WAL_HEADER_LEN;
    loop {
        let mut frame_head = [0u8; FRAME_OVERHEAD as usize];
        if reader.read_exact(&mut frame_head).is_err() {
            break;
        }
        let mut head = &frame_head[..];
        let body_len = head.get_u32_le() as usize;
        let kind = head.get_u8();
        let crc = head.get_u32_le();
        let mut body = vec![0u8; body_len];
        if reader.read_exact(&mut body).is_err() {
            break;
        }
        if crc32c::crc32c_append(crc32c::crc32c(&[kind]), &body) != crc {
            break;
        }
        pos += FRAME_OVERHEAD + body_len as u64;
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn insert_record(xid: TransactionId, serverid: ServerId) -> WalRecord {
        WalRecord::FdwXactInsert {
            dbid: 1,
            serverid,
            userid: 10,
            umid: 100,
            local_xid: xid,
            fdwxact_id: FdwXactId::new(format!("fx_{}_{}", xid, serverid).into_bytes()).unwrap(),
        }
    }

    #[test]
    fn test_append_flush_replay_round_trip() {
        let dir = tempdir().unwrap();
        let wal = Wal::open_or_create(dir.path().join("wal")).unwrap();

        let rec1 = insert_record(7, 2);
        let rec2 = WalRecord::FdwXactRemove {
            dbid: 1,
            serverid: 2,
            userid: 10,
            local_xid: 7,
        };
        let (start1, end1) = wal.append(&rec1).unwrap();
        let (start2, _end2) = wal.append(&rec2).unwrap();
        assert!(start1 < end1);
        assert_eq!(end1, start2);
        wal.flush().unwrap();

        let replayed: Vec<_> = wal.reader().unwrap().map(|(_, _, r)| r).collect();
        assert_eq!(replayed, vec![rec1, rec2]);
    }

    #[test]
    fn test_lsns_advance_and_flush_tracks() {
        let dir = tempdir().unwrap();
        let wal = Wal::open_or_create(dir.path().join("wal")).unwrap();
        assert_eq!(wal.current_lsn(), wal.flushed_lsn());

        wal.append(&WalRecord::XactCommit { xid: 3 }).unwrap();
        assert!(wal.current_lsn() > wal.flushed_lsn());
        wal.flush().unwrap();
        assert_eq!(wal.current_lsn(), wal.flushed_lsn());
    }

    #[test]
    fn test_reopen_after_flush_preserves_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        {
            let wal = Wal::open_or_create(&path).unwrap();
            wal.append(&insert_record(9, 4)).unwrap();
            wal.flush().unwrap();
        }
        let wal = Wal::open_or_create(&path).unwrap();
        let replayed: Vec<_> = wal.reader().unwrap().collect();
        assert_eq!(replayed.len(), 1);
        assert!(matches!(
            replayed[0].2,
            WalRecord::FdwXactInsert { local_xid: 9, .. }
        ));
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        {
            let wal = Wal::open_or_create(&path).unwrap();
            wal.append(&WalRecord::XactCommit { xid: 1 }).unwrap();
            wal.flush().unwrap();
        }
        // Simulate a torn write.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xAA, 0xBB, 0xCC]).unwrap();
        }
        let wal = Wal::open_or_create(&path).unwrap();
        let replayed: Vec<_> = wal.reader().unwrap().collect();
        assert_eq!(replayed.len(), 1);
        // The log must accept appends cleanly after truncation.
        wal.append(&WalRecord::XactAbort { xid: 2 }).unwrap();
        wal.flush().unwrap();
        assert_eq!(wal.reader().unwrap().count(), 2);
    }

    #[test]
    fn test_checkpoint_sets_recycle_point() {
        let dir = tempdir().unwrap();
        let wal = Wal::open_or_create(dir.path().join("wal")).unwrap();
        wal.append(&WalRecord::XactCommit { xid: 5 }).unwrap();
        let horizon = wal.checkpoint().unwrap();
        assert_eq!(wal.recycle_point(), horizon);
        assert!(wal
            .reader()
            .unwrap()
            .any(|(_, _, r)| matches!(r, WalRecord::Checkpoint { .. })));
    }

    #[test]
    fn test_insert_body_is_little_endian_with_len_prefix() {
        let rec = insert_record(0x01020304, 0x0A0B0C0D);
        let body = rec.encode_body();
        // dbid
        assert_eq!(&body[0..4], &1u32.to_le_bytes());
        // serverid
        assert_eq!(&body[4..8], &0x0A0B0C0Du32.to_le_bytes());
        // local_xid at offset 16
        assert_eq!(&body[16..20], &0x01020304u32.to_le_bytes());
        // id length prefix
        let id_len = u16::from_le_bytes([body[20], body[21]]) as usize;
        assert_eq!(body.len(), 22 + id_len);
    }
}
