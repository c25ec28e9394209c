// Foreign transaction state files.
//
// At checkpoint, entries whose insertion record sits at or below the redo
// horizon are copied out of the WAL into one file per entry so the covering
// WAL segments can be recycled. Files live in a dedicated directory under
// the data directory and are unlinked on terminal resolution and on remove
// redo.
//
// On-disk layout (all integers little-endian):
//
// ```text
// file   := header id_bytes crc:u32
// header := magic:u32, version:u16, status:u16, local_xid:u32,
//           serverid:u32, userid:u32, umid:u32, fdwxact_id_len:u16
// ```
//
// The CRC32C covers everything before it. A mismatch during recovery is
// fatal: the file is the only surviving copy of the entry.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::common::{FdwXactId, ServerId, TransactionId, UserId, UserMappingId};
use crate::error::{FedXactError, Result};
use crate::fdwxact::entry::FdwXactStatus;

/// Name of the state file directory under the data directory.
pub const FDWXACT_DIR: &str = "pg_fdwxact";

const STATE_FILE_MAGIC: u32 = 0x4658_5354; // "TSXF"
const STATE_FILE_VERSION: u16 = 1;
const HEADER_LEN: usize = 26;

/// The durable image of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFileData {
    pub status: FdwXactStatus,
    pub local_xid: TransactionId,
    pub serverid: ServerId,
    pub userid: UserId,
    pub umid: UserMappingId,
    pub fdwxact_id: FdwXactId,
}

/// Path of the state file for `(xid, serverid, userid)`.
pub fn state_file_path(
    dir: &Path,
    xid: TransactionId,
    serverid: ServerId,
    userid: UserId,
) -> PathBuf {
    dir.join(format!("{:08x}-{:08x}-{:08x}", xid, serverid, userid))
}

/// Writes and fsyncs the state file for an entry.
pub fn write_state_file(dir: &Path, data: &StateFileData) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + data.fdwxact_id.len() + 4);
    buf.put_u32_le(STATE_FILE_MAGIC);
    buf.put_u16_le(STATE_FILE_VERSION);
    buf.put_u16_le(data.status.to_u16());
    buf.put_u32_le(data.local_xid);
    buf.put_u32_le(data.serverid);
    buf.put_u32_le(data.userid);
    buf.put_u32_le(data.umid);
    buf.put_u16_le(data.fdwxact_id.len() as u16);
    buf.put_slice(data.fdwxact_id.as_bytes());
    let crc = crc32c::crc32c(&buf);
    buf.put_u32_le(crc);

    let path = state_file_path(dir, data.local_xid, data.serverid, data.userid);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    debug!(path = %path.display(), "wrote foreign transaction state file");
    Ok(())
}

/// Reads and verifies one state file.
pub fn read_state_file(path: &Path) -> Result<StateFileData> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    if buf.len() < HEADER_LEN + 4 {
        return Err(FedXactError::StateFileInvalid {
            path: path.to_path_buf(),
            reason: format!("file is {} bytes, shorter than the fixed header", buf.len()),
        });
    }

    let (payload, crc_bytes) = buf.split_at(buf.len() - 4);
    let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = crc32c::crc32c(payload);
    if actual != expected {
        return Err(FedXactError::StateFileCorrupt {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }

    let mut cursor = payload;
    let magic = cursor.get_u32_le();
    let version = cursor.get_u16_le();
    if magic != STATE_FILE_MAGIC || version != STATE_FILE_VERSION {
        return Err(FedXactError::StateFileInvalid {
            path: path.to_path_buf(),
            reason: format!("bad magic {:08x} or version {}", magic, version),
        });
    }
    let status_code = cursor.get_u16_le();
    let status = FdwXactStatus::from_u16(status_code).ok_or_else(|| {
        FedXactError::StateFileInvalid {
            path: path.to_path_buf(),
            reason: format!("unknown status code {}", status_code),
        }
    })?;
    let local_xid = cursor.get_u32_le();
    let serverid = cursor.get_u32_le();
    let userid = cursor.get_u32_le();
    let umid = cursor.get_u32_le();
    let id_len = cursor.get_u16_le() as usize;
    if cursor.remaining() != id_len {
        return Err(FedXactError::StateFileInvalid {
            path: path.to_path_buf(),
            reason: format!(
                "identifier length {} does not match remaining payload {}",
                id_len,
                cursor.remaining()
            ),
        });
    }
    let fdwxact_id = FdwXactId::new(cursor.copy_to_bytes(id_len).to_vec())?;

    Ok(StateFileData {
        status,
        local_xid,
        serverid,
        userid,
        umid,
        fdwxact_id,
    })
}

/// Unlinks the state file for an entry if present.
pub fn remove_state_file(
    dir: &Path,
    xid: TransactionId,
    serverid: ServerId,
    userid: UserId,
) -> Result<()> {
    let path = state_file_path(dir, xid, serverid, userid);
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed foreign transaction state file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Reads every state file in the directory. Any corruption is fatal to
/// recovery.
pub fn scan_state_dir(dir: &Path) -> Result<Vec<StateFileData>> {
    let mut found = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        if !dirent.file_type()?.is_file() {
            continue;
        }
        found.push(read_state_file(&dirent.path())?);
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> StateFileData {
        StateFileData {
            status: FdwXactStatus::Prepared,
            local_xid: 0x1234,
            serverid: 7,
            userid: 8,
            umid: 9,
            fdwxact_id: FdwXactId::new(&b"fx_4660_7_8"[..]).unwrap(),
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let data = sample();
        write_state_file(dir.path(), &data).unwrap();

        let path = state_file_path(dir.path(), data.local_xid, data.serverid, data.userid);
        assert!(path.exists());
        assert_eq!(read_state_file(&path).unwrap(), data);
    }

    #[test]
    fn test_path_is_hex_triplet() {
        let path = state_file_path(Path::new("/x"), 0x1234, 7, 8);
        assert_eq!(
            path,
            PathBuf::from("/x/00001234-00000007-00000008")
        );
    }

    #[test]
    fn test_crc_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let data = sample();
        write_state_file(dir.path(), &data).unwrap();

        let path = state_file_path(dir.path(), data.local_xid, data.serverid, data.userid);
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        match read_state_file(&path) {
            Err(FedXactError::StateFileCorrupt { .. }) => {}
            other => panic!("expected corruption error, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let data = sample();
        write_state_file(dir.path(), &data).unwrap();
        remove_state_file(dir.path(), data.local_xid, data.serverid, data.userid).unwrap();
        remove_state_file(dir.path(), data.local_xid, data.serverid, data.userid).unwrap();
    }

    #[test]
    fn test_scan_reads_all_files() {
        let dir = tempdir().unwrap();
        let mut a = sample();
        let mut b = sample();
        b.local_xid = 0x9999;
        a.status = FdwXactStatus::Prepared;
        write_state_file(dir.path(), &a).unwrap();
        write_state_file(dir.path(), &b).unwrap();

        let mut scanned = scan_state_dir(dir.path()).unwrap();
        scanned.sort_by_key(|d| d.local_xid);
        assert_eq!(scanned, vec![a, b]);
    }
}
