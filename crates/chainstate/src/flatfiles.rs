//! Numbered append-only data files (`blk00000.dat`, `rev00000.dat`, ...) and
//! the framed records stored inside them.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use blockd_consensus::Hash256;
use blockd_primitives::hash::Sha256dWriter;
use fs2::FileExt;

/// Magic plus little-endian payload length.
pub const STORAGE_HEADER_BYTES: u32 = 8;
pub const UNDO_CHECKSUM_BYTES: u32 = 32;
/// Space that must stay free on the data volume after any pre-allocation.
pub const MIN_DISK_SPACE: u64 = 52_428_800;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FlatFilePos {
    pub file: u32,
    pub pos: u32,
}

impl FlatFilePos {
    pub fn new(file: u32, pos: u32) -> Self {
        Self { file, pos }
    }
}

impl std::fmt::Display for FlatFilePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FlatFilePos(file={}, pos={})", self.file, self.pos)
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    OutOfSpace { needed: u64 },
    Missing(PathBuf),
    BadMagic { file: u32, pos: u32 },
    Oversize { file: u32, pos: u32, len: u32 },
    InvalidPosition(FlatFilePos),
    ChecksumMismatch(FlatFilePos),
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::OutOfSpace { needed } => {
                write!(f, "disk space is too low ({needed} bytes needed)")
            }
            FlatFileError::Missing(path) => write!(f, "missing file {}", path.display()),
            FlatFileError::BadMagic { file, pos } => {
                write!(f, "block magic mismatch in file {file} at {pos}")
            }
            FlatFileError::Oversize { file, pos, len } => {
                write!(f, "record length {len} in file {file} at {pos} exceeds limit")
            }
            FlatFileError::InvalidPosition(pos) => write!(f, "invalid flat file position {pos}"),
            FlatFileError::ChecksumMismatch(pos) => write!(f, "checksum mismatch at {pos}"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

/// A sequence of numbered files sharing a prefix, grown in fixed chunks.
pub struct FlatFileSeq {
    dir: PathBuf,
    prefix: &'static str,
    chunk_size: u32,
}

impl FlatFileSeq {
    pub fn new(dir: impl Into<PathBuf>, prefix: &'static str, chunk_size: u32) -> Self {
        Self {
            dir: dir.into(),
            prefix,
            chunk_size,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    pub fn file_name(&self, file: u32) -> PathBuf {
        self.dir.join(format!("{}{file:05}.dat", self.prefix))
    }

    pub fn exists(&self, file: u32) -> bool {
        self.file_name(file).is_file()
    }

    /// Opens the file holding `pos` and seeks to it. Writable opens create the
    /// file when absent.
    pub fn open(&self, pos: FlatFilePos, read_only: bool) -> Result<File, FlatFileError> {
        let path = self.file_name(pos.file);
        let mut file = if read_only {
            match File::open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FlatFileError::Missing(path))
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            std::fs::create_dir_all(&self.dir)?;
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?
        };
        if pos.pos != 0 {
            file.seek(SeekFrom::Start(u64::from(pos.pos)))?;
        }
        Ok(file)
    }

    /// Pre-allocates whole chunks so that `add_size` bytes fit after `pos`.
    /// Returns the number of bytes added to the file.
    pub fn allocate(&self, pos: FlatFilePos, add_size: u32) -> Result<u64, FlatFileError> {
        let chunk = u64::from(self.chunk_size);
        let old_chunks = (u64::from(pos.pos) + chunk - 1) / chunk;
        let new_chunks = (u64::from(pos.pos) + u64::from(add_size) + chunk - 1) / chunk;
        if new_chunks <= old_chunks {
            return Ok(0);
        }
        let new_size = new_chunks * chunk;
        let inc_size = new_size - u64::from(pos.pos);
        check_disk_space(&self.dir, inc_size)?;
        let file = self.open(FlatFilePos::new(pos.file, 0), false)?;
        blockd_log::log_category!(
            blockd_log::Category::Validation,
            "Pre-allocating up to position 0x{:x} in {}{:05}.dat",
            new_size,
            self.prefix,
            pos.file
        );
        if file.metadata()?.len() < new_size && file.allocate(new_size).is_err() {
            file.set_len(new_size)?;
        }
        Ok(inc_size)
    }

    /// Commits the file to disk; when finalizing, first truncates the
    /// pre-allocated tail past `pos`.
    pub fn flush(&self, pos: FlatFilePos, finalize: bool) -> Result<(), FlatFileError> {
        let file = self.open(FlatFilePos::new(pos.file, 0), false)?;
        if finalize {
            file.set_len(u64::from(pos.pos))?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Deletes a file; a missing file is not an error.
    pub fn remove(&self, file: u32) -> Result<bool, FlatFileError> {
        match std::fs::remove_file(self.file_name(file)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn file_size(&self, file: u32) -> Result<u64, FlatFileError> {
        Ok(std::fs::metadata(self.file_name(file))?.len())
    }
}

pub fn check_disk_space(dir: &Path, additional: u64) -> Result<(), FlatFileError> {
    let target = if dir.exists() {
        dir
    } else {
        dir.parent().unwrap_or(dir)
    };
    let free = fs2::available_space(target)?;
    let needed = MIN_DISK_SPACE.saturating_add(additional);
    if free < needed {
        return Err(FlatFileError::OutOfSpace { needed });
    }
    Ok(())
}

/// Writes `magic ‖ len ‖ payload` at `header_pos` and returns the position of
/// the payload.
pub fn write_record(
    seq: &FlatFileSeq,
    header_pos: FlatFilePos,
    magic: [u8; 4],
    payload: &[u8],
) -> Result<FlatFilePos, FlatFileError> {
    let len = u32::try_from(payload.len()).map_err(|_| FlatFileError::Oversize {
        file: header_pos.file,
        pos: header_pos.pos,
        len: u32::MAX,
    })?;
    let mut file = seq.open(header_pos, false)?;
    let mut framed = Vec::with_capacity(payload.len() + STORAGE_HEADER_BYTES as usize);
    framed.extend_from_slice(&magic);
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(payload);
    file.write_all(&framed)?;
    Ok(FlatFilePos::new(
        header_pos.file,
        header_pos.pos + STORAGE_HEADER_BYTES,
    ))
}

/// Reads the framed record whose payload starts at `pos`, checking the magic
/// and that the stored length does not exceed `max_len`.
pub fn read_record(
    seq: &FlatFileSeq,
    pos: FlatFilePos,
    magic: [u8; 4],
    max_len: u32,
) -> Result<Vec<u8>, FlatFileError> {
    if pos.pos < STORAGE_HEADER_BYTES {
        return Err(FlatFileError::InvalidPosition(pos));
    }
    let mut file = seq.open(
        FlatFilePos::new(pos.file, pos.pos - STORAGE_HEADER_BYTES),
        true,
    )?;
    let len = read_header(&mut file, pos, magic, max_len)?;
    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)?;
    Ok(payload)
}

/// Checksum binding an undo payload to the block it follows.
pub fn undo_checksum(prev_hash: &Hash256, payload: &[u8]) -> Hash256 {
    let mut writer = Sha256dWriter::new();
    writer.update(prev_hash).update(payload);
    writer.finalize()
}

/// Writes `magic ‖ len ‖ payload ‖ checksum(prev_hash, payload)`.
pub fn write_undo_record(
    seq: &FlatFileSeq,
    header_pos: FlatFilePos,
    magic: [u8; 4],
    payload: &[u8],
    prev_hash: &Hash256,
) -> Result<FlatFilePos, FlatFileError> {
    let mut body = Vec::with_capacity(payload.len() + UNDO_CHECKSUM_BYTES as usize);
    body.extend_from_slice(payload);
    body.extend_from_slice(&undo_checksum(prev_hash, payload));
    let len = payload.len() as u32;
    let mut file = seq.open(header_pos, false)?;
    let mut framed = Vec::with_capacity(body.len() + STORAGE_HEADER_BYTES as usize);
    framed.extend_from_slice(&magic);
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&body);
    file.write_all(&framed)?;
    Ok(FlatFilePos::new(
        header_pos.file,
        header_pos.pos + STORAGE_HEADER_BYTES,
    ))
}

pub fn read_undo_record(
    seq: &FlatFileSeq,
    pos: FlatFilePos,
    magic: [u8; 4],
    max_len: u32,
    prev_hash: &Hash256,
) -> Result<Vec<u8>, FlatFileError> {
    if pos.pos < STORAGE_HEADER_BYTES {
        return Err(FlatFileError::InvalidPosition(pos));
    }
    let mut file = seq.open(
        FlatFilePos::new(pos.file, pos.pos - STORAGE_HEADER_BYTES),
        true,
    )?;
    let len = read_header(&mut file, pos, magic, max_len)?;
    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)?;
    let mut checksum = [0u8; 32];
    file.read_exact(&mut checksum)?;
    if checksum != undo_checksum(prev_hash, &payload) {
        return Err(FlatFileError::ChecksumMismatch(pos));
    }
    Ok(payload)
}

fn read_header(
    file: &mut File,
    pos: FlatFilePos,
    magic: [u8; 4],
    max_len: u32,
) -> Result<u32, FlatFileError> {
    let mut header = [0u8; STORAGE_HEADER_BYTES as usize];
    file.read_exact(&mut header)?;
    if header[..4] != magic {
        return Err(FlatFileError::BadMagic {
            file: pos.file,
            pos: pos.pos,
        });
    }
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > max_len {
        return Err(FlatFileError::Oversize {
            file: pos.file,
            pos: pos.pos,
            len,
        });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[test]
    fn file_names_are_zero_padded() {
        let seq = FlatFileSeq::new("/tmp/blocks", "blk", 16);
        assert_eq!(
            seq.file_name(7),
            PathBuf::from("/tmp/blocks").join("blk00007.dat")
        );
    }

    #[test]
    fn allocate_rounds_to_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seq = FlatFileSeq::new(dir.path(), "blk", 1024);
        let grown = seq.allocate(FlatFilePos::new(0, 0), 10).expect("allocate");
        assert_eq!(grown, 1024);
        assert_eq!(seq.file_size(0).expect("size"), 1024);
        let grown = seq.allocate(FlatFilePos::new(0, 10), 100).expect("allocate");
        assert_eq!(grown, 0);
        let grown = seq.allocate(FlatFilePos::new(0, 1000), 100).expect("allocate");
        assert_eq!(grown, 1024);
        assert_eq!(seq.file_size(0).expect("size"), 2048);
    }

    #[test]
    fn finalize_truncates_preallocation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seq = FlatFileSeq::new(dir.path(), "blk", 4096);
        seq.allocate(FlatFilePos::new(0, 0), 20).expect("allocate");
        write_record(&seq, FlatFilePos::new(0, 0), MAGIC, &[1u8; 12]).expect("write");
        seq.flush(FlatFilePos::new(0, 20), true).expect("flush");
        assert_eq!(seq.file_size(0).expect("size"), 20);
    }

    #[test]
    fn record_roundtrip_and_bad_magic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seq = FlatFileSeq::new(dir.path(), "blk", 4096);
        let pos = write_record(&seq, FlatFilePos::new(0, 0), MAGIC, b"payload").expect("write");
        assert_eq!(pos, FlatFilePos::new(0, 8));
        assert_eq!(
            read_record(&seq, pos, MAGIC, 1024).expect("read"),
            b"payload".to_vec()
        );
        assert!(matches!(
            read_record(&seq, pos, [0, 0, 0, 0], 1024),
            Err(FlatFileError::BadMagic { .. })
        ));
        assert!(matches!(
            read_record(&seq, pos, MAGIC, 3),
            Err(FlatFileError::Oversize { .. })
        ));
    }

    #[test]
    fn undo_checksum_binds_previous_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seq = FlatFileSeq::new(dir.path(), "rev", 4096);
        let prev = [3u8; 32];
        let pos =
            write_undo_record(&seq, FlatFilePos::new(0, 0), MAGIC, b"undo", &prev).expect("write");
        assert_eq!(
            read_undo_record(&seq, pos, MAGIC, 1024, &prev).expect("read"),
            b"undo".to_vec()
        );
        assert!(matches!(
            read_undo_record(&seq, pos, MAGIC, 1024, &[4u8; 32]),
            Err(FlatFileError::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn missing_file_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seq = FlatFileSeq::new(dir.path(), "blk", 4096);
        assert!(matches!(
            seq.open(FlatFilePos::new(3, 0), true),
            Err(FlatFileError::Missing(_))
        ));
        assert!(!seq.remove(3).expect("remove"));
    }
}
