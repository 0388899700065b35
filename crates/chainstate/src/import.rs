//! Block import: rebuilding the index from the node's own block files after
//! a reindex, and ingesting externally supplied dump files.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use blockd_consensus::constants::MAX_BLOCK_SERIALIZED_SIZE;
use blockd_consensus::{hash256_to_hex, Hash256};
use blockd_log::Category;
use blockd_primitives::block::{Block, BlockHeader, HEADER_SIZE};
use blockd_storage::KeyValueStore;
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::flatfiles::FlatFilePos;
use crate::manager::{AcceptOutcome, ChainstateError, ChainstateManager};

#[derive(Debug)]
pub enum ImportError {
    Io(std::io::Error),
    Chainstate(ChainstateError),
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportError::Io(err) => write!(f, "{err}"),
            ImportError::Chainstate(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ImportError {}

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        ImportError::Io(err)
    }
}

impl From<ChainstateError> for ImportError {
    fn from(err: ChainstateError) -> Self {
        ImportError::Chainstate(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImportOutcome {
    Completed,
    Interrupted,
}

#[derive(Clone, Debug, Default)]
pub struct ImportOptions {
    /// Dump files read after any reindex, in order.
    pub files: Vec<PathBuf>,
    /// Request shutdown once the import finishes.
    pub stop_after_import: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartupEvent {
    GenesisConnected,
    Interrupted,
}

/// One-shot event the startup thread waits on while the import runs.
pub struct GenesisSignal {
    fired: AtomicBool,
    tx: Sender<StartupEvent>,
}

impl GenesisSignal {
    pub fn new() -> (Self, Receiver<StartupEvent>) {
        let (tx, rx) = bounded(1);
        (
            Self {
                fired: AtomicBool::new(false),
                tx,
            },
            rx,
        )
    }

    /// Sends `event` unless an event was already sent.
    pub fn fire(&self, event: StartupEvent) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.try_send(event);
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Blocks seen before their parent, keyed by the parent hash. Only blocks
/// with a known on-disk position (reindex) are kept.
pub type UnknownParents = HashMap<Hash256, Vec<FlatFilePos>>;

enum ScanEnd {
    Eof,
    Interrupted,
}

impl<S: KeyValueStore> ChainstateManager<S> {
    /// Runs the import: reindex of the local block files when flagged, then
    /// the external files, then a best-chain activation for every
    /// chainstate.
    pub fn import_blocks(
        &self,
        options: &ImportOptions,
        signal: &GenesisSignal,
    ) -> Result<ImportOutcome, ImportError> {
        let outcome = self.run_import(options, signal);
        match &outcome {
            Ok(ImportOutcome::Completed) => {
                if self.active_tip().is_some() {
                    signal.fire(StartupEvent::GenesisConnected);
                }
                if options.stop_after_import {
                    blockd_log::log_info!("Stopping after block import");
                    self.interrupt.request();
                }
            }
            Ok(ImportOutcome::Interrupted) => signal.fire(StartupEvent::Interrupted),
            Err(_) => {}
        }
        if self.interrupt.is_set() {
            signal.fire(StartupEvent::Interrupted);
        }
        outcome
    }

    fn run_import(
        &self,
        options: &ImportOptions,
        signal: &GenesisSignal,
    ) -> Result<ImportOutcome, ImportError> {
        if self.blockman.is_reindexing() {
            let mut unknown_parents = UnknownParents::new();
            let mut file = 0u32;
            while self.blockman.block_files().exists(file) {
                if self.interrupt.is_set() {
                    blockd_log::log_info!("Interrupt requested. Exit reindexing.");
                    return Ok(ImportOutcome::Interrupted);
                }
                blockd_log::log_info!("Reindexing block file blk{:05}.dat...", file);
                let path = self.blockman.block_files().file_name(file);
                let handle = File::open(&path)?;
                let end = self.load_external_block_file(
                    handle,
                    Some(file),
                    &mut unknown_parents,
                    signal,
                )?;
                if matches!(end, ScanEnd::Interrupted) {
                    blockd_log::log_info!("Interrupt requested. Exit reindexing.");
                    return Ok(ImportOutcome::Interrupted);
                }
                file += 1;
            }
            if !unknown_parents.is_empty() {
                blockd_log::log_category!(
                    Category::Reindex,
                    "{} blocks left without a parent after reindex",
                    unknown_parents.values().map(Vec::len).sum::<usize>()
                );
            }
            self.blockman
                .block_tree()
                .write_reindexing(false)
                .map_err(|err| ChainstateError::BlockStore(err.into()))?;
            self.blockman.set_reindexing(false);
            blockd_log::log_info!("Reindexing finished");
            self.load_genesis_block()?;
        }

        for path in &options.files {
            if self.interrupt.is_set() {
                return Ok(ImportOutcome::Interrupted);
            }
            let handle = match File::open(path) {
                Ok(handle) => handle,
                Err(err) => {
                    blockd_log::log_warn!(
                        "Warning: Could not open blocks file {}: {err}",
                        path.display()
                    );
                    continue;
                }
            };
            blockd_log::log_info!("Importing blocks file {}...", path.display());
            let mut unknown_parents = UnknownParents::new();
            let end = self.load_external_block_file(handle, None, &mut unknown_parents, signal)?;
            if matches!(end, ScanEnd::Interrupted) {
                blockd_log::log_info!("Interrupt requested. Exit block importer.");
                return Ok(ImportOutcome::Interrupted);
            }
        }

        if let Err(err) = self.activate_best_chain() {
            self.notifications
                .fatal_error(&format!("Failed to connect best block ({err})"));
            return Err(err.into());
        }
        if self.interrupt.is_set() {
            return Ok(ImportOutcome::Interrupted);
        }
        Ok(ImportOutcome::Completed)
    }

    /// Scans `file` for framed blocks and accepts each one whose parent is
    /// known. With `known_file` set the file is one of the node's own block
    /// files and blocks keep their position; otherwise they are copied.
    fn load_external_block_file(
        &self,
        file: File,
        known_file: Option<u32>,
        unknown_parents: &mut UnknownParents,
        signal: &GenesisSignal,
    ) -> Result<ScanEnd, ImportError> {
        let start = Instant::now();
        let magic = self.blockman.options().message_start;
        let mut reader = Scanner::new(BufReader::new(file));
        let mut loaded = 0usize;

        let end = loop {
            if self.interrupt.is_set() {
                break ScanEnd::Interrupted;
            }
            if !reader.seek_magic(&magic)? {
                break ScanEnd::Eof;
            }
            let magic_offset = reader.offset - magic.len() as u64;
            let Some(len) = reader.read_u32_le()? else {
                break ScanEnd::Eof;
            };
            if !(HEADER_SIZE as u32..=MAX_BLOCK_SERIALIZED_SIZE).contains(&len) {
                // The length may belong to a torn record; a real one can start inside it.
                reader.seek_to(magic_offset + 1)?;
                continue;
            }
            let payload_offset = reader.offset;
            let Some(payload) = reader.read_exact_or_eof(len as usize)? else {
                break ScanEnd::Eof;
            };
            let header = match BlockHeader::consensus_decode(&payload[..HEADER_SIZE]) {
                Ok(header) => header,
                Err(err) => {
                    blockd_log::log_warn!("Deserialize error at offset {payload_offset}: {err}");
                    continue;
                }
            };
            let hash = header.hash();
            let is_genesis = hash == self.params.hash_genesis_block;
            if !is_genesis && self.lookup_block_index(&header.prev_block).is_none() {
                blockd_log::log_category!(
                    Category::Reindex,
                    "Out of order block {}, parent {} not known",
                    hash256_to_hex(&hash),
                    hash256_to_hex(&header.prev_block)
                );
                if let Some(file) = known_file {
                    unknown_parents
                        .entry(header.prev_block)
                        .or_default()
                        .push(FlatFilePos::new(file, payload_offset as u32));
                }
                continue;
            }
            let stored = self.lookup_block_index(&hash).filter(|node| node.have_data());
            if let Some(node) = stored {
                if !is_genesis && known_file.is_none() {
                    blockd_log::log_category!(
                        Category::Reindex,
                        "Block Import: already had block {} at height {}",
                        hash256_to_hex(&hash),
                        node.height
                    );
                }
            } else {
                let block = match Block::consensus_decode(&payload) {
                    Ok(block) => block,
                    Err(err) => {
                        blockd_log::log_warn!(
                            "Deserialize error for block {}: {err}",
                            hash256_to_hex(&hash)
                        );
                        continue;
                    }
                };
                let known = known_file.map(|file| FlatFilePos::new(file, payload_offset as u32));
                if self.accept_imported(&block, known)? {
                    loaded += 1;
                }
            }
            if is_genesis {
                self.activate_best_chain()?;
                if self.active_tip().is_some() {
                    signal.fire(StartupEvent::GenesisConnected);
                }
            }
            loaded += self.process_unknown_parents(hash, unknown_parents)?;
        };

        if loaded > 0 {
            blockd_log::log_info!(
                "Loaded {} blocks from external file in {}ms",
                loaded,
                start.elapsed().as_millis()
            );
        }
        Ok(end)
    }

    /// Accepts every stored block that was waiting on `parent`, and then
    /// their own waiting children.
    fn process_unknown_parents(
        &self,
        parent: Hash256,
        unknown_parents: &mut UnknownParents,
    ) -> Result<usize, ImportError> {
        let mut loaded = 0;
        let mut queue = vec![parent];
        while let Some(hash) = queue.pop() {
            let Some(children) = unknown_parents.remove(&hash) else {
                continue;
            };
            for pos in children {
                let block = match self.blockman.read_block(pos) {
                    Ok(block) => block,
                    Err(err) => {
                        blockd_log::log_warn!("Failed to read out of order block at {pos}: {err}");
                        continue;
                    }
                };
                blockd_log::log_category!(
                    Category::Reindex,
                    "Processing out of order child {} of {}",
                    hash256_to_hex(&block.hash()),
                    hash256_to_hex(&hash)
                );
                if self.accept_imported(&block, Some(pos))? {
                    loaded += 1;
                }
                queue.push(block.hash());
            }
        }
        Ok(loaded)
    }

    /// Invalid blocks are logged and skipped; storage failures end the pass.
    fn accept_imported(
        &self,
        block: &Block,
        known: Option<FlatFilePos>,
    ) -> Result<bool, ImportError> {
        match self.accept_block(block, known) {
            Ok(AcceptOutcome::Stored(_)) => Ok(true),
            Ok(AcceptOutcome::AlreadyHave(_)) => Ok(false),
            Err(ChainstateError::Invalid(err)) => {
                blockd_log::log_warn!(
                    "Block {} rejected during import: {err}",
                    hash256_to_hex(&block.hash())
                );
                Ok(false)
            }
            Err(ChainstateError::Index(err)) => {
                blockd_log::log_warn!(
                    "Block {} not indexed during import: {err}",
                    hash256_to_hex(&block.hash())
                );
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Byte reader that tracks its offset in the file.
struct Scanner<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> Scanner<R> {
    fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    fn read_byte(&mut self) -> Result<Option<u8>, std::io::Error> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.offset += 1;
                    return Ok(Some(byte[0]));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Advances past the next occurrence of `magic`. False at end of file.
    fn seek_magic(&mut self, magic: &[u8; 4]) -> Result<bool, std::io::Error> {
        let mut window = [0u8; 4];
        let mut filled = 0usize;
        loop {
            let Some(byte) = self.read_byte()? else {
                return Ok(false);
            };
            window.rotate_left(1);
            window[3] = byte;
            filled = (filled + 1).min(4);
            if filled == 4 && &window == magic {
                return Ok(true);
            }
        }
    }

    fn read_exact_or_eof(&mut self, len: usize) -> Result<Option<Vec<u8>>, std::io::Error> {
        let mut buf = vec![0u8; len];
        match self.inner.read_exact(&mut buf) {
            Ok(()) => {
                self.offset += len as u64;
                Ok(Some(buf))
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn read_u32_le(&mut self) -> Result<Option<u32>, std::io::Error> {
        Ok(self
            .read_exact_or_eof(4)?
            .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])))
    }
}

impl<R: Read + Seek> Scanner<R> {
    fn seek_to(&mut self, offset: u64) -> Result<(), std::io::Error> {
        self.offset = self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_finds_magic_after_garbage() {
        let magic = [0xfa, 0xbf, 0xb5, 0xda];
        let mut bytes = vec![0u8, 0xfa, 0xbf, 0x00];
        bytes.extend_from_slice(&magic);
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        let mut scanner = Scanner::new(bytes.as_slice());
        assert!(scanner.seek_magic(&magic).expect("scan"));
        assert_eq!(scanner.offset, 8);
        assert_eq!(scanner.read_u32_le().expect("len"), Some(3));
        assert_eq!(scanner.read_exact_or_eof(3).expect("payload"), Some(vec![1, 2, 3]));
        assert_eq!(scanner.offset, 15);
        assert!(!scanner.seek_magic(&magic).expect("eof"));
    }

    #[test]
    fn short_payload_is_end_of_file() {
        let mut scanner = Scanner::new(&[1u8, 2][..]);
        assert_eq!(scanner.read_exact_or_eof(4).expect("short"), None);
    }

    #[test]
    fn genesis_signal_fires_once() {
        let (signal, rx) = GenesisSignal::new();
        signal.fire(StartupEvent::Interrupted);
        signal.fire(StartupEvent::GenesisConnected);
        assert!(signal.has_fired());
        assert_eq!(rx.try_recv().ok(), Some(StartupEvent::Interrupted));
        assert!(rx.try_recv().is_err());
    }
}
