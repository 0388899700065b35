use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};

use blockd_chainstate::coins::{CoinsDbFactory, CoinsSlot, SnapshotState};
use blockd_chainstate::filemeta::{BlockFileInfo, FLAG_PRUNED_BLOCK_FILES};
use blockd_chainstate::index::BlockTreeDb;
use blockd_consensus::hash256_to_hex;
use blockd_storage::KeyValueStore;

use crate::config::Config;

#[derive(Clone, Debug, Default, Serialize)]
struct FlatfileFsSummary {
    block_files: u64,
    block_bytes: u64,
    block_max_file_id: Option<u32>,
    undo_files: u64,
    undo_bytes: u64,
    undo_max_file_id: Option<u32>,
    other_files: u64,
    other_bytes: u64,
}

#[derive(Clone, Debug, Serialize)]
struct FileInfoEntry {
    file: u32,
    blocks: u32,
    size: u32,
    undo_size: u32,
    height_first: i32,
    height_last: i32,
    time_first: u32,
    time_last: u32,
}

impl FileInfoEntry {
    fn new(file: u32, info: &BlockFileInfo) -> Self {
        Self {
            file,
            blocks: info.blocks,
            size: info.size,
            undo_size: info.undo_size,
            height_first: info.height_first,
            height_last: info.height_last,
            time_first: info.time_first,
            time_last: info.time_last,
        }
    }
}

pub(crate) fn collect_db_info<S: KeyValueStore>(
    config: &Config,
    block_tree: &BlockTreeDb<S>,
    coins: &dyn CoinsDbFactory,
) -> Result<Value, String> {
    let file_infos = block_tree
        .read_all_block_file_info()
        .map_err(|err| err.to_string())?;
    let last_file = block_tree
        .read_last_block_file()
        .map_err(|err| err.to_string())?;
    let reindexing = block_tree
        .read_reindexing()
        .map_err(|err| err.to_string())?;
    let pruned = block_tree
        .read_flag(FLAG_PRUNED_BLOCK_FILES)
        .map_err(|err| err.to_string())?;
    let index_entries = block_tree
        .count_block_index()
        .map_err(|err| err.to_string())?;

    let blocks_fs = scan_blocks_dir_fs(&config.blocks_dir)?;
    let meta_blocks: u64 = file_infos.iter().map(|(_, info)| u64::from(info.size)).sum();
    let meta_undo: u64 = file_infos
        .iter()
        .map(|(_, info)| u64::from(info.undo_size))
        .sum();
    let stored_blocks: u64 = file_infos
        .iter()
        .map(|(_, info)| u64::from(info.blocks))
        .sum();
    let files: Vec<FileInfoEntry> = file_infos
        .iter()
        .map(|(file, info)| FileInfoEntry::new(*file, info))
        .collect();

    let mut warnings = Vec::new();
    if let Some(last) = last_file {
        if blocks_fs.block_max_file_id.is_some_and(|max| max > last) {
            warnings.push(format!(
                "blk files beyond the last recorded file {last} exist on disk"
            ));
        }
    }
    if meta_blocks > blocks_fs.block_bytes {
        warnings.push(format!(
            "block file info records {meta_blocks} bytes but only {} are on disk",
            blocks_fs.block_bytes
        ));
    }

    let mut chainstates = Vec::new();
    for slot in [CoinsSlot::Primary, CoinsSlot::Snapshot] {
        chainstates.push(coins_summary(coins, slot)?);
    }

    let reindex_flag = config.data_dir.join(crate::REINDEX_REQUEST_FILE_NAME);
    Ok(json!({
        "backend": config.backend.as_str(),
        "network": config.network.as_str(),
        "paths": {
            "data_dir": config.data_dir.display().to_string(),
            "blocks_dir": config.blocks_dir.display().to_string(),
            "conf": config.conf_path.display().to_string(),
        },
        "block_tree": {
            "index_entries": index_entries,
            "last_block_file": last_file,
            "reindexing": reindexing,
            "pruned_block_files": pruned,
            "reindex_requested": reindex_flag.exists(),
        },
        "flatfiles_meta": {
            "files": files.len(),
            "blocks": stored_blocks,
            "block_bytes": meta_blocks,
            "undo_bytes": meta_undo,
            "per_file": files,
        },
        "flatfiles_fs": blocks_fs,
        "sizes": {
            "blocks_dir_bytes": dir_size(&config.blocks_dir)?,
            "data_dir_bytes": dir_size(&config.data_dir)?,
        },
        "chainstates": chainstates,
        "warnings": warnings,
    }))
}

fn coins_summary(coins: &dyn CoinsDbFactory, slot: CoinsSlot) -> Result<Value, String> {
    if !coins.exists(slot) {
        return Ok(json!({ "name": slot.as_str(), "present": false }));
    }
    let db = coins.open(slot, false).map_err(|err| err.to_string())?;
    let best_block = db.best_block().map_err(|err| err.to_string())?;
    let snapshot = match db.snapshot_state().map_err(|err| err.to_string())? {
        SnapshotState::None => Value::Null,
        SnapshotState::Unvalidated(base) => {
            json!({ "base": hash256_to_hex(&base), "validated": false })
        }
        SnapshotState::Validated(base) => {
            json!({ "base": hash256_to_hex(&base), "validated": true })
        }
    };
    Ok(json!({
        "name": slot.as_str(),
        "present": true,
        "best_block": best_block.as_ref().map(hash256_to_hex),
        "interrupted_flush": !db.head_blocks().map_err(|err| err.to_string())?.is_empty(),
        "coins": db.coin_count().map_err(|err| err.to_string())?,
        "snapshot": snapshot,
    }))
}

fn scan_blocks_dir_fs(blocks_dir: &Path) -> Result<FlatfileFsSummary, String> {
    let entries = match fs::read_dir(blocks_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FlatfileFsSummary::default());
        }
        Err(err) => return Err(err.to_string()),
    };

    let mut summary = FlatfileFsSummary::default();
    for entry in entries {
        let entry = entry.map_err(|err| err.to_string())?;
        let meta = entry.metadata().map_err(|err| err.to_string())?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let len = meta.len();
        if let Some(file_id) = parse_flatfile_id(name.as_ref(), "blk") {
            summary.block_files += 1;
            summary.block_bytes = summary.block_bytes.saturating_add(len);
            summary.block_max_file_id = summary.block_max_file_id.max(Some(file_id));
        } else if let Some(file_id) = parse_flatfile_id(name.as_ref(), "rev") {
            summary.undo_files += 1;
            summary.undo_bytes = summary.undo_bytes.saturating_add(len);
            summary.undo_max_file_id = summary.undo_max_file_id.max(Some(file_id));
        } else {
            summary.other_files += 1;
            summary.other_bytes = summary.other_bytes.saturating_add(len);
        }
    }
    Ok(summary)
}

fn parse_flatfile_id(name: &str, prefix: &str) -> Option<u32> {
    let numeric = name.strip_prefix(prefix)?.strip_suffix(".dat")?;
    if numeric.len() != 5 {
        return None;
    }
    numeric.parse::<u32>().ok()
}

pub(crate) fn dir_size(path: &Path) -> Result<u64, String> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.to_string()),
    };

    let mut total = 0u64;
    for entry in entries {
        let entry = entry.map_err(|err| err.to_string())?;
        let meta = entry.metadata().map_err(|err| err.to_string())?;
        if meta.is_dir() {
            total = total.saturating_add(dir_size(&entry.path())?);
        } else {
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatfile_names_are_recognised() {
        assert_eq!(parse_flatfile_id("blk00012.dat", "blk"), Some(12));
        assert_eq!(parse_flatfile_id("rev00000.dat", "rev"), Some(0));
        assert_eq!(parse_flatfile_id("blk12.dat", "blk"), None);
        assert_eq!(parse_flatfile_id("rev00001.dat", "blk"), None);
        assert_eq!(parse_flatfile_id("blk00001.tmp", "blk"), None);
    }

    #[test]
    fn blocks_dir_scan_splits_file_kinds() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("blk00000.dat"), [0u8; 10]).expect("blk0");
        fs::write(dir.path().join("blk00003.dat"), [0u8; 5]).expect("blk3");
        fs::write(dir.path().join("rev00000.dat"), [0u8; 4]).expect("rev0");
        fs::write(dir.path().join("notes.txt"), [0u8; 2]).expect("other");
        fs::create_dir(dir.path().join("index")).expect("index dir");

        let summary = scan_blocks_dir_fs(dir.path()).expect("scan");
        assert_eq!(summary.block_files, 2);
        assert_eq!(summary.block_bytes, 15);
        assert_eq!(summary.block_max_file_id, Some(3));
        assert_eq!(summary.undo_files, 1);
        assert_eq!(summary.undo_max_file_id, Some(0));
        assert_eq!(summary.other_files, 1);
        assert_eq!(dir_size(dir.path()).expect("size"), 21);

        let missing = scan_blocks_dir_fs(&dir.path().join("missing")).expect("missing");
        assert_eq!(missing.block_files, 0);
    }
}
