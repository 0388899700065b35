use blockd_primitives::encoding::{Decoder, Encoder};

pub const META_LAST_BLOCK_FILE_KEY: &[u8] = b"blocks:last_file";
pub const META_REINDEXING_KEY: &[u8] = b"blocks:reindexing";
const META_FLAG_PREFIX: &[u8] = b"flag:";

pub const FLAG_PRUNED_BLOCK_FILES: &str = "prunedblockfiles";

/// Per-file statistics for one `blkNNNNN.dat`/`revNNNNN.dat` pair.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockFileInfo {
    pub blocks: u32,
    pub size: u32,
    pub undo_size: u32,
    pub height_first: i32,
    pub height_last: i32,
    pub time_first: u32,
    pub time_last: u32,
}

impl BlockFileInfo {
    pub fn add_block(&mut self, height: i32, time: u32) {
        if self.blocks == 0 || self.height_first > height {
            self.height_first = height;
        }
        if self.blocks == 0 || self.time_first > time {
            self.time_first = time;
        }
        self.blocks += 1;
        if height > self.height_last {
            self.height_last = height;
        }
        if time > self.time_last {
            self.time_last = time;
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(28);
        encoder.write_u32_le(self.blocks);
        encoder.write_u32_le(self.size);
        encoder.write_u32_le(self.undo_size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.write_u32_le(self.time_first);
        encoder.write_u32_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let info = Self {
            blocks: decoder.read_u32_le().ok()?,
            size: decoder.read_u32_le().ok()?,
            undo_size: decoder.read_u32_le().ok()?,
            height_first: decoder.read_i32_le().ok()?,
            height_last: decoder.read_i32_le().ok()?,
            time_first: decoder.read_u32_le().ok()?,
            time_last: decoder.read_u32_le().ok()?,
        };
        decoder.finish().ok()?;
        Some(info)
    }
}

impl std::fmt::Display for BlockFileInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BlockFileInfo(blocks={}, size={}, heights={}...{}, time={}...{})",
            self.blocks,
            self.size,
            self.height_first,
            self.height_last,
            self.time_first,
            self.time_last
        )
    }
}

/// Big-endian so a column scan visits files in numeric order.
pub fn block_file_info_key(file: u32) -> [u8; 4] {
    file.to_be_bytes()
}

pub fn parse_block_file_info_key(key: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(key.try_into().ok()?))
}

pub fn flag_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(META_FLAG_PREFIX.len() + name.len());
    key.extend_from_slice(META_FLAG_PREFIX);
    key.extend_from_slice(name.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_block_tracks_ranges_out_of_order() {
        let mut info = BlockFileInfo::default();
        info.add_block(10, 500);
        info.add_block(7, 700);
        info.add_block(12, 400);
        assert_eq!(info.blocks, 3);
        assert_eq!((info.height_first, info.height_last), (7, 12));
        assert_eq!((info.time_first, info.time_last), (400, 700));
    }

    #[test]
    fn first_block_resets_defaults() {
        let mut info = BlockFileInfo::default();
        info.add_block(42, 9);
        assert_eq!(info.height_first, 42);
        assert_eq!(info.time_first, 9);
    }

    #[test]
    fn codec_roundtrip_and_rejects_trailing() {
        let info = BlockFileInfo {
            blocks: 4,
            size: 1024,
            undo_size: 256,
            height_first: 1,
            height_last: 4,
            time_first: 11,
            time_last: 44,
        };
        let mut bytes = info.encode();
        assert_eq!(BlockFileInfo::decode(&bytes), Some(info));
        bytes.push(0);
        assert_eq!(BlockFileInfo::decode(&bytes), None);
    }

    #[test]
    fn file_keys_sort_numerically() {
        assert!(block_file_info_key(2) < block_file_info_key(10));
        assert_eq!(parse_block_file_info_key(&block_file_info_key(77)), Some(77));
    }
}
