/// Sizing information needed to decode piece-carrying messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TorrentContext {
    pub piece_length: u64,
    pub total_length: u64,
}

impl TorrentContext {
    pub fn new(piece_length: u64, total_length: u64) -> Self {
        Self {
            piece_length,
            total_length,
        }
    }

    /// Whether piece geometry is known. Magnet links start without it.
    pub fn has_metadata(&self) -> bool {
        self.piece_length > 0 && self.total_length > 0
    }

    pub fn piece_count(&self) -> usize {
        if !self.has_metadata() {
            return 0;
        }
        self.total_length.div_ceil(self.piece_length) as usize
    }

    /// Length of piece `index`; the last piece may be short.
    pub fn piece_size(&self, index: u32) -> Option<u64> {
        let index = index as u64;
        if index >= self.piece_count() as u64 {
            return None;
        }
        let start = index * self.piece_length;
        Some(self.piece_length.min(self.total_length - start))
    }

    /// Whether `length` bytes at `begin` fit inside piece `index`.
    pub fn contains_block(&self, index: u32, begin: u32, length: u64) -> bool {
        self.piece_size(index).is_some_and(|size| begin as u64 + length <= size)
    }

    /// Torrent-absolute offset of `begin` within piece `index`.
    pub fn offset_of(&self, index: u32, begin: u32) -> u64 {
        index as u64 * self.piece_length + begin as u64
    }

    pub fn bitfield_byte_length(&self) -> usize {
        self.piece_count().div_ceil(8)
    }
}
