/// Largest size exponent; 6 means 1024-byte blocks
pub const MAX_SZX: u8 = 6;

/// Decoded Block1/Block2 value: `NUM << 4 | M << 3 | SZX`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockOption {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

impl BlockOption {
    /// `szx` is clamped to 0..=6
    pub fn new(num: u32, more: bool, szx: u8) -> Self {
        BlockOption { num, more, szx: szx.min(MAX_SZX) }
    }

    pub fn from_value(value: u32) -> Self {
        BlockOption {
            num: value >> 4,
            more: (value >> 3) & 1 == 1,
            szx: (value & 0b111) as u8,
        }
    }

    pub fn to_value(&self) -> u32 {
        (self.num << 4) | (u32::from(self.more) << 3) | u32::from(self.szx & 0b111)
    }

    /// Real block size, `2^(szx + 4)`
    pub fn size(&self) -> usize {
        1usize << (u32::from(self.szx.min(MAX_SZX)) + 4)
    }

    /// Byte offset of this block within the whole body
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }

    /// Slice `body` into this block. Returns the block bytes and the `more` flag.
    pub fn slice<'a>(&self, body: &'a [u8]) -> (&'a [u8], bool) {
        let start = self.offset().min(body.len());
        let end = (start + self.size()).min(body.len());
        (&body[start..end], end < body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_value_layout() {
        let block = BlockOption::new(5, true, 6);
        assert_eq!(block.to_value(), 94);
        assert_eq!(BlockOption::from_value(94), block);
    }

    #[test]
    fn test_block_sizes() {
        assert_eq!(BlockOption::new(0, false, 0).size(), 16);
        assert_eq!(BlockOption::new(0, false, 2).size(), 64);
        assert_eq!(BlockOption::new(0, false, 6).size(), 1024);
        // 7 is reserved, construction clamps it
        assert_eq!(BlockOption::new(0, false, 7).szx, 6);
    }

    #[test]
    fn test_block_slicing() {
        let body: Vec<u8> = (0..40).collect();
        let (first, more) = BlockOption::new(0, false, 0).slice(&body);
        assert_eq!(first.len(), 16);
        assert!(more);
        let (last, more) = BlockOption::new(2, false, 0).slice(&body);
        assert_eq!(last, &body[32..40]);
        assert!(!more);
        let (past_end, more) = BlockOption::new(9, false, 0).slice(&body);
        assert!(past_end.is_empty());
        assert!(!more);
    }
}
