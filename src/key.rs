//! Fixed-width key type and its little-endian wire encoding.

use std::fmt::Debug;

/// A fixed-width unsigned integer that can be sorted and persisted as raw
/// little-endian bytes.
///
/// Implemented for `u32` and `u64`; the merge path is generic over this
/// trait so it stays monomorphic and branch-free for whichever width is
/// chosen at build time.
pub trait Key: Copy + Ord + Debug + Send + Sync + 'static {
    /// Size of the encoded key, in bytes.
    const SIZE: usize;

    /// Stack-allocated wire representation; `[u8; SIZE]` for every impl,
    /// so encoding and decoding a key never touches the heap.
    type Bytes: AsRef<[u8]> + AsMut<[u8]> + Default;

    fn to_le_bytes(self) -> Self::Bytes;
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
}

impl Key for u32 {
    const SIZE: usize = 4;
    type Bytes = [u8; 4];

    fn to_le_bytes(self) -> [u8; 4] {
        u32::to_le_bytes(self)
    }

    fn from_le_bytes(bytes: [u8; 4]) -> Self {
        u32::from_le_bytes(bytes)
    }
}

impl Key for u64 {
    const SIZE: usize = 8;
    type Bytes = [u8; 8];

    fn to_le_bytes(self) -> [u8; 8] {
        u64::to_le_bytes(self)
    }

    fn from_le_bytes(bytes: [u8; 8]) -> Self {
        u64::from_le_bytes(bytes)
    }
}
