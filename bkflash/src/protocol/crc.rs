//! Image checksum matching the boot ROM's CRC-32.
//!
//! The ROM folds the standard CRC-32 (the zlib polynomial) over a flash
//! region starting from an all-ones running value. The fold is
//! chunk-invariant, so the host may process the image in any chunk size
//! and still agree with the device.

/// Running value the fold starts from.
pub const CRC_SEED: u32 = 0xFFFF_FFFF;

/// CRC-32 of a complete image, seeded with [`CRC_SEED`].
pub fn image_crc32(data: &[u8]) -> u32 {
    fold_crc32(CRC_SEED, data)
}

/// Fold more data into a running CRC-32 value.
pub fn fold_crc32(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}
