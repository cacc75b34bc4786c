//! Size conversions between bytes and the provider's GiB allocation unit

/// One gibibyte in bytes
pub const GIB: i64 = 1024 * 1024 * 1024;

/// Whole GiB contained in `bytes`, rounding down
pub fn bytes_to_gib(bytes: i64) -> i64 {
    bytes / GIB
}

/// Bytes in `gib` GiB
pub fn gib_to_bytes(gib: i64) -> i64 {
    gib.saturating_mul(GIB)
}

/// Smallest number of GiB holding `bytes`
pub fn round_up_gib(bytes: i64) -> i64 {
    if bytes <= 0 {
        return 0;
    }
    (bytes - 1) / GIB + 1
}
