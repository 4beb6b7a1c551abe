//! EDID helpers: checksums and hex encoding

use crate::error::{AppError, Result};

/// Size of one EDID block
pub const EDID_BLOCK_SIZE: usize = 128;
/// Largest EDID the receiver accepts (base block + one extension)
pub const MAX_EDID_SIZE: usize = 2 * EDID_BLOCK_SIZE;

/// EDID applied when an empty string is set: 1920x1080 capable monitor
pub const DEFAULT_EDID_HEX: &str = "00ffffffffffff0052620188008888881c150103800000780a0dc9a05747982712484c00000001010101010101010101010101010101023a801871382d40582c4500c48e2100001e011d007251d01e206e285500c48e2100001e000000fc00543734392d6648443732300a20000000fd00147801ff1d000a202020202020017b";

/// Reject anything but one or two whole blocks
pub fn validate_len(len: usize) -> Result<()> {
    if len == EDID_BLOCK_SIZE || len == MAX_EDID_SIZE {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "EDID must be 128 or 256 bytes, got {}",
            len
        )))
    }
}

/// Rewrite byte 127 of every block so the block sums to 0 mod 256
pub fn fix_checksum(edid: &mut [u8]) -> Result<()> {
    validate_len(edid.len())?;
    for block in edid.chunks_exact_mut(EDID_BLOCK_SIZE) {
        let sum = block[..EDID_BLOCK_SIZE - 1]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        block[EDID_BLOCK_SIZE - 1] = 0u8.wrapping_sub(sum);
    }
    Ok(())
}

/// Whether every block sums to 0 mod 256
pub fn checksum_ok(edid: &[u8]) -> bool {
    edid.chunks(EDID_BLOCK_SIZE)
        .all(|block| block.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == 0)
}

/// Parse a hex string (whitespace ignored) into bytes
pub fn parse_hex(hex: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = hex.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(AppError::BadRequest(
            "EDID hex has an odd number of digits".to_string(),
        ));
    }

    digits
        .chunks_exact(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| {
                    AppError::BadRequest(format!(
                        "invalid hex byte '{}'",
                        String::from_utf8_lossy(pair)
                    ))
                })
        })
        .collect()
}

/// Lowercase hex without separators
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse, validate and checksum an EDID given as hex
///
/// An empty string selects [`DEFAULT_EDID_HEX`].
pub fn prepare(hex: &str) -> Result<Vec<u8>> {
    let hex = if hex.trim().is_empty() {
        DEFAULT_EDID_HEX
    } else {
        hex
    };
    let mut edid = parse_hex(hex)?;
    fix_checksum(&mut edid)?;
    Ok(edid)
}
