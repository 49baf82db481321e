//! Fixed-size record codec
//!
//! Every stored record has the same width, so the log can address records by
//! slot index alone.
//!
//! # Binary Format
//!
//! ```text
//! [hash: signature_len bytes]
//! [link: u32 LE]               — 1-based slot of the next record in the same
//!                                collision chain, 0 = end of chain
//! [padding to a 4-byte boundary]
//! ```
//!
//! The `link` field is used by the hash-table backend; the B-tree backend
//! writes 0. Records are padded so that every slot starts on a 4-byte
//! boundary in the mapped file.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Default digest width: a SHA-1-class content hash
pub const DEFAULT_SIGNATURE_LENGTH: usize = 20;

/// Width of the link suffix
pub(crate) const LINK_LEN: usize = 4;

/// Width in bytes of one record slot for the given signature length,
/// padded up to a 4-byte boundary.
pub(crate) fn record_width(signature_len: usize) -> usize {
    let raw = signature_len + LINK_LEN;
    (raw + 3) & !3
}

/// Reject input whose length differs from the configured signature length.
///
/// Called before any write, so a bad input never causes a partial record.
pub(crate) fn check_signature(hash: &[u8], signature_len: usize) -> Result<()> {
    if hash.len() != signature_len {
        return Err(Error::InvalidSignatureLength {
            expected: signature_len,
            actual: hash.len(),
        });
    }
    Ok(())
}

/// Encode `(hash, link)` into a record slot buffer.
///
/// `buf` must be exactly `record_width(hash.len())` bytes.
pub(crate) fn encode(hash: &[u8], link: u32, buf: &mut [u8]) {
    debug_assert_eq!(buf.len(), record_width(hash.len()));
    buf[..hash.len()].copy_from_slice(hash);
    LittleEndian::write_u32(&mut buf[hash.len()..hash.len() + LINK_LEN], link);
    for b in &mut buf[hash.len() + LINK_LEN..] {
        *b = 0;
    }
}

/// Decode a record slot buffer into `(hash, link)`.
pub(crate) fn decode(buf: &[u8], signature_len: usize) -> (&[u8], u32) {
    debug_assert!(buf.len() >= signature_len + LINK_LEN);
    let hash = &buf[..signature_len];
    let link = LittleEndian::read_u32(&buf[signature_len..signature_len + LINK_LEN]);
    (hash, link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_width_is_aligned() {
        assert_eq!(record_width(20), 24);
        assert_eq!(record_width(32), 36);
        assert_eq!(record_width(16), 20);
        // Unaligned raw widths round up
        assert_eq!(record_width(5), 12);
        assert_eq!(record_width(1), 8);
        for len in 1..64 {
            assert_eq!(record_width(len) % 4, 0);
            assert!(record_width(len) >= len + LINK_LEN);
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let hash: Vec<u8> = (0..20).collect();
        let mut buf = vec![0xFFu8; record_width(20)];
        encode(&hash, 7, &mut buf);

        let (decoded, link) = decode(&buf, 20);
        assert_eq!(decoded, &hash[..]);
        assert_eq!(link, 7);
    }

    #[test]
    fn test_encode_zeroes_padding() {
        let hash = [0xABu8; 5];
        let mut buf = vec![0xFFu8; record_width(5)];
        encode(&hash, 1, &mut buf);
        // Bytes beyond hash+link are zeroed
        assert!(buf[5 + LINK_LEN..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_check_signature_rejects_wrong_length() {
        let err = check_signature(&[0u8; 16], 20).unwrap_err();
        match err {
            Error::InvalidSignatureLength { expected, actual } => {
                assert_eq!(expected, 20);
                assert_eq!(actual, 16);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(check_signature(&[0u8; 20], 20).is_ok());
    }
}
