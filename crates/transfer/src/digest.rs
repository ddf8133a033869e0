//! Content digests and the vendor's reversible digest obfuscation.
//!
//! The remote exposes file digests in an obfuscated form: the 32 hex
//! characters are shuffled block-wise, XOR-ed with their position and one
//! character is replaced by a letter outside the hex alphabet. Uploads must
//! send the obfuscated whole-file digest; downloads must de-obfuscate the
//! remote digest before comparing it with a local md5.

use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::TransferError;

/// Size of the head slice hashed for dedup handshakes (256 KiB).
pub const SLICE_SIZE: usize = 256 * 1024;

const HEX: &[u8; 16] = b"0123456789abcdef";
const DIGEST_LEN: usize = 32;
/// Position carrying the out-of-alphabet marker letter.
const MARKER_POS: usize = 9;
const MARKER_BASE: u8 = b'g';

/// Computes md5 of `data` as 32 lowercase hex characters.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Computes md5 of an entire file, streaming it in 64 KiB reads.
pub fn file_md5(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Obfuscates a raw 32-character lowercase hex digest.
///
/// Any other input is returned unchanged.
pub fn obfuscate(raw: &str) -> String {
    let Some(values) = parse_raw(raw) else {
        return raw.to_string();
    };
    let mixed = xor_positions(reorder(values));
    mixed
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            if i == MARKER_POS {
                char::from(MARKER_BASE + v)
            } else {
                char::from(HEX[v as usize])
            }
        })
        .collect()
}

/// Reverses [`obfuscate`]. Input that is not a well-formed obfuscated
/// digest is returned unchanged.
pub fn deobfuscate(obfuscated: &str) -> String {
    let Some(values) = parse_obfuscated(obfuscated) else {
        return obfuscated.to_string();
    };
    reorder(xor_positions(values))
        .iter()
        .map(|&v| char::from(HEX[v as usize]))
        .collect()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

fn parse_raw(s: &str) -> Option<[u8; DIGEST_LEN]> {
    let bytes = s.as_bytes();
    if bytes.len() != DIGEST_LEN {
        return None;
    }
    let mut out = [0u8; DIGEST_LEN];
    for (slot, &b) in out.iter_mut().zip(bytes) {
        *slot = hex_value(b)?;
    }
    Some(out)
}

fn parse_obfuscated(s: &str) -> Option<[u8; DIGEST_LEN]> {
    let bytes = s.as_bytes();
    if bytes.len() != DIGEST_LEN {
        return None;
    }
    let mut out = [0u8; DIGEST_LEN];
    for (i, (slot, &b)) in out.iter_mut().zip(bytes).enumerate() {
        *slot = if i == MARKER_POS {
            match b {
                MARKER_BASE..=b'v' => b - MARKER_BASE,
                _ => return None,
            }
        } else {
            hex_value(b)?
        };
    }
    Some(out)
}

/// Swaps the 8-character blocks: [8:16] [0:8] [24:32] [16:24].
/// The permutation is its own inverse.
fn reorder(v: [u8; DIGEST_LEN]) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    out[0..8].copy_from_slice(&v[8..16]);
    out[8..16].copy_from_slice(&v[0..8]);
    out[16..24].copy_from_slice(&v[24..32]);
    out[24..32].copy_from_slice(&v[16..24]);
    out
}

fn xor_positions(mut v: [u8; DIGEST_LEN]) -> [u8; DIGEST_LEN] {
    for (i, x) in v.iter_mut().enumerate() {
        *x ^= (i & 15) as u8;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obfuscate_all_zero_digest() {
        let raw = "0".repeat(32);
        assert_eq!(obfuscate(&raw), "012345678pabcdef0123456789abcdef");
    }

    #[test]
    fn obfuscate_sequential_digest() {
        let raw = "0123456789abcdef0123456789abcdef";
        assert_eq!(obfuscate(raw), "888888888o8888888888888888888888");
    }

    #[test]
    fn roundtrip_real_digests() {
        let inputs: [&[u8]; 4] = [b"", b"hello world", b"The quick brown fox", &[0xff; 4096]];
        for data in inputs {
            let raw = md5_hex(data);
            let hidden = obfuscate(&raw);
            assert_ne!(hidden, raw);
            assert_eq!(hidden.len(), 32);
            assert_eq!(deobfuscate(&hidden), raw);
        }
    }

    #[test]
    fn roundtrip_exhaustive_marker_values() {
        // Every hex value must survive at every position, including the marker slot.
        for v in 0..16u8 {
            let c = char::from(HEX[v as usize]);
            let raw: String = std::iter::repeat_n(c, 32).collect();
            assert_eq!(deobfuscate(&obfuscate(&raw)), raw);
        }
    }

    #[test]
    fn marker_is_outside_hex_alphabet() {
        let hidden = obfuscate(&md5_hex(b"marker"));
        let marker = hidden.as_bytes()[MARKER_POS];
        assert!((b'g'..=b'v').contains(&marker));
    }

    #[test]
    fn invalid_input_is_identity() {
        for s in [
            "",
            "abc",
            "0123456789abcdef0123456789abcde",
            "0123456789abcdef0123456789abcdef0",
            "z123456789abcdef0123456789abcdef",
            "0123456789ABCDEF0123456789ABCDEF",
            "not a digest at all, definitely!",
        ] {
            assert_eq!(obfuscate(s), s);
            assert_eq!(deobfuscate(s), s);
        }
    }

    #[test]
    fn deobfuscate_rejects_missing_marker() {
        // A plain hex string never carries the marker letter.
        let raw = md5_hex(b"plain");
        assert_eq!(deobfuscate(&raw), raw);
    }

    #[test]
    fn file_md5_matches_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data).unwrap();
        assert_eq!(file_md5(&path).unwrap(), md5_hex(&data));
    }
}
