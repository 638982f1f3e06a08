//! Content checksum type used by the overlay.
//!
//! The overlay checksums file content with FNV-1a in its 64-bit variant.
//! The hash is incremental: folding a byte sequence in across any partition
//! of the stream produces the same value as hashing it in one pass, which is
//! what lets a writer handle keep a running digest across individual writes.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

/// FNV-1a offset basis, 64-bit width.
const OFFSET_BASIS: u64 = 0x14650FB0739D0383;

/// FNV-1a prime, 64-bit width.
const PRIME: u64 = 0x100000001B3;

/// A running FNV-1a-64 checksum.
///
/// Serialized as 16 lowercase hex digits. Comparison against stored values
/// goes through [`Fnv64::parse_hex`] so that unpadded values written by
/// older tools still compare equal.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fnv64(u64);

impl Default for Fnv64 {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Fnv64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fnv64:{}", self.to_hex())
    }
}

impl Fnv64 {
    /// A fresh accumulator: the state of the hash before any byte is folded in.
    pub fn new() -> Self {
        Self(OFFSET_BASIS)
    }

    /// Resume an accumulator from a previously computed value.
    pub fn from_value(value: u64) -> Self {
        Self(value)
    }

    /// Fold a buffer into the accumulator.
    pub fn update(&mut self, buf: &[u8]) {
        let mut h = self.0;
        for &b in buf {
            h = (h ^ u64::from(b)).wrapping_mul(PRIME);
        }
        self.0 = h;
    }

    /// The current hash value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Render as 16 lowercase hex digits.
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse a stored hex digest. Accepts unpadded values.
    pub fn parse_hex(raw: &str) -> Option<u64> {
        u64::from_str_radix(raw, 16).ok()
    }

    /// Hash a complete byte slice in one pass.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut h = Self::new();
        h.update(data);
        h
    }

    /// Hash everything a reader yields.
    pub fn of_reader(reader: &mut impl Read) -> std::io::Result<Self> {
        let mut h = Self::new();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return Ok(h),
                Ok(n) => h.update(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Hash the current content of the file at `path`.
    pub fn of_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::of_reader(&mut reader)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_constants() {
        // the documented offset basis is the empty-input hash
        assert_eq!(Fnv64::new().to_hex(), "14650fb0739d0383");
        assert_eq!(Fnv64::of_bytes(b"").value(), 0x14650FB0739D0383);
    }

    #[test]
    fn test_known_values() {
        assert_eq!(Fnv64::of_bytes(b"hello world\n").to_hex(), "40e9ba25b19a84e9");
        assert_eq!(
            Fnv64::of_bytes(b"this is clean data\n").to_hex(),
            "f31a23b2019aa27e"
        );
        assert_eq!(Fnv64::of_bytes(b"meta\n").to_hex(), "f627158e47324abc");
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        // any partition of the stream folds to the same value
        let mut h = Fnv64::new();
        h.update(b"hello");
        h.update(b" world\n");
        assert_eq!(h, Fnv64::of_bytes(b"hello world\n"));

        let mut h = Fnv64::new();
        for b in b"hello world\n" {
            h.update(&[*b]);
        }
        assert_eq!(h, Fnv64::of_bytes(b"hello world\n"));
    }

    #[test]
    fn test_of_reader() {
        let mut r = &b"this is clean data\n"[..];
        assert_eq!(
            Fnv64::of_reader(&mut r).unwrap(),
            Fnv64::of_bytes(b"this is clean data\n")
        );
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(
            Fnv64::parse_hex("40e9ba25b19a84e9"),
            Some(0x40e9ba25b19a84e9)
        );
        // unpadded values written by older tools still parse
        assert_eq!(Fnv64::parse_hex("abc"), Some(0xabc));
        assert_eq!(Fnv64::parse_hex(""), None);
        assert_eq!(Fnv64::parse_hex("not hex"), None);
        assert_eq!(Fnv64::parse_hex("112233445566778899"), None); // too wide
    }

    #[test]
    fn test_resume() {
        let first = Fnv64::of_bytes(b"hello");
        let mut resumed = Fnv64::from_value(first.value());
        resumed.update(b" world\n");
        assert_eq!(resumed, Fnv64::of_bytes(b"hello world\n"));
    }
}
