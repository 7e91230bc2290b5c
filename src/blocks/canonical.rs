//! Canonical text form used for block checksums.
//!
//! Full-line comments and blank-only lines are dropped; every byte of the
//! remaining lines is kept verbatim, indentation and string contents
//! included. Checksums are IEEE CRC32 over the canonical bytes, so a
//! comment-only or blank-line-only edit never perturbs any checksum.

use crc32fast::Hasher;
use memchr::memchr;

/// Strip full-line comments and blank-only lines, keeping all other
/// bytes untouched. Retained lines are joined with `\n`.
pub fn canonicalize(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut rest = text.as_bytes();
    loop {
        let (line, remainder) = match memchr(b'\n', rest) {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, &[][..]),
        };
        if keep_line(line) {
            out.extend_from_slice(line);
            out.push(b'\n');
        }
        if remainder.is_empty() {
            break;
        }
        rest = remainder;
    }
    out
}

/// CRC32 of the canonical form of `text`.
pub fn checksum(text: &str) -> u32 {
    crc32(&canonicalize(text))
}

/// IEEE CRC32 over raw bytes (used directly for unparseable files).
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn keep_line(line: &[u8]) -> bool {
    let trimmed = trim_start(line);
    !(trimmed.is_empty() || trimmed.starts_with(b"//"))
}

fn trim_start(line: &[u8]) -> &[u8] {
    let mut i = 0;
    while i < line.len() && (line[i] == b' ' || line[i] == b'\t' || line[i] == b'\r') {
        i += 1;
    }
    &line[i..]
}
