//! Fingerprint assembly: executed lines × blocks → checksum sets.
//!
//! A test's fingerprint for a file is the set of block checksums covering
//! the lines it executed, plus the module checksum whenever any line was
//! touched (body-only coverage still depends on the file's top-level
//! structure). Checksum sets travel and persist as packed little-endian
//! `u32` arrays with the length implicit in the byte length.

use std::collections::BTreeSet;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::{
    blocks::SourceModule,
    errors::{EzmonError, Result},
};

/// The checksum set one test observed for one file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub filename: String,
    /// Sorted, deduplicated block checksums.
    pub checksums: Vec<u32>,
}

impl FileFingerprint {
    /// Assemble the fingerprint for `filename` from the lines a test
    /// executed there. Returns `None` when no line was covered.
    pub fn assemble(
        filename: &str,
        lines: &BTreeSet<u32>,
        module: &SourceModule,
    ) -> Option<FileFingerprint> {
        if lines.is_empty() {
            return None;
        }
        // interval index over function blocks, ordered by start line
        let functions = module.function_blocks();
        let mut checksums: Vec<u32> = Vec::with_capacity(functions.len() + 1);
        for &line in lines {
            let idx = functions.partition_point(|b| b.start_line <= line);
            match idx.checked_sub(1).map(|i| &functions[i]) {
                Some(block) if block.end_line >= line => checksums.push(block.checksum),
                // line outside every function body: module level
                _ => checksums.push(module.module_block().checksum),
            }
        }
        // any touched line implies a dependency on the file skeleton
        checksums.push(module.module_block().checksum);
        checksums.sort_unstable();
        checksums.dedup();
        Some(FileFingerprint {
            filename: filename.to_string(),
            checksums,
        })
    }
}

/// Pack sorted checksums into a little-endian byte array.
pub fn pack_checksums(checksums: &[u32]) -> Vec<u8> {
    let mut bytes = vec![0u8; checksums.len() * 4];
    LittleEndian::write_u32_into(checksums, &mut bytes);
    bytes
}

/// Unpack a little-endian byte array back into checksums. A length that
/// is not a multiple of four marks the row as corrupt.
pub fn unpack_checksums(filename: &str, bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(EzmonError::CorruptFingerprint(
            filename.to_string(),
            bytes.len(),
        ));
    }
    let mut checksums = vec![0u32; bytes.len() / 4];
    LittleEndian::read_u32_into(bytes, &mut checksums);
    Ok(checksums)
}

/// Multiset-subset test over two sorted checksum slices: every stored
/// checksum must still exist in the current set. New checksums on the
/// current side never fail the match.
pub fn is_subset(stored: &[u32], current: &[u32]) -> bool {
    let mut cur = current.iter();
    'stored: for want in stored {
        for have in cur.by_ref() {
            match have.cmp(want) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => continue 'stored,
                std::cmp::Ordering::Greater => return false,
            }
        }
        return false;
    }
    true
}
