//! Content digests for single records and whole snapshots.

use crmd_core::Record;
use sha2::{Digest, Sha256};

const FIELD_SEPARATOR: u8 = 0x1f;
const RECORD_SEPARATOR: u8 = 0x1e;

/// Feeds the canonical form of `record` into `hasher`.
///
/// Columns are visited in name order, and each value contributes its type tag and
/// canonical text, so `Null` and `Text("")` (or `Number(1)` and `Text("1")`) differ.
fn write_canonical(hasher: &mut Sha256, record: &Record) {
    for (column, value) in record.iter() {
        hasher.update(column.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(value.type_tag().as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        if let Some(text) = value.to_text() {
            hasher.update(text.as_bytes());
        }
        hasher.update([RECORD_SEPARATOR]);
    }
}

/// SHA-256 of the record's canonical form, as 64 lowercase hex characters.
pub fn record_fingerprint(record: &Record) -> String {
    let mut hasher = Sha256::new();
    write_canonical(&mut hasher, record);
    hex::encode(hasher.finalize())
}

/// Cheap aggregate digest of a whole snapshot, as 16 lowercase hex characters.
///
/// Each row contributes a 64-bit hash seeded with its position and the results are
/// summed with wrapping arithmetic, then the row count is folded in. This is
/// order-sensitive and good enough to notice content changes between loads, but it is
/// not collision-resistant: it is an audit value, never an integrity check.
pub fn dataset_fingerprint(rows: &[Record]) -> String {
    let mut sum: u64 = 0;
    for (position, row) in rows.iter().enumerate() {
        let mut hasher = Sha256::new();
        hasher.update((position as u64).to_le_bytes());
        write_canonical(&mut hasher, row);
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        sum = sum.wrapping_add(u64::from_le_bytes(head));
    }
    let folded = sum.wrapping_add((rows.len() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    format!("{folded:016x}")
}
