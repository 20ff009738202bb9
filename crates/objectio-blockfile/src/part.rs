//! Offset/part-index arithmetic.
//!
//! None of this module touches the cache or the backing store; it is pure
//! arithmetic so the write/read paths in `store.rs` can stay free of
//! off-by-one bugs around part boundaries and circular wraparound.

use bytes::Bytes;

/// One part's share of a write: which part, how many bytes into that part
/// the slice starts at, and whether the write fills the part completely
/// (`complete`). Incomplete parts must be hydrated from the backing store
/// before being rewritten, since bytes outside `data_range` survive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartWrite {
    pub part_idx: u64,
    pub part_offset: u64,
    /// Byte range within the caller's buffer that lands in this part.
    pub data_range: std::ops::Range<u64>,
    pub complete: bool,
}

/// Linear part index for a byte offset.
pub fn part_index(offset: u64, part_size: u64) -> u64 {
    offset / part_size
}

/// Circular part index: wraps into `[0, slots)`.
pub fn circular_part_index(offset: u64, part_size: u64, slots: u64) -> u64 {
    part_index(offset, part_size) % slots
}

/// Splits a write of `len` bytes starting at `offset` into per-part writes.
/// `part_idx` in the result is the *linear* index; callers writing a
/// circular file must reduce it modulo the slot count themselves (the slot
/// count is a property of the file's `Opts`, not of this pure arithmetic).
pub fn split_write(offset: u64, len: u64, part_size: u64) -> Vec<PartWrite> {
    if len == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut pos = offset;
    let end = offset + len;
    while pos < end {
        let part_idx = part_index(pos, part_size);
        let part_offset = pos % part_size;
        let chunk_end = (part_idx + 1) * part_size;
        let slice_end = chunk_end.min(end);
        let data_start = pos - offset;
        let data_end = slice_end - offset;
        let complete = part_offset == 0 && (slice_end - pos) == part_size;
        out.push(PartWrite {
            part_idx,
            part_offset,
            data_range: data_start..data_end,
            complete,
        });
        pos = slice_end;
    }
    out
}

/// Circular write-drop / offset-advance rule. Returns `None` if the
/// whole write would land before the addressable window and should be
/// silently dropped; otherwise returns `(adjusted_offset, data_skip,
/// adjusted_len)` where `data_skip` bytes must be skipped from the front of
/// the caller's buffer.
pub fn circular_write_adjust(
    offset: u64,
    len: u64,
    size: u64,
    max_size: u64,
) -> Option<(u64, u64, u64)> {
    if max_size == 0 || len == 0 {
        return Some((offset, 0, len));
    }
    let threshold = size.saturating_sub(max_size);
    if offset + len <= threshold {
        return None;
    }
    if offset < threshold {
        let drop = threshold - offset;
        Some((threshold, drop, len - drop))
    } else {
        Some((offset, 0, len))
    }
}

/// Read-side clamp used by `read_at`. `max_size
/// = None` (or `Some(0)`) means "not circular" and degenerates to the plain
/// linear clamp `min(len, size - offset)`.
///
/// Returns `(adjusted_offset, returned_len)`.
pub fn read_adjust(offset: u64, len: u64, file_size: u64, max_size: Option<u64>) -> (u64, u64) {
    let threshold = match max_size {
        Some(m) if m > 0 => file_size.saturating_sub(m),
        _ => 0,
    };
    let adjusted_offset = offset.max(threshold).min(file_size);
    let skip = adjusted_offset.saturating_sub(offset);
    let remaining = len.saturating_sub(skip);
    let returned_len = remaining.min(file_size.saturating_sub(adjusted_offset));
    (adjusted_offset, returned_len)
}

/// Linear or circular part indices spanned by `[offset, offset+len)`.
/// `slots` is `Some(n)` for circular files.
pub fn spanned_parts(offset: u64, len: u64, part_size: u64, slots: Option<u64>) -> Vec<u64> {
    if len == 0 {
        return Vec::new();
    }
    let first = part_index(offset, part_size);
    let last = part_index(offset + len - 1, part_size);
    (first..=last)
        .map(|p| match slots {
            Some(n) if n > 0 => p % n,
            _ => p,
        })
        .collect()
}
