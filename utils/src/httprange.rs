//! Parsing for HTTP `Range` request headers.
//!
//! Supports the single-range `bytes=` forms (`a-b`, `a-`, `-n`), which is
//! all the file endpoints serve. Multiple ranges and non-byte units are
//! rejected.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid range header format")]
pub struct InvalidRange;

/// A resolved byte range against a known entity size, carrying the
/// `Content-Range` value for the 206 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
    pub content_range: String,
}

/// Resolves `header` (e.g. `bytes=100-500`) against an entity of `size`
/// bytes.
pub fn parse(header: &str, size: u64) -> Result<ByteRange, InvalidRange> {
    let spec = header.strip_prefix("bytes=").ok_or(InvalidRange)?;
    let size = i64::try_from(size).map_err(|_| InvalidRange)?;

    let (start, end) = if let Some(suffix) = spec.strip_prefix('-') {
        // "-n": the final n bytes.
        let n: i64 = parse_int(suffix)?;
        (size - n, size - 1)
    } else if let Some(prefix) = spec.strip_suffix('-') {
        // "a-": from a to the end.
        (parse_int(prefix)?, size - 1)
    } else {
        let (a, b) = spec.split_once('-').ok_or(InvalidRange)?;
        (parse_int(a)?, parse_int(b)?)
    };

    if start > end || start > size || end > size || start < 0 || end < 0 {
        return Err(InvalidRange);
    }

    Ok(ByteRange {
        start: start as u64,
        length: (end - start + 1) as u64,
        content_range: format!("bytes {start}-{end}/{size}"),
    })
}

fn parse_int(value: &str) -> Result<i64, InvalidRange> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InvalidRange);
    }
    value.parse().map_err(|_| InvalidRange)
}
