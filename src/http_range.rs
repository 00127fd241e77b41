/// A single `bytes=<start>-<end?>` request as written by the client,
/// before it is checked against a body length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

impl RangeSpec {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    Unsatisfiable { size: u64 },
}

/// Parses `bytes=<start>-<end?>`. Suffix ranges, multi-range lists and any
/// other shape return `None` so callers fall back to the full body.
pub fn parse_range(header: &str) -> Option<ByteRange> {
    let range = header.trim().strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    let start = parse_digits(start.trim())?;
    let end = end.trim();
    let end = if end.is_empty() {
        None
    } else {
        Some(parse_digits(end)?)
    };
    Some(ByteRange { start, end })
}

fn parse_digits(raw: &str) -> Option<u64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// Checks a parsed range against `size`. Unlike lenient proxies, an end
/// past the last byte is not clamped.
pub fn resolve(range: ByteRange, size: u64) -> Result<RangeSpec, RangeError> {
    let end = match range.end {
        Some(end) => end,
        None if size == 0 => return Err(RangeError::Unsatisfiable { size }),
        None => size - 1,
    };
    if range.start >= size || end >= size || range.start > end {
        return Err(RangeError::Unsatisfiable { size });
    }
    Ok(RangeSpec {
        start: range.start,
        end,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

pub fn parse_content_range(header: &str) -> Option<ContentRange> {
    // bytes start-end/size
    let rest = header.trim().strip_prefix("bytes")?.trim_start();
    let (range_part, size_part) = rest.split_once('/')?;
    let (start, end) = range_part.split_once('-')?;
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        size: size_part.trim().parse().ok()?,
    })
}

pub fn build_content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, size)
}

pub fn build_unsatisfied_range(size: u64) -> String {
    format!("bytes */{}", size)
}
