use crate::error::EtlError;

/// 单个字节区间（RFC 7233），保证 `start + length <= size` 且 `length > 0`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HttpRange {
    pub start: u64,
    pub length: u64,
}

impl HttpRange {
    pub fn whole(size: u64) -> Self {
        Self { start: 0, length: size }
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("invalid range: {0}")]
    Invalid(String),
    /// 所有子区间都从 size 之后开始
    #[error("failed to overlap")]
    Overlap,
}

impl RangeError {
    /// 转换为对外错误；Overlap 需要带上内容大小（用于 `Content-Range: bytes */<size>`）
    pub fn into_etl(self, size: u64) -> EtlError {
        match self {
            RangeError::Invalid(msg) => EtlError::BadInput(format!("invalid range: {msg}")),
            RangeError::Overlap => EtlError::Overlap { size },
        }
    }
}

const BYTES_PREFIX: &str = "bytes=";

/// 解析 `Range` 头；没有头时返回整个对象。
///
/// 只接受单个可满足的区间：多个区间直接拒绝，越界的子区间被忽略，
/// 全部越界时返回 [`RangeError::Overlap`]。
pub fn parse_range(header: Option<&str>, size: u64) -> Result<HttpRange, RangeError> {
    let Some(raw) = header else {
        return Ok(HttpRange::whole(size));
    };

    let spec = raw
        .strip_prefix(BYTES_PREFIX)
        .ok_or_else(|| RangeError::Invalid(format!("expected {BYTES_PREFIX:?} prefix in {raw:?}")))?;

    let mut ranges = Vec::new();
    let mut no_overlap = false;
    for clause in spec.split(',') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        match parse_clause(clause, size)? {
            Some(r) => ranges.push(r),
            None => no_overlap = true,
        }
    }

    match ranges.len() {
        0 if no_overlap => {
            tracing::debug!("range {:?} does not overlap content of size {}", raw, size);
            Err(RangeError::Overlap)
        }
        0 => Err(RangeError::Invalid(format!("no range intervals in {raw:?}"))),
        1 => Ok(ranges[0]),
        n => Err(RangeError::Invalid(format!("expected one range interval, got {n}"))),
    }
}

/// `Ok(None)` 表示该子区间与内容不相交
fn parse_clause(clause: &str, size: u64) -> Result<Option<HttpRange>, RangeError> {
    let (start, end) = clause
        .split_once('-')
        .ok_or_else(|| RangeError::Invalid(format!("missing '-' in {clause:?}")))?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // 后缀区间：最后 N 个字节
        let suffix = parse_num(end)?;
        let length = suffix.min(size);
        if length == 0 {
            return Ok(None);
        }
        return Ok(Some(HttpRange { start: size - length, length }));
    }

    let start = parse_num(start)?;
    if start >= size {
        return Ok(None);
    }
    let length = if end.is_empty() {
        size - start
    } else {
        let end = parse_num(end)?;
        if start > end {
            return Err(RangeError::Invalid(format!("start {start} is after end {end}")));
        }
        end.min(size - 1) - start + 1
    };
    Ok(Some(HttpRange { start, length }))
}

fn parse_num(s: &str) -> Result<u64, RangeError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Invalid(format!("{s:?} is not a byte offset")));
    }
    s.parse::<u64>()
        .map_err(|e| RangeError::Invalid(format!("{s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_header_is_whole_object() {
        assert_eq!(parse_range(None, 10).unwrap(), HttpRange { start: 0, length: 10 });
        assert_eq!(parse_range(None, 0).unwrap(), HttpRange { start: 0, length: 0 });
    }

    #[test]
    fn open_ended_from_zero_is_whole_file() {
        assert_eq!(parse_range(Some("bytes=0-"), 10).unwrap(), HttpRange::whole(10));
    }

    #[test]
    fn start_at_size_does_not_overlap() {
        assert_eq!(parse_range(Some("bytes=10-"), 10), Err(RangeError::Overlap));
        assert_eq!(parse_range(Some("bytes=0-"), 0), Err(RangeError::Overlap));
        assert_eq!(
            RangeError::Overlap.into_etl(10).to_string(),
            "requested range not satisfiable (size 10)"
        );
    }

    #[test]
    fn suffix_longer_than_size_is_whole_file() {
        assert_eq!(parse_range(Some("bytes=-100"), 10).unwrap(), HttpRange::whole(10));
        assert_eq!(
            parse_range(Some("bytes=-3"), 10).unwrap(),
            HttpRange { start: 7, length: 3 }
        );
        assert_eq!(parse_range(Some("bytes=-0"), 10), Err(RangeError::Overlap));
    }

    #[test]
    fn bounded_range_is_clamped() {
        assert_eq!(
            parse_range(Some("bytes=2-4"), 10).unwrap(),
            HttpRange { start: 2, length: 3 }
        );
        assert_eq!(
            parse_range(Some("bytes= 5 - 100"), 10).unwrap(),
            HttpRange { start: 5, length: 5 }
        );
    }

    #[test]
    fn malformed_and_multi_ranges_rejected() {
        for bad in ["items=0-1", "bytes=abc", "bytes=5-2", "bytes=-x", "bytes=", "bytes=+1-2"] {
            assert!(
                matches!(parse_range(Some(bad), 10), Err(RangeError::Invalid(_))),
                "{bad} should be invalid"
            );
        }
        assert!(matches!(
            parse_range(Some("bytes=0-1,3-4"), 10),
            Err(RangeError::Invalid(_))
        ));
        // 越界子区间被忽略，只剩一个有效区间
        assert_eq!(
            parse_range(Some("bytes=0-1,50-"), 10).unwrap(),
            HttpRange { start: 0, length: 2 }
        );
    }

    #[test]
    fn success_always_within_bounds() {
        let headers = [
            "bytes=0-", "bytes=0-0", "bytes=-1", "bytes=-7", "bytes=3-", "bytes=6-6",
            "bytes=1-1000", "bytes=9-",
        ];
        for size in 0..12u64 {
            for h in headers {
                if let Ok(r) = parse_range(Some(h), size) {
                    assert!(r.length > 0, "{h} size={size}");
                    assert!(r.end() <= size, "{h} size={size}");
                    assert_eq!(parse_range(Some(h), size), Ok(r));
                }
            }
        }
    }
}
