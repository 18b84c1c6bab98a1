//! Included ranges: the `[start_byte, end_byte)` slices of the input a
//! parser or tree is allowed to see. Bytes outside any range are invisible.

use crate::length::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Range {
    pub start_byte: u32,
    pub end_byte: u32,
    pub start_point: Point,
    pub end_point: Point,
}

impl Range {
    pub const WHOLE_DOCUMENT: Range = Range {
        start_byte: 0,
        end_byte: u32::MAX,
        start_point: Point::ZERO,
        end_point: Point::MAX,
    };

    pub fn byte_range(&self) -> std::ops::Range<u32> {
        self.start_byte..self.end_byte
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("included ranges must be non-overlapping and sorted")]
pub struct IncludedRangeError;

/// Validates that `ranges` are sorted and non-overlapping, as required by
/// `set_included_ranges`.
pub fn validate(ranges: &[Range]) -> Result<(), IncludedRangeError> {
    for pair in ranges.windows(2) {
        if pair[0].end_byte > pair[1].start_byte {
            return Err(IncludedRangeError);
        }
    }
    Ok(())
}

/// The symmetric byte-coverage difference of two included-range lists: the
/// byte spans covered by exactly one of the two lists. Used both by reuse
/// eligibility (§4.4's reusable-node iterator) and the changed-range diff
/// (§4.5.1).
pub fn symmetric_difference(a: &[Range], b: &[Range]) -> Vec<std::ops::Range<u32>> {
    let mut boundaries: Vec<u32> = Vec::new();
    for r in a.iter().chain(b) {
        boundaries.push(r.start_byte);
        boundaries.push(r.end_byte);
    }
    boundaries.sort_unstable();
    boundaries.dedup();

    let covers = |ranges: &[Range], point: u32| ranges.iter().any(|r| r.start_byte <= point && point < r.end_byte);

    let mut out = Vec::new();
    for w in boundaries.windows(2) {
        let (start, end) = (w[0], w[1]);
        if start >= end {
            continue;
        }
        let in_a = covers(a, start);
        let in_b = covers(b, start);
        if in_a != in_b {
            if let Some(last) = out.last_mut() {
                let last: &mut std::ops::Range<u32> = last;
                if last.end == start {
                    last.end = end;
                    continue;
                }
            }
            out.push(start..end);
        }
    }
    out
}

pub fn intersects(differences: &[std::ops::Range<u32>], span: std::ops::Range<u32>) -> bool {
    differences.iter().any(|d| d.start < span.end && span.start < d.end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(s: u32, e: u32) -> Range {
        Range { start_byte: s, end_byte: e, start_point: Point::ZERO, end_point: Point::ZERO }
    }

    #[test]
    fn validate_rejects_overlap() {
        let ranges = vec![range(0, 10), range(5, 20)];
        assert!(validate(&ranges).is_err());
    }

    #[test]
    fn validate_accepts_sorted_disjoint() {
        let ranges = vec![range(0, 10), range(10, 20)];
        assert!(validate(&ranges).is_ok());
    }

    #[test]
    fn symmetric_difference_of_equal_lists_is_empty() {
        let a = vec![range(0, 10)];
        let b = vec![range(0, 10)];
        assert!(symmetric_difference(&a, &b).is_empty());
    }

    #[test]
    fn symmetric_difference_finds_shrunk_range() {
        let a = vec![range(0, 10)];
        let b = vec![range(0, 5)];
        let diff = symmetric_difference(&a, &b);
        assert_eq!(diff, vec![5..10]);
    }
}
