//! Lenient semantic-version ordering for catalog version lists.

use std::cmp::Ordering;

/// Numeric components of a version string, padded to at least three.
///
/// Pre-release (`-…`) and build (`+…`) suffixes and a leading `v` are
/// ignored; components that are not numbers count as 0.
pub fn parse_version(raw: &str) -> Vec<u64> {
    let core = raw.trim();
    let core = core.strip_prefix(['v', 'V']).unwrap_or(core);
    let core = core.split(['-', '+']).next().unwrap_or("");

    let mut parts: Vec<u64> = core
        .split('.')
        .map(|segment| segment.trim().parse::<u64>().unwrap_or(0))
        .collect();
    while parts.len() < 3 {
        parts.push(0);
    }
    parts
}

pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = parse_version(a);
    let right = parse_version(b);
    let len = left.len().max(right.len());
    (0..len)
        .map(|i| {
            let l = left.get(i).copied().unwrap_or(0);
            let r = right.get(i).copied().unwrap_or(0);
            l.cmp(&r)
        })
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Stable sort, highest version first.
pub fn sort_descending<T>(items: &mut [T], version_of: impl Fn(&T) -> &str) {
    items.sort_by(|a, b| compare_versions(version_of(b), version_of(a)));
}
