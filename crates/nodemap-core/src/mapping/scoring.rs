//! Popularity scoring with recency decay, and the two-stage ranking that
//! turns scored entries into persisted, rank-only mapping entries.

use chrono::{DateTime, Utc};

use crate::config::ScoringPolicy;
use crate::models::{parse_timestamp, MappingEntry, PackageRecord};

/// A mapping entry paired with the transient score used to rank it.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MappingEntry,
    pub score: f64,
}

impl ScoredEntry {
    pub fn new(entry: MappingEntry, score: f64) -> Self {
        Self { entry, score }
    }
}

pub fn popularity(downloads: u64, github_stars: u64, policy: &ScoringPolicy) -> f64 {
    let raw = downloads as f64 / policy.download_divisor + github_stars as f64 * policy.star_weight;
    raw.max(policy.min_score)
}

/// Step multiplier for a package whose newest release is `latest`.
pub fn recency_multiplier(
    latest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &ScoringPolicy,
) -> f64 {
    let Some(latest) = latest else {
        return 1.0;
    };
    let days_old = (now - latest).num_days();
    policy
        .recency_steps
        .iter()
        .find(|(bound, _)| days_old < *bound)
        .map_or(policy.stale_multiplier, |(_, multiplier)| *multiplier)
}

/// Newest parsable release date among the catalogued versions.
pub fn latest_release(package: &PackageRecord) -> Option<DateTime<Utc>> {
    package
        .versions
        .values()
        .filter_map(|v| parse_timestamp(&v.release_date))
        .max()
}

pub fn package_score(package: &PackageRecord, policy: &ScoringPolicy, now: DateTime<Utc>) -> f64 {
    popularity(package.downloads, package.github_stars, policy)
        * recency_multiplier(latest_release(package), now, policy)
}

/// Stable-sort by descending score, assign contiguous 1-based ranks and drop
/// the scores.
pub fn rank_entries(mut scored: Vec<ScoredEntry>) -> Vec<MappingEntry> {
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
        .into_iter()
        .enumerate()
        .map(|(i, scored)| MappingEntry {
            rank: i as u32 + 1,
            ..scored.entry
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PackageVersion;

    fn entry(id: &str) -> MappingEntry {
        MappingEntry {
            package_id: id.to_string(),
            versions: vec![],
            rank: 0,
            source: None,
        }
    }

    #[test]
    fn test_popularity_formula_and_floor() {
        let policy = ScoringPolicy::default();
        assert_eq!(popularity(10_000, 500, &policy), 2000.0);
        assert_eq!(popularity(500, 5, &policy), 60.0);
        assert_eq!(popularity(0, 0, &policy), 0.1);
    }

    #[test]
    fn test_recency_steps() {
        let policy = ScoringPolicy::default();
        let now = parse_timestamp("2025-06-01T00:00:00Z").unwrap();
        let days_ago = |d: i64| Some(now - chrono::Duration::days(d));

        assert_eq!(recency_multiplier(None, now, &policy), 1.0);
        assert_eq!(recency_multiplier(days_ago(0), now, &policy), 1.0);
        assert_eq!(recency_multiplier(days_ago(89), now, &policy), 1.0);
        assert_eq!(recency_multiplier(days_ago(90), now, &policy), 0.95);
        assert_eq!(recency_multiplier(days_ago(179), now, &policy), 0.95);
        assert_eq!(recency_multiplier(days_ago(180), now, &policy), 0.85);
        assert_eq!(recency_multiplier(days_ago(364), now, &policy), 0.85);
        assert_eq!(recency_multiplier(days_ago(365), now, &policy), 0.70);
        assert_eq!(recency_multiplier(days_ago(729), now, &policy), 0.70);
        assert_eq!(recency_multiplier(days_ago(730), now, &policy), 0.50);
        assert_eq!(recency_multiplier(days_ago(5000), now, &policy), 0.50);
        // Releases dated in the future are treated as fresh.
        assert_eq!(recency_multiplier(days_ago(-3), now, &policy), 1.0);
    }

    #[test]
    fn test_latest_release_ignores_unparsable_dates() {
        let mut package = PackageRecord::default();
        for (v, date) in [
            ("1.0.0", "2024-01-01T00:00:00Z"),
            ("1.1.0", "garbage"),
            ("0.9.0", "2023-01-01"),
        ] {
            package.versions.insert(
                v.to_string(),
                PackageVersion {
                    version: v.to_string(),
                    release_date: date.to_string(),
                    ..PackageVersion::default()
                },
            );
        }
        assert_eq!(
            latest_release(&package),
            parse_timestamp("2024-01-01T00:00:00Z")
        );
        assert!(latest_release(&PackageRecord::default()).is_none());
    }

    #[test]
    fn test_package_score_applies_recency() {
        let policy = ScoringPolicy::default();
        let now = parse_timestamp("2025-06-01T00:00:00Z").unwrap();
        let mut package = PackageRecord {
            downloads: 1000,
            ..PackageRecord::default()
        };
        package.versions.insert(
            "1.0.0".into(),
            PackageVersion {
                version: "1.0.0".into(),
                release_date: "2022-01-01T00:00:00Z".into(),
                ..PackageVersion::default()
            },
        );
        assert_eq!(package_score(&package, &policy, now), 50.0);
    }

    #[test]
    fn test_rank_is_contiguous_and_stable() {
        let ranked = rank_entries(vec![
            ScoredEntry::new(entry("low"), 1.0),
            ScoredEntry::new(entry("tie_a"), 5.0),
            ScoredEntry::new(entry("high"), 9.0),
            ScoredEntry::new(entry("tie_b"), 5.0),
        ]);
        let order: Vec<(&str, u32)> = ranked
            .iter()
            .map(|e| (e.package_id.as_str(), e.rank))
            .collect();
        assert_eq!(
            order,
            vec![("high", 1), ("tie_a", 2), ("tie_b", 3), ("low", 4)]
        );
    }
}
