//! Freshness classification.
//!
//! Pure functions only: classifying never touches the store.

use std::fmt;

use serde::Serialize;
use time::OffsetDateTime;

use super::config::FreshnessPolicy;
use super::metadata::CacheMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// No metadata row for the key.
    Missing,
    /// `now < last_refresh + stale_threshold`.
    Fresh,
    /// `last_refresh + stale_threshold <= now < expires_at`.
    Stale,
    /// `now >= expires_at`.
    Expired,
}

impl Freshness {
    pub fn as_str(self) -> &'static str {
        match self {
            Freshness::Missing => "missing",
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
            Freshness::Expired => "expired",
        }
    }

    /// What a reader must do before (or after) handing data out.
    pub fn decision(self) -> ReadDecision {
        match self {
            Freshness::Fresh => ReadDecision::Serve,
            Freshness::Stale => ReadDecision::ServeAndRevalidate,
            Freshness::Missing | Freshness::Expired => ReadDecision::RefreshBlocking,
        }
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDecision {
    /// Return stored rows, no network.
    Serve,
    /// Return stored rows now and refresh in the background.
    ServeAndRevalidate,
    /// Wait for a network refresh before returning.
    RefreshBlocking,
}

pub fn classify(
    metadata: Option<&CacheMetadata>,
    policy: FreshnessPolicy,
    now: OffsetDateTime,
) -> Freshness {
    let Some(metadata) = metadata else {
        return Freshness::Missing;
    };

    if now >= metadata.expires_at {
        Freshness::Expired
    } else if now >= metadata.stale_at(policy) {
        Freshness::Stale
    } else {
        Freshness::Fresh
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::macros::datetime;

    use super::*;
    use crate::cache::keys::CacheKey;

    fn policy(stale_ms: u64, expiry_ms: u64) -> FreshnessPolicy {
        FreshnessPolicy::new(
            Duration::from_millis(stale_ms),
            Duration::from_millis(expiry_ms),
        )
    }

    fn at(ms: u64) -> OffsetDateTime {
        datetime!(2024-03-01 12:00 UTC) + Duration::from_millis(ms)
    }

    #[test]
    fn missing_without_metadata() {
        assert_eq!(classify(None, policy(10, 20), at(0)), Freshness::Missing);
    }

    #[test]
    fn boundaries_follow_half_open_windows() {
        let policy = policy(1_000, 5_000);
        let meta = CacheMetadata::refreshed(CacheKey::AllPosts, at(0), policy);

        assert_eq!(classify(Some(&meta), policy, at(0)), Freshness::Fresh);
        assert_eq!(classify(Some(&meta), policy, at(999)), Freshness::Fresh);
        assert_eq!(classify(Some(&meta), policy, at(1_000)), Freshness::Stale);
        assert_eq!(classify(Some(&meta), policy, at(4_999)), Freshness::Stale);
        assert_eq!(classify(Some(&meta), policy, at(5_000)), Freshness::Expired);
        assert_eq!(classify(Some(&meta), policy, at(9_000)), Freshness::Expired);
    }

    #[test]
    fn zero_stale_threshold_is_immediately_stale() {
        let policy = policy(0, 3_600_000);
        let meta = CacheMetadata::refreshed(CacheKey::Categories, at(0), policy);

        assert_eq!(classify(Some(&meta), policy, at(0)), Freshness::Stale);
        assert_eq!(classify(Some(&meta), policy, at(1_000)), Freshness::Stale);
        assert_eq!(
            classify(Some(&meta), policy, at(3_600_001)),
            Freshness::Expired
        );
    }

    #[test]
    fn invalidated_metadata_is_expired() {
        let policy = policy(1_000, 5_000);
        let meta = CacheMetadata::refreshed(CacheKey::AllPosts, at(0), policy).invalidated();

        assert_eq!(classify(Some(&meta), policy, at(0)), Freshness::Expired);
    }

    #[test]
    fn clock_behind_last_refresh_is_fresh() {
        let policy = policy(1_000, 5_000);
        let meta = CacheMetadata::refreshed(CacheKey::AllPosts, at(10_000), policy);

        assert_eq!(classify(Some(&meta), policy, at(0)), Freshness::Fresh);
    }

    #[test]
    fn exhaustive_grid_matches_definitions() {
        for stale in [0_u64, 1, 500, 1_000] {
            for expiry in [stale.max(1), 1_000, 2_000] {
                if stale > expiry {
                    continue;
                }
                let policy = policy(stale, expiry);
                let meta = CacheMetadata::refreshed(CacheKey::AllPosts, at(0), policy);
                for now in 0..=2_500_u64 {
                    let expected = if now >= expiry {
                        Freshness::Expired
                    } else if now >= stale {
                        Freshness::Stale
                    } else {
                        Freshness::Fresh
                    };
                    assert_eq!(
                        classify(Some(&meta), policy, at(now)),
                        expected,
                        "stale={stale} expiry={expiry} now={now}"
                    );
                }
            }
        }
    }

    #[test]
    fn decisions_per_freshness() {
        assert_eq!(Freshness::Fresh.decision(), ReadDecision::Serve);
        assert_eq!(
            Freshness::Stale.decision(),
            ReadDecision::ServeAndRevalidate
        );
        assert_eq!(Freshness::Missing.decision(), ReadDecision::RefreshBlocking);
        assert_eq!(Freshness::Expired.decision(), ReadDecision::RefreshBlocking);
    }
}
