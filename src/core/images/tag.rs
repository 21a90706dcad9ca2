// src/core/images/tag.rs

//! Parsing and ordering of Rubin Science Platform image tags.
//!
//! Tag grammar: release `r{MAJOR}_{MINOR}_{PATCH}`, weekly `w_{YYYY}_{WW}`,
//! daily `d_{YYYY}_{MM}_{DD}`, release-candidate `r{MAJOR}_{MINOR}_{PATCH}_rc{N}`,
//! each optionally followed by `_c{N}` (cycle) and/or `_{NNN}` (build).
//! Anything not matching one of these forms, plus designated alias names
//! such as `recommended`, falls outside the grammar entirely.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TagClass {
    Release,
    ReleaseCandidate,
    Weekly,
    Daily,
    Experimental,
    Alias,
    Unknown,
}

impl TagClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagClass::Release => "release",
            TagClass::ReleaseCandidate => "release-candidate",
            TagClass::Weekly => "weekly",
            TagClass::Daily => "daily",
            TagClass::Experimental => "experimental",
            TagClass::Alias => "alias",
            TagClass::Unknown => "unknown",
        }
    }
}

/// The ordering key within a class: larger sorts more recent. Variant arity
/// differs by class (a release has 3 numeric fields, a weekly has 2, a
/// daily has 3), so this is a deliberately loose tuple padded with zeroes
/// rather than a per-class struct, keeping `RSPTag::cmp_within_class` a
/// single flat comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct VersionKey(pub i64, pub i64, pub i64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RSPTag {
    pub raw: String,
    pub class: TagClass,
    pub version: VersionKey,
    pub cycle: Option<u16>,
    pub build: Option<u32>,
    pub description: String,
}

static RELEASE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^r(\d+)_(\d+)_(\d+)(?:_rc(\d+))?(?:_c(\d+))?(?:_(\d+))?$").unwrap()
});
static WEEKLY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^w_(\d{4})_(\d{1,2})(?:_c(\d+))?(?:_(\d+))?$").unwrap());
static DAILY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^d_(\d{4})_(\d{2})_(\d{2})(?:_c(\d+))?(?:_(\d+))?$").unwrap());
static EXPERIMENTAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^exp_(.+)$").unwrap());

/// Tag names that are always treated as aliases pointing at some other,
/// fully-versioned tag rather than encoding a version themselves.
const KNOWN_ALIASES: &[&str] = &["recommended", "latest", "latest_weekly", "latest_daily"];

impl RSPTag {
    /// Parses `raw` into an `RSPTag`. Total: unparseable input becomes
    /// `TagClass::Unknown` rather than an error, since the catalog must be
    /// buildable from an arbitrary, possibly-foreign tag list.
    pub fn parse(raw: &str) -> Self {
        if KNOWN_ALIASES.contains(&raw) {
            return Self {
                raw: raw.to_string(),
                class: TagClass::Alias,
                version: VersionKey::default(),
                cycle: None,
                build: None,
                description: format!("Alias: {raw}"),
            };
        }

        if let Some(caps) = RELEASE_RE.captures(raw) {
            let major: i64 = caps[1].parse().unwrap_or(0);
            let minor: i64 = caps[2].parse().unwrap_or(0);
            let patch: i64 = caps[3].parse().unwrap_or(0);
            let rc = caps.get(4).map(|m| m.as_str());
            let cycle = caps.get(5).and_then(|m| m.as_str().parse().ok());
            let build = caps.get(6).and_then(|m| m.as_str().parse().ok());

            return if let Some(rc) = rc {
                let rc_num: i64 = rc.parse().unwrap_or(0);
                Self {
                    raw: raw.to_string(),
                    class: TagClass::ReleaseCandidate,
                    // An rc sorts just below its final release of the same
                    // version, so the rc number contributes negatively.
                    version: VersionKey(major, minor, patch * 1000 - (1000 - rc_num)),
                    cycle,
                    build,
                    description: format!("Release candidate r{major}.{minor}.{patch} rc{rc_num}"),
                }
            } else {
                Self {
                    raw: raw.to_string(),
                    class: TagClass::Release,
                    version: VersionKey(major, minor, patch * 1000),
                    cycle,
                    build,
                    description: format!("Release r{major}.{minor}.{patch}"),
                }
            };
        }

        if let Some(caps) = WEEKLY_RE.captures(raw) {
            let year: i64 = caps[1].parse().unwrap_or(0);
            let week: i64 = caps[2].parse().unwrap_or(0);
            let cycle = caps.get(3).and_then(|m| m.as_str().parse().ok());
            let build = caps.get(4).and_then(|m| m.as_str().parse().ok());
            return Self {
                raw: raw.to_string(),
                class: TagClass::Weekly,
                version: VersionKey(year, week, 0),
                cycle,
                build,
                description: format!("Weekly {year}_{week:02}"),
            };
        }

        if let Some(caps) = DAILY_RE.captures(raw) {
            let year: i64 = caps[1].parse().unwrap_or(0);
            let month: i64 = caps[2].parse().unwrap_or(0);
            let day: i64 = caps[3].parse().unwrap_or(0);
            let cycle = caps.get(4).and_then(|m| m.as_str().parse().ok());
            let build = caps.get(5).and_then(|m| m.as_str().parse().ok());
            return Self {
                raw: raw.to_string(),
                class: TagClass::Daily,
                version: VersionKey(year, month, day),
                cycle,
                build,
                description: format!("Daily {year}-{month:02}-{day:02}"),
            };
        }

        if let Some(caps) = EXPERIMENTAL_RE.captures(raw) {
            return Self {
                raw: raw.to_string(),
                class: TagClass::Experimental,
                version: VersionKey::default(),
                cycle: None,
                build: None,
                description: format!("Experimental: {}", &caps[1]),
            };
        }

        Self {
            raw: raw.to_string(),
            class: TagClass::Unknown,
            version: VersionKey::default(),
            cycle: None,
            build: None,
            description: raw.to_string(),
        }
    }

    /// Orders two tags of the *same* class, descending by recency (newest
    /// first). Within equal version keys, higher build numbers are more
    /// recent. Callers must not compare tags across classes with this;
    /// cross-class order is not defined and classes are always
    /// partitioned before sorting.
    pub fn cmp_within_class(&self, other: &Self) -> std::cmp::Ordering {
        other
            .version
            .cmp(&self.version)
            .then_with(|| other.build.unwrap_or(0).cmp(&self.build.unwrap_or(0)))
            .then_with(|| self.raw.cmp(&other.raw))
    }

    pub fn is_alias(&self) -> bool {
        self.class == TagClass::Alias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_release_tag() {
        let tag = RSPTag::parse("r25_1_0");
        assert_eq!(tag.class, TagClass::Release);
        assert_eq!(tag.version, VersionKey(25, 1, 0));
    }

    #[test]
    fn parses_weekly_tag_with_cycle_and_build() {
        let tag = RSPTag::parse("w_2024_15_c1_002");
        assert_eq!(tag.class, TagClass::Weekly);
        assert_eq!(tag.version, VersionKey(2024, 15, 0));
        assert_eq!(tag.cycle, Some(1));
        assert_eq!(tag.build, Some(2));
    }

    #[test]
    fn parses_daily_tag() {
        let tag = RSPTag::parse("d_2024_03_15");
        assert_eq!(tag.class, TagClass::Daily);
        assert_eq!(tag.version, VersionKey(2024, 3, 15));
    }

    #[test]
    fn release_candidate_sorts_below_final_release() {
        let rc = RSPTag::parse("r25_1_0_rc1");
        let release = RSPTag::parse("r25_1_0");
        assert_eq!(rc.class, TagClass::ReleaseCandidate);
        assert_eq!(release.class, TagClass::Release);
    }

    #[test]
    fn recommended_is_an_alias() {
        let tag = RSPTag::parse("recommended");
        assert!(tag.is_alias());
    }

    #[test]
    fn unparseable_tag_is_unknown_not_an_error() {
        let tag = RSPTag::parse("some-random-string");
        assert_eq!(tag.class, TagClass::Unknown);
    }

    #[test]
    fn newer_weekly_sorts_before_older_weekly() {
        let newer = RSPTag::parse("w_2024_20");
        let older = RSPTag::parse("w_2024_10");
        assert_eq!(newer.cmp_within_class(&older), std::cmp::Ordering::Less);
    }
}
