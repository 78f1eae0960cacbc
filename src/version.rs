// Copyright (c) 2025 Sean McNamara <smcnam@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Release-version lineage: a minimal semver comparator restricted to the
//! `vMAJOR.MINOR.PATCH` tag shape, compared by the natural product order on
//! (major, minor, patch) rather than by string ordering.

use once_cell::sync::Lazy;
use regex::Regex;

static CANONICAL_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^v(\d+)\.(\d+)\.(\d+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bump {
    Minor,
    Patch,
}

impl Version {
    pub fn parse(tag: &str) -> Option<Self> {
        let caps = CANONICAL_TAG.captures(tag)?;
        Some(Version {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
            patch: caps[3].parse().ok()?,
        })
    }

    pub fn to_tag(self) -> String {
        format!("v{}.{}.{}", self.major, self.minor, self.patch)
    }

    pub fn bump(self, bump: Bump) -> Self {
        match bump {
            Bump::Patch => Version {
                patch: self.patch + 1,
                ..self
            },
            Bump::Minor => Version {
                minor: self.minor + 1,
                patch: 0,
                ..self
            },
        }
    }
}

/// Select the next tag from the set of existing tags (canonical or not —
/// non-canonical tags are ignored) and the requested bump kind.
pub fn next_version<'a>(existing_tags: impl IntoIterator<Item = &'a str>, bump: Bump) -> String {
    let max = existing_tags
        .into_iter()
        .filter_map(Version::parse)
        .max();

    match max {
        None => "v0.1.0".to_string(),
        Some(v) => v.bump(bump).to_tag(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_canonical_tags_are_ignored() {
        assert_eq!(Version::parse("0.1.0"), None);
        assert_eq!(Version::parse("v1.2"), None);
        assert_eq!(Version::parse("v1.2.3-rc1"), None);
    }

    #[test]
    fn no_tags_yields_v0_1_0() {
        assert_eq!(next_version(std::iter::empty(), Bump::Patch), "v0.1.0");
    }

    #[test]
    fn lattice_order_beats_lexicographic_order() {
        let tags = vec!["v0.1.9", "v0.2.25"];
        assert_eq!(next_version(tags, Bump::Patch), "v0.2.26");
    }

    #[test]
    fn minor_bump_resets_patch() {
        let tags = vec!["v1.4.7"];
        assert_eq!(next_version(tags, Bump::Minor), "v1.5.0");
    }

    #[test]
    fn non_canonical_tags_mixed_in_are_skipped() {
        let tags = vec!["latest", "v1.0.0", "nightly-build"];
        assert_eq!(next_version(tags, Bump::Patch), "v1.0.1");
    }
}
