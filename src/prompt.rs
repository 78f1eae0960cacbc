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

//! The prompt value type: number/slug decoded from a filename, status, and
//! optional metadata read out of a front-matter mapping.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

/// Mandatory three-digit zero-padded prefix followed by a slug: `NNN-slug.md`.
pub static CANONICAL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{3})-([^/]+)\.md$").unwrap());

/// Loose match used by normalization to recognize "has some numeric prefix,
/// but not necessarily three digits".
pub static LOOSE_NUMBERED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)-(.+)\.md$").unwrap());

static SANITIZE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Queued,
    Executing,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Executing => "executing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    /// Empty or absent status is treated as `queued`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("executing") => Status::Executing,
            Some("completed") => Status::Completed,
            Some("failed") => Status::Failed,
            _ => Status::Queued,
        }
    }
}

/// A prompt identified by its basename, as decoded from a path on disk.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub path: PathBuf,
    /// `-1` sentinel if the filename carries no numeric prefix.
    pub number: i64,
    pub slug: String,
    pub status: Status,
}

impl Prompt {
    pub fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn is_canonical_name(&self) -> bool {
        CANONICAL_NAME.is_match(&self.basename())
    }

    /// Decode number/slug from a path's file name, without touching status.
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let (number, slug) = if let Some(caps) = CANONICAL_NAME.captures(&name) {
            let n: i64 = caps[1].parse().unwrap_or(-1);
            (n, caps[2].to_string())
        } else if let Some(caps) = LOOSE_NUMBERED_NAME.captures(&name) {
            let n: i64 = caps[1].parse().unwrap_or(-1);
            (n, caps[2].to_string())
        } else {
            let slug = name.strip_suffix(".md").unwrap_or(&name).to_string();
            (-1, slug)
        };

        Prompt {
            path: path.to_path_buf(),
            number,
            slug,
            status: Status::Queued,
        }
    }
}

/// Replace any character outside `[A-Za-z0-9_-]` with `-`.
pub fn sanitize(input: &str) -> String {
    SANITIZE_CHARS.replace_all(input, "-").to_string()
}

/// Case-insensitive substring test against the bump-trigger word set.
/// Any hit selects a minor bump; otherwise a patch bump.
pub fn selects_minor_bump(title: &str) -> bool {
    const TRIGGERS: [&str; 5] = ["add", "implement", "new", "support", "feature"];
    let lower = title.to_lowercase();
    TRIGGERS.iter().any(|t| lower.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_canonical_name() {
        let p = Prompt::from_path(Path::new("/q/001-hello.md"));
        assert_eq!(p.number, 1);
        assert_eq!(p.slug, "hello");
        assert!(p.is_canonical_name());
    }

    #[test]
    fn unprefixed_name_gets_sentinel_number() {
        let p = Prompt::from_path(Path::new("/q/hello.md"));
        assert_eq!(p.number, -1);
        assert_eq!(p.slug, "hello");
        assert!(!p.is_canonical_name());
    }

    #[test]
    fn wrong_width_name_decodes_number_but_is_not_canonical() {
        let p = Prompt::from_path(Path::new("/q/12-hello.md"));
        assert_eq!(p.number, 12);
        assert!(!p.is_canonical_name());
    }

    #[test]
    fn status_parse_defaults_to_queued() {
        assert_eq!(Status::parse(None), Status::Queued);
        assert_eq!(Status::parse(Some("")), Status::Queued);
        assert_eq!(Status::parse(Some("bogus")), Status::Queued);
        assert_eq!(Status::parse(Some("executing")), Status::Executing);
        assert_eq!(Status::parse(Some("failed")), Status::Failed);
    }

    #[test]
    fn sanitize_replaces_disallowed_characters() {
        assert_eq!(sanitize("hello world!.md"), "hello-world--md");
        assert_eq!(sanitize("already-ok_123"), "already-ok_123");
    }

    #[test]
    fn bump_selection_is_case_insensitive_substring() {
        assert!(selects_minor_bump("Add new widget"));
        assert!(selects_minor_bump("IMPLEMENT caching"));
        assert!(selects_minor_bump("address the bug"));
        assert!(!selects_minor_bump("Fix the crash"));
    }
}
