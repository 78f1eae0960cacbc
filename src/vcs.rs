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

//! The VCS capability surface the Processor consumes, split into the three
//! narrow traits the specification names separately: `Releaser` (commit/tag/
//! push/changelog), `Brancher` (branch plumbing), and `PRCreator` (pull
//! request creation) — plus the file `Mover` used by
//! `PromptStore::move_to_completed` so renames are recognized as renames by
//! the surrounding git history. Four traits here, five counting `Executor`,
//! matching the "five narrow capability surfaces" design note.
//!
//! `GitVcs` is the one production implementation of all three VCS traits,
//! shelling out to `git(1)`/`gh(1)` the same way the executor shells out to
//! an external worker: spawn, capture stdout/stderr, judge success by exit
//! status alone. `NullVcs` is a test double implementing all three that
//! records calls instead of touching a working tree.

use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};

use crate::version::{next_version as compute_next_version, Bump};

pub trait Mover: Send + Sync {
    fn move_file(&self, from: &Path, to: &Path) -> Result<()>;
}

/// Commit/tag/push/changelog capability: everything §4.3 groups under
/// "Releaser" plus the commit-only and commit-completed-file helpers the
/// Processor needs for non-release commits.
pub trait Releaser: Send + Sync {
    fn next_version(&self, bump: Bump) -> Result<String>;
    fn commit_and_release(&self, title: &str, bump: Bump) -> Result<()>;
    fn commit_completed_file(&self, path: &Path) -> Result<()>;
    fn commit_only(&self, message: &str) -> Result<()>;
    fn has_changelog(&self) -> Result<bool>;
}

/// Branch plumbing: current branch, create-and-switch, switch, push.
pub trait Brancher: Send + Sync {
    fn current_branch(&self) -> Result<String>;
    fn create_and_switch(&self, name: &str) -> Result<()>;
    fn switch(&self, name: &str) -> Result<()>;
    fn push(&self, name: &str) -> Result<()>;
}

/// Pull-request creation for the PR workflow.
pub trait PRCreator: Send + Sync {
    fn create_pr(&self, title: &str, body: &str) -> Result<String>;
}

/// Shells out to `git` and (for PR creation) `gh`, rooted at a working tree.
/// Implements all three VCS traits; the Processor is handed it three times
/// behind three different trait-object references via constructor injection.
pub struct GitVcs {
    root: std::path::PathBuf,
}

impl GitVcs {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.root);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn `{program} {}`", args.join(" ")))?;

        if !output.status.success() {
            bail!(
                "`{program} {}` exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn changelog_path(&self) -> std::path::PathBuf {
        self.root.join("CHANGELOG.md")
    }

    fn rewrite_changelog(&self, version: &str) -> Result<()> {
        let path = self.changelog_path();
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        let heading = format!("## {version}");

        let rewritten = if let Some(pos) = existing.find("## Unreleased") {
            let mut out = existing.clone();
            out.replace_range(pos..pos + "## Unreleased".len(), &heading);
            out
        } else if existing.is_empty() {
            format!("# Changelog\n\n{heading}\n")
        } else {
            format!("{heading}\n\n{existing}")
        };

        std::fs::write(&path, rewritten)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

impl Mover for GitVcs {
    fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        let from_rel = path_relative_to(&self.root, from);
        let to_rel = path_relative_to(&self.root, to);
        self.run("git", &["mv", "-f", &from_rel, &to_rel])?;
        Ok(())
    }
}

impl Releaser for GitVcs {
    fn next_version(&self, bump: Bump) -> Result<String> {
        let output = self.run("git", &["tag", "--list", "v*"])?;
        let tags: Vec<&str> = output.lines().collect();
        Ok(compute_next_version(tags, bump))
    }

    fn commit_and_release(&self, title: &str, bump: Bump) -> Result<()> {
        let version = self.next_version(bump)?;
        self.rewrite_changelog(&version)?;
        self.run("git", &["add", "-A"])?;
        self.run("git", &["commit", "-m", &format!("release {version}")])?;
        self.run("git", &["tag", &version])?;
        let branch = self.run("git", &["rev-parse", "--abbrev-ref", "HEAD"])?;
        self.run("git", &["push", "origin", &branch])?;
        self.run("git", &["push", "origin", &version])?;
        let _ = title;
        Ok(())
    }

    fn commit_completed_file(&self, path: &Path) -> Result<()> {
        let rel = path_relative_to(&self.root, path);
        self.run("git", &["add", "-A", "--", &rel])?;
        let status = self.run("git", &["status", "--porcelain", "--", &rel])?;
        if status.trim().is_empty() {
            return Ok(());
        }
        self.run("git", &["commit", "-m", "move prompt to completed"])?;
        Ok(())
    }

    fn commit_only(&self, message: &str) -> Result<()> {
        self.run("git", &["add", "-A"])?;
        let status = self.run("git", &["status", "--porcelain"])?;
        if status.trim().is_empty() {
            return Ok(());
        }
        self.run("git", &["commit", "-m", message])?;
        Ok(())
    }

    fn has_changelog(&self) -> Result<bool> {
        Ok(self.changelog_path().is_file())
    }
}

impl Brancher for GitVcs {
    fn current_branch(&self) -> Result<String> {
        self.run("git", &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    fn create_and_switch(&self, name: &str) -> Result<()> {
        self.run("git", &["checkout", "-b", name])?;
        Ok(())
    }

    fn switch(&self, name: &str) -> Result<()> {
        self.run("git", &["checkout", name])?;
        Ok(())
    }

    fn push(&self, name: &str) -> Result<()> {
        self.run("git", &["push", "-u", "origin", name])?;
        Ok(())
    }
}

impl PRCreator for GitVcs {
    fn create_pr(&self, title: &str, body: &str) -> Result<String> {
        self.run("gh", &["pr", "create", "--title", title, "--body", body])
    }
}

fn path_relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

/// Records every call instead of touching a working tree. Implements
/// `Mover`, `Releaser`, `Brancher`, and `PRCreator` so one instance can back
/// all four injection points in tests that exercise the Processor's
/// VCS-branching logic without a real git repository.
#[derive(Default)]
pub struct NullVcs {
    pub calls: Mutex<Vec<String>>,
    pub changelog_present: bool,
    pub tags: Mutex<Vec<String>>,
}

impl NullVcs {
    pub fn new(changelog_present: bool) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            changelog_present,
            tags: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl Mover for NullVcs {
    fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)
            .with_context(|| format!("rename {} -> {}", from.display(), to.display()))?;
        self.record(format!("move {} -> {}", from.display(), to.display()));
        Ok(())
    }
}

impl Releaser for NullVcs {
    fn next_version(&self, bump: Bump) -> Result<String> {
        let tags = self.tags.lock().unwrap();
        let refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        Ok(compute_next_version(refs, bump))
    }

    fn commit_and_release(&self, title: &str, bump: Bump) -> Result<()> {
        let version = self.next_version(bump)?;
        self.tags.lock().unwrap().push(version.clone());
        self.record(format!("commit-and-release {title} {version}"));
        Ok(())
    }

    fn commit_completed_file(&self, path: &Path) -> Result<()> {
        self.record(format!("commit-completed-file {}", path.display()));
        Ok(())
    }

    fn commit_only(&self, message: &str) -> Result<()> {
        self.record(format!("commit-only {message}"));
        Ok(())
    }

    fn has_changelog(&self) -> Result<bool> {
        Ok(self.changelog_present)
    }
}

impl Brancher for NullVcs {
    fn current_branch(&self) -> Result<String> {
        Ok("main".to_string())
    }

    fn create_and_switch(&self, name: &str) -> Result<()> {
        self.record(format!("create-and-switch {name}"));
        Ok(())
    }

    fn switch(&self, name: &str) -> Result<()> {
        self.record(format!("switch {name}"));
        Ok(())
    }

    fn push(&self, name: &str) -> Result<()> {
        self.record(format!("push {name}"));
        Ok(())
    }
}

impl PRCreator for NullVcs {
    fn create_pr(&self, title: &str, body: &str) -> Result<String> {
        self.record(format!("create-pr {title} {body}"));
        Ok("https://example.invalid/pr/1".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_vcs_moves_files_and_records_calls() {
        let dir = tempfile::TempDir::new().unwrap();
        let from = dir.path().join("a.md");
        let to = dir.path().join("b.md");
        std::fs::write(&from, "x").unwrap();

        let vcs = NullVcs::new(false);
        vcs.move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert!(to.exists());
        assert_eq!(vcs.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn null_vcs_next_version_uses_lattice_order() {
        let vcs = NullVcs::new(false);
        vcs.tags.lock().unwrap().push("v0.1.9".to_string());
        vcs.tags.lock().unwrap().push("v0.2.25".to_string());
        assert_eq!(vcs.next_version(Bump::Patch).unwrap(), "v0.2.26");
    }
}
