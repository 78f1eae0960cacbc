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

//! Single-threaded sequential driver: the only mutator of prompt status
//! during normal operation. Drains the queue in strict numeric order,
//! driving each prompt through content fetch, metadata imprint, executor
//! invocation, archival, and VCS release.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cancellation::CancellationToken;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::prompt::{sanitize, selects_minor_bump, Prompt, Status};
use crate::store::{self, KEY_CONTAINER, KEY_VERSION};
use crate::vcs::{Brancher, Bump, Mover, PRCreator, Releaser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    Direct,
    Pr,
}

pub struct Processor {
    pub queue_dir: PathBuf,
    pub completed_dir: PathBuf,
    pub log_dir: PathBuf,
    pub container_prefix: String,
    pub branch_prefix: String,
    pub engine_version: String,
    pub workflow: Workflow,
    pub executor: Arc<dyn Executor>,
    pub releaser: Arc<dyn Releaser>,
    pub brancher: Arc<dyn Brancher>,
    pub pr_creator: Arc<dyn PRCreator>,
    pub mover: Arc<dyn Mover>,
    pub notify_rx: Receiver<()>,
    pub tick: Duration,
    pub cancel: CancellationToken,
}

impl Processor {
    /// Startup plus the blocking top-level loop. Returns `Ok(())` only on
    /// clean cancellation; any per-prompt failure propagates as an error
    /// that tears down the other activities.
    pub fn run(&self) -> Result<()> {
        store::reset_failed(&self.queue_dir).context("startup retry reset failed")?;
        self.drain()?;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match self.notify_rx.recv_timeout(self.tick) {
                Ok(()) => self.drain()?,
                Err(RecvTimeoutError::Timeout) => self.drain()?,
                Err(RecvTimeoutError::Disconnected) => {
                    anyhow::bail!("watcher notification channel disconnected");
                }
            }
        }
    }

    /// Process queued prompts in ascending numeric order until none remain
    /// processable in this snapshot. A prompt skipped for an invalid name,
    /// wrong status, or an unmet ordering gap is left untouched; a later
    /// drain (triggered by the watcher or the periodic tick) re-evaluates
    /// it once the blocking condition changes.
    fn drain(&self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let queued = store::list_queued(&self.queue_dir)?;
            if queued.is_empty() {
                return Ok(());
            }

            let mut advanced = false;
            for p in &queued {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }

                if !p.is_canonical_name() || p.status != Status::Queued {
                    warn!(prompt = %p.basename(), "skipping prompt with invalid name or status");
                    continue;
                }
                if !store::all_previous_completed(&self.completed_dir, p.number) {
                    continue;
                }

                match self.process_prompt(p) {
                    Ok(()) => {
                        advanced = true;
                        break;
                    }
                    Err(err) => {
                        self.mark_failed_best_effort(p);
                        return Err(err);
                    }
                }
            }

            if !advanced {
                return Ok(());
            }
        }
    }

    fn mark_failed_best_effort(&self, p: &Prompt) {
        let basename = p.basename();
        let completed_path = self.completed_dir.join(&basename);
        let target = if completed_path.exists() {
            completed_path
        } else {
            p.path.clone()
        };
        if target.exists() {
            if let Err(err) = store::set_status(&target, Status::Failed) {
                warn!(prompt = %basename, error = %err, "failed to mark prompt as failed");
            }
        } else {
            warn!(prompt = %basename, "prompt missing from both queue and completed during failure handling");
        }
    }

    /// Steps 1-8 of the per-prompt state machine.
    fn process_prompt(&self, p: &Prompt) -> Result<()> {
        let body = match store::content(&p.path) {
            Ok(body) => body,
            Err(err) => {
                if matches!(err.downcast_ref::<EngineError>(), Some(EngineError::EmptyPrompt)) {
                    store::move_to_completed(&p.path, &self.completed_dir, self.mover.as_ref())
                        .context("failed to archive empty prompt")?;
                    info!(prompt = %p.basename(), "archived empty prompt without invocation");
                    return Ok(());
                }
                return Err(err);
            }
        };

        let base_name = sanitize(
            p.path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default(),
        );
        let container_name = format!("{}-{}", self.container_prefix, base_name);

        self.imprint_metadata(&p.path, &container_name)?;

        let branch_state = if self.workflow == Workflow::Pr {
            let original_branch = self.brancher.current_branch().context("current-branch failed")?;
            let feature_branch = format!("{}/{}", self.branch_prefix, base_name);
            self.brancher
                .create_and_switch(&feature_branch)
                .context("create-and-switch failed")?;
            Some((original_branch, feature_branch))
        } else {
            None
        };

        let log_path = self.log_dir.join(format!("{base_name}.log"));
        self.executor
            .execute(&body, &log_path, &container_name, &self.cancel)
            .with_context(|| format!("executor failed for {container_name}"))?;

        // Archival and everything after it runs in a VCS "commit point":
        // from here, the engine no longer consults `self.cancel`, so a
        // shutdown request cannot tear apart a multi-step release.
        let dest = store::move_to_completed(&p.path, &self.completed_dir, self.mover.as_ref())
            .context("failed to archive completed prompt")?;

        self.releaser
            .commit_completed_file(&dest)
            .context("commit-completed-file failed")?;

        self.release(&dest, &body, branch_state)
    }

    fn imprint_metadata(&self, path: &Path, container_name: &str) -> Result<()> {
        let engine_version = self.engine_version.clone();
        store::set_field(path, |fields| {
            crate::frontmatter::set_str(fields, KEY_CONTAINER, container_name);
            crate::frontmatter::set_str(fields, KEY_VERSION, &engine_version);
        })
        .context("failed to write container/version metadata")?;
        store::set_status(path, Status::Executing).context("failed to set status to executing")
    }

    fn release(
        &self,
        dest: &Path,
        body: &str,
        branch_state: Option<(String, String)>,
    ) -> Result<()> {
        let title = store::title(dest)?;

        match (self.workflow, branch_state) {
            (Workflow::Direct, _) => {
                if self.releaser.has_changelog().context("has-changelog failed")? {
                    let bump = if selects_minor_bump(&title) {
                        Bump::Minor
                    } else {
                        Bump::Patch
                    };
                    self.releaser
                        .commit_and_release(&title, bump)
                        .context("commit-and-release failed")?;
                } else {
                    self.releaser.commit_only(&title).context("commit-only failed")?;
                }
                Ok(())
            }
            (Workflow::Pr, Some((original_branch, feature_branch))) => {
                self.releaser.commit_only(&title).context("commit-only failed")?;
                self.brancher.push(&feature_branch).context("push failed")?;
                let pr_url = self
                    .pr_creator
                    .create_pr(&title, body)
                    .context("create-PR failed")?;
                info!(pr_url, prompt = %title, "created pull request");
                self.brancher
                    .switch(&original_branch)
                    .context("failed to switch back to original branch")?;
                Ok(())
            }
            (Workflow::Pr, None) => {
                unreachable!("PR workflow always establishes a feature branch in process_prompt")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ScriptedExecutor;
    use crate::vcs::NullVcs;
    use std::sync::mpsc::sync_channel;
    use tempfile::TempDir;

    fn setup(queue: &Path, name: &str, body: &str) {
        std::fs::write(queue.join(name), body).unwrap();
    }

    fn processor(
        queue: &Path,
        completed: &Path,
        logs: &Path,
        succeed: bool,
        changelog: bool,
    ) -> (Processor, Arc<NullVcs>, std::sync::mpsc::SyncSender<()>) {
        let (tx, rx) = sync_channel(10);
        let vcs = Arc::new(NullVcs::new(changelog));
        let p = Processor {
            queue_dir: queue.to_path_buf(),
            completed_dir: completed.to_path_buf(),
            log_dir: logs.to_path_buf(),
            container_prefix: "df".to_string(),
            branch_prefix: "dark-factory".to_string(),
            engine_version: "v0.1.0".to_string(),
            workflow: Workflow::Direct,
            executor: Arc::new(ScriptedExecutor { succeed }),
            releaser: vcs.clone(),
            brancher: vcs.clone(),
            pr_creator: vcs.clone(),
            mover: vcs.clone(),
            notify_rx: rx,
            tick: Duration::from_millis(20),
            cancel: CancellationToken::new(),
        };
        (p, vcs, tx)
    }

    #[test]
    fn happy_path_direct_workflow_no_changelog() {
        let queue = TempDir::new().unwrap();
        let completed = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        setup(queue.path(), "001-hello.md", "# Greet\n\nhi");

        let (processor, _vcs, _tx) = processor(queue.path(), completed.path(), logs.path(), true, false);
        processor.drain().unwrap();

        let dest = completed.path().join("001-hello.md");
        assert!(dest.exists());
        let doc = store::read_frontmatter(&dest).unwrap();
        assert_eq!(
            crate::frontmatter::get_str(&doc.fields, "status").as_deref(),
            Some("completed")
        );
        assert_eq!(
            crate::frontmatter::get_str(&doc.fields, "container").as_deref(),
            Some("df-001-hello")
        );
    }

    #[test]
    fn gap_enforcement_blocks_execution() {
        let queue = TempDir::new().unwrap();
        let completed = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        setup(queue.path(), "003-c.md", "body");

        let (processor, _vcs, _tx) = processor(queue.path(), completed.path(), logs.path(), true, false);
        processor.drain().unwrap();

        assert!(queue.path().join("003-c.md").exists());
        assert!(!completed.path().join("003-c.md").exists());
    }

    #[test]
    fn empty_body_archives_without_invocation_or_commit() {
        let queue = TempDir::new().unwrap();
        let completed = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        setup(queue.path(), "005-empty.md", "   \n\t\n");

        let (processor, vcs, _tx) = processor(queue.path(), completed.path(), logs.path(), true, false);
        processor.drain().unwrap();

        assert!(completed.path().join("005-empty.md").exists());
        assert!(
            vcs.calls.lock().unwrap().is_empty(),
            "no VCS release calls expected for empty prompt"
        );
    }

    #[test]
    fn ordering_processes_strictly_ascending() {
        let queue = TempDir::new().unwrap();
        let completed = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        setup(queue.path(), "001-a.md", "# A\n\nbody");
        setup(queue.path(), "002-b.md", "# B\n\nbody");
        setup(queue.path(), "003-c.md", "# C\n\nbody");

        let (processor, _vcs, _tx) = processor(queue.path(), completed.path(), logs.path(), true, false);
        processor.drain().unwrap();

        for name in ["001-a.md", "002-b.md", "003-c.md"] {
            assert!(completed.path().join(name).exists());
        }
    }

    #[test]
    fn failure_marks_prompt_failed() {
        let queue = TempDir::new().unwrap();
        let completed = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        setup(queue.path(), "007-fail.md", "# Fail\n\nbody");

        let (processor, _vcs, _tx) = processor(queue.path(), completed.path(), logs.path(), false, false);
        let err = processor.drain();
        assert!(err.is_err());

        let doc = store::read_frontmatter(&queue.path().join("007-fail.md")).unwrap();
        assert_eq!(
            crate::frontmatter::get_str(&doc.fields, "status").as_deref(),
            Some("failed")
        );
    }
}
