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

//! Watches the queue directory (non-recursive) for `.md` create/write/chmod
//! events, debounces per path, and on firing re-normalizes the queue and
//! nudges the Processor over a bounded, soft-drop notification channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcherTrait};
use tracing::{error, warn};

use crate::cancellation::CancellationToken;
use crate::store;
use crate::vcs::Mover;

pub struct Watcher {
    queue_dir: PathBuf,
    completed_dir: PathBuf,
    mover: Arc<dyn Mover>,
    debounce: Duration,
    notify_tx: SyncSender<()>,
    cancel: CancellationToken,
    generations: Arc<Mutex<HashMap<PathBuf, u64>>>,
}

impl Watcher {
    pub fn new(
        queue_dir: impl Into<PathBuf>,
        completed_dir: impl Into<PathBuf>,
        mover: Arc<dyn Mover>,
        debounce: Duration,
        notify_tx: SyncSender<()>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue_dir: queue_dir.into(),
            completed_dir: completed_dir.into(),
            mover,
            debounce,
            notify_tx,
            cancel,
            generations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs until cancellation, or returns an error if the underlying event
    /// source fails (fatal, per the activity contract).
    pub fn run(&self) -> Result<()> {
        let (raw_tx, raw_rx) = mpsc::channel::<notify::Result<Event>>();

        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            // The receiving end may already be gone if we've returned; a
            // send error here is not actionable.
            let _ = raw_tx.send(res);
        })
        .context("failed to initialize filesystem watcher")?;

        watcher
            .watch(&self.queue_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", self.queue_dir.display()))?;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match raw_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(Ok(event)) => self.handle_event(event),
                Ok(Err(err)) => {
                    error!(error = %err, "filesystem watcher event source failed");
                    bail!("filesystem watcher event source failed: {err}");
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    bail!("filesystem watcher event source disconnected");
                }
            }
        }
    }

    fn handle_event(&self, event: Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Other
        ) {
            return;
        }

        for path in event.paths {
            if path.extension().map(|e| e != "md").unwrap_or(true) {
                continue;
            }
            self.debounce_path(path);
        }
    }

    fn debounce_path(&self, path: PathBuf) {
        let generation = {
            let mut generations = self.generations.lock().unwrap();
            let entry = generations.entry(path.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let generations = Arc::clone(&self.generations);
        let queue_dir = self.queue_dir.clone();
        let completed_dir = self.completed_dir.clone();
        let mover = Arc::clone(&self.mover);
        let notify_tx = self.notify_tx.clone();
        let debounce = self.debounce;

        thread::spawn(move || {
            thread::sleep(debounce);
            let still_current = {
                let generations = generations.lock().unwrap();
                generations.get(&path).copied() == Some(generation)
            };
            if !still_current {
                return;
            }
            fire(&queue_dir, &completed_dir, mover.as_ref(), &notify_tx);
        });
    }
}

fn fire(queue_dir: &Path, completed_dir: &Path, mover: &dyn Mover, notify_tx: &SyncSender<()>) {
    if let Err(err) = store::normalize(queue_dir, completed_dir, mover) {
        warn!(error = %err, "normalize pass failed after debounce fire");
    }
    // A full channel is a soft drop: the processor's periodic tick covers it.
    let _ = notify_tx.try_send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::NullVcs;
    use std::sync::mpsc::sync_channel;
    use tempfile::TempDir;

    #[test]
    fn fire_normalizes_and_signals() {
        let queue = TempDir::new().unwrap();
        let completed = TempDir::new().unwrap();
        std::fs::write(queue.path().join("unprefixed.md"), "x").unwrap();

        let (tx, rx) = sync_channel::<()>(10);
        let mover = NullVcs::new(false);
        fire(queue.path(), completed.path(), &mover, &tx);

        assert!(rx.try_recv().is_ok());
        let renamed = std::fs::read_dir(queue.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy() == "001-unprefixed.md");
        assert!(renamed);
    }

    #[test]
    fn debounce_only_fires_once_for_rapid_events() {
        let queue = TempDir::new().unwrap();
        let completed = TempDir::new().unwrap();
        let (tx, rx) = sync_channel::<()>(10);
        let mover: Arc<dyn Mover> = Arc::new(NullVcs::new(false));

        let watcher = Watcher::new(
            queue.path(),
            completed.path(),
            mover,
            Duration::from_millis(30),
            tx,
            CancellationToken::new(),
        );

        let path = queue.path().join("a.md");
        watcher.debounce_path(path.clone());
        watcher.debounce_path(path.clone());
        watcher.debounce_path(path);

        thread::sleep(Duration::from_millis(100));
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 1);
    }
}
