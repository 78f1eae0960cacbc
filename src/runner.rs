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

//! Top-level supervisor: acquire the single-instance lock, run one-shot
//! startup recovery, then fan out the Watcher, Processor, and (optionally)
//! ControlServer as peer activities sharing a cancellation context. The
//! first activity to return an error cancels the rest; a clean external
//! shutdown is not an error. Modeled on the cancel-on-first-error fan-out
//! used to supervise homogeneous worker threads, generalized here to three
//! heterogeneous activities.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use crate::cancellation::CancellationToken;
use crate::control_server::ControlServer;
use crate::executor::Executor;
use crate::lock::Lock;
use crate::processor::{Processor, Workflow};
use crate::store;
use crate::vcs::{Brancher, Mover, PRCreator, Releaser};
use crate::watcher::Watcher;

pub struct RunnerConfig {
    pub lock_path: PathBuf,
    pub inbox_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub completed_dir: PathBuf,
    pub log_dir: PathBuf,
    pub container_prefix: String,
    pub branch_prefix: String,
    pub engine_version: String,
    pub workflow: Workflow,
    pub debounce: Duration,
    pub processor_tick: Duration,
    /// `0` disables the control server.
    pub server_port: u16,
    pub executor: Arc<dyn Executor>,
    pub releaser: Arc<dyn Releaser>,
    pub brancher: Arc<dyn Brancher>,
    pub pr_creator: Arc<dyn PRCreator>,
    pub mover: Arc<dyn Mover>,
}

/// A shutdown request distinguishable from an activity's own failure:
/// setting it marks subsequent cancellation as "clean" so the supervisor
/// does not report it as an error even if an in-flight activity surfaces
/// one as a side effect of being aborted.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ShutdownHandle {
    pub fn new() -> (Self, CancellationToken) {
        let cancel = CancellationToken::new();
        (
            Self {
                requested: Arc::new(AtomicBool::new(false)),
                cancel: cancel.clone(),
            },
            cancel,
        )
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn was_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

pub fn run(config: RunnerConfig, cancel: CancellationToken, shutdown: ShutdownHandle) -> Result<()> {
    let lock = Lock::acquire(&config.lock_path)?;
    info!(path = %config.lock_path.display(), "acquired single-instance lock");

    store::reset_executing(&config.queue_dir)?;
    store::normalize(&config.queue_dir, &config.completed_dir, config.mover.as_ref())?;
    info!("startup recovery complete");

    let (notify_tx, notify_rx) = mpsc::sync_channel::<()>(10);
    let first_error: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));

    let mut handles = Vec::new();

    {
        let watcher = Watcher::new(
            config.queue_dir.clone(),
            config.completed_dir.clone(),
            config.mover.clone(),
            config.debounce,
            notify_tx,
            cancel.clone(),
        );
        let cancel = cancel.clone();
        let first_error = Arc::clone(&first_error);
        handles.push(thread::spawn(move || {
            if let Err(err) = watcher.run() {
                record_and_cancel(&first_error, &cancel, err, "watcher");
            }
        }));
    }

    {
        let processor = Processor {
            queue_dir: config.queue_dir.clone(),
            completed_dir: config.completed_dir.clone(),
            log_dir: config.log_dir.clone(),
            container_prefix: config.container_prefix.clone(),
            branch_prefix: config.branch_prefix.clone(),
            engine_version: config.engine_version.clone(),
            workflow: config.workflow,
            executor: config.executor.clone(),
            releaser: config.releaser.clone(),
            brancher: config.brancher.clone(),
            pr_creator: config.pr_creator.clone(),
            mover: config.mover.clone(),
            notify_rx,
            tick: config.processor_tick,
            cancel: cancel.clone(),
        };
        let cancel = cancel.clone();
        let first_error = Arc::clone(&first_error);
        handles.push(thread::spawn(move || {
            if let Err(err) = processor.run() {
                record_and_cancel(&first_error, &cancel, err, "processor");
            }
        }));
    }

    if config.server_port != 0 {
        let server = ControlServer {
            inbox_dir: config.inbox_dir.clone(),
            queue_dir: config.queue_dir.clone(),
            completed_dir: config.completed_dir.clone(),
            log_dir: config.log_dir.clone(),
            mover: config.mover.clone(),
            cancel: cancel.clone(),
        };
        let port = config.server_port;
        let cancel = cancel.clone();
        let first_error = Arc::clone(&first_error);
        handles.push(thread::spawn(move || {
            if let Err(err) = server.run(port) {
                record_and_cancel(&first_error, &cancel, err, "control server");
            }
        }));
    }

    for handle in handles {
        let _ = handle.join();
    }

    lock.release()?;

    let outcome = first_error.lock().unwrap().take();
    match outcome {
        Some(err) if !shutdown.was_requested() => Err(err),
        _ => Ok(()),
    }
}

fn record_and_cancel(
    first_error: &Mutex<Option<anyhow::Error>>,
    cancel: &CancellationToken,
    err: anyhow::Error,
    activity: &str,
) {
    error!(activity, error = %err, "activity failed, cancelling peers");
    let mut slot = first_error.lock().unwrap();
    if slot.is_none() {
        *slot = Some(err);
    }
    drop(slot);
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ScriptedExecutor;
    use crate::vcs::NullVcs;
    use tempfile::TempDir;

    #[test]
    fn run_processes_queue_and_shuts_down_cleanly() {
        let root = TempDir::new().unwrap();
        let inbox = root.path().join("inbox");
        let queue = root.path().join("queue");
        let completed = root.path().join("completed");
        let logs = root.path().join("logs");
        std::fs::create_dir_all(&inbox).unwrap();
        std::fs::create_dir_all(&queue).unwrap();
        std::fs::create_dir_all(&completed).unwrap();
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(queue.join("001-hello.md"), "# Greet\n\nhi").unwrap();

        let vcs = Arc::new(NullVcs::new(false));
        let config = RunnerConfig {
            lock_path: root.path().join(".dark-factory.lock"),
            inbox_dir: inbox,
            queue_dir: queue.clone(),
            completed_dir: completed.clone(),
            log_dir: logs,
            container_prefix: "df".to_string(),
            branch_prefix: "dark-factory".to_string(),
            engine_version: "v0.1.0".to_string(),
            workflow: Workflow::Direct,
            debounce: Duration::from_millis(20),
            processor_tick: Duration::from_millis(20),
            server_port: 0,
            executor: Arc::new(ScriptedExecutor { succeed: true }),
            releaser: vcs.clone(),
            brancher: vcs.clone(),
            pr_creator: vcs.clone(),
            mover: vcs,
        };

        let (shutdown, cancel) = ShutdownHandle::new();
        let shutdown_for_thread = shutdown.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            shutdown_for_thread.request();
        });

        let result = run(config, cancel, shutdown);
        assert!(result.is_ok());
        assert!(completed.join("001-hello.md").exists());
    }
}
