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

//! The black-box invoker: hands prompt text to an external sandboxed
//! worker over stdin, streams its combined output to a per-execution log
//! file, and reports success iff the worker exits zero. The engine never
//! interprets exit codes beyond that boolean.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::cancellation::CancellationToken;

pub trait Executor: Send + Sync {
    fn execute(
        &self,
        prompt_text: &str,
        log_path: &Path,
        container_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Spawns `container_image` as a subprocess, passing `container_name` both
/// as the trailing argument and as the `DARK_FACTORY_CONTAINER` environment
/// variable so the worker can self-identify either way.
pub struct ProcessExecutor {
    container_image: String,
}

impl ProcessExecutor {
    pub fn new(container_image: impl Into<String>) -> Self {
        Self {
            container_image: container_image.into(),
        }
    }
}

impl Executor for ProcessExecutor {
    fn execute(
        &self,
        prompt_text: &str,
        log_path: &Path,
        container_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }

        let mut child = Command::new(&self.container_image)
            .arg(container_name)
            .env("DARK_FACTORY_CONTAINER", container_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn executor `{}`", self.container_image))?;

        {
            let mut stdin = child.stdin.take().context("executor stdin not piped")?;
            stdin
                .write_all(prompt_text.as_bytes())
                .context("failed to write prompt text to executor stdin")?;
        }

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("failed to open log file {}", log_path.display()))?;

        let stdout = child.stdout.take().context("executor stdout not piped")?;
        let stderr = child.stderr.take().context("executor stderr not piped")?;
        let stdout_handle = spawn_log_pump(stdout, log_file.try_clone()?);
        let stderr_handle = spawn_log_pump(stderr, log_file);

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                bail!("executor for {container_name} aborted by cancellation");
            }
            thread::sleep(Duration::from_millis(50));
        };

        let _ = stdout_handle.join();
        let _ = stderr_handle.join();

        if !status.success() {
            bail!(
                "executor for {container_name} exited with {}",
                status
            );
        }

        info!(container = container_name, "executor completed successfully");
        Ok(())
    }
}

fn spawn_log_pump<R: std::io::Read + Send + 'static>(
    reader: R,
    mut sink: File,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut lines = BufReader::new(reader).lines();
        while let Some(Ok(line)) = lines.next() {
            let _ = writeln!(sink, "{line}");
        }
    })
}

/// A test double that never spawns a process: it records the prompt text
/// it was given and returns a caller-specified outcome.
pub struct ScriptedExecutor {
    pub succeed: bool,
}

impl Executor for ScriptedExecutor {
    fn execute(
        &self,
        _prompt_text: &str,
        log_path: &Path,
        container_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).ok();
        }
        fs::write(log_path, format!("executed {container_name}\n")).ok();
        if self.succeed {
            Ok(())
        } else {
            bail!("scripted executor failure for {container_name}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn scripted_executor_writes_log_and_reports_outcome() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("logs").join("x.log");
        let cancel = CancellationToken::new();

        let ok = ScriptedExecutor { succeed: true };
        ok.execute("body", &log, "df-001-x", &cancel).unwrap();
        assert!(log.exists());

        let fail = ScriptedExecutor { succeed: false };
        assert!(fail.execute("body", &log, "df-001-x", &cancel).is_err());
    }
}
