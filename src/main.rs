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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use dark_factory::cli::{Cli, Commands};
use dark_factory::config::{parse_workflow, Config, ResolvedConfig};
use dark_factory::executor::ProcessExecutor;
use dark_factory::runner::{self, RunnerConfig, ShutdownHandle};
use dark_factory::vcs::GitVcs;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("dark-factory.toml"));
    let config = Config::load(&config_path)?;

    match cli.command.unwrap_or(Commands::Run {
        workflow: "direct".to_string(),
        inbox_dir: PathBuf::from("inbox"),
        queue_dir: PathBuf::from("queue"),
        completed_dir: PathBuf::from("completed"),
        log_dir: PathBuf::from("logs"),
        container_image: None,
        debounce_ms: 500,
        server_port: 8080,
    }) {
        Commands::Run {
            workflow,
            inbox_dir,
            queue_dir,
            completed_dir,
            log_dir,
            container_image,
            debounce_ms,
            server_port,
        } => run_daemon(
            config,
            workflow,
            inbox_dir,
            queue_dir,
            completed_dir,
            log_dir,
            container_image,
            debounce_ms,
            server_port,
        ),
        Commands::Status { server_port } => status(server_port),
        Commands::Promote {
            file,
            all,
            server_port,
        } => promote(file, all, server_port),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_daemon(
    config: Config,
    workflow: String,
    inbox_dir: PathBuf,
    queue_dir: PathBuf,
    completed_dir: PathBuf,
    log_dir: PathBuf,
    container_image: Option<String>,
    debounce_ms: u64,
    server_port: u16,
) -> Result<()> {
    let merged_workflow =
        config.merge_with_cli(workflow, config.workflow.clone(), "direct".to_string());
    let merged_inbox = config.merge_with_cli(
        inbox_dir.to_string_lossy().to_string(),
        config.inbox_dir.clone(),
        "inbox".to_string(),
    );
    let merged_queue = config.merge_with_cli(
        queue_dir.to_string_lossy().to_string(),
        config.queue_dir.clone(),
        "queue".to_string(),
    );
    let merged_completed = config.merge_with_cli(
        completed_dir.to_string_lossy().to_string(),
        config.completed_dir.clone(),
        "completed".to_string(),
    );
    let merged_log_dir = config.merge_with_cli(
        log_dir.to_string_lossy().to_string(),
        config.log_dir.clone(),
        "logs".to_string(),
    );
    let merged_container_image = container_image
        .or_else(|| config.container_image.clone())
        .unwrap_or_default();
    let merged_debounce_ms = config.merge_with_cli(debounce_ms, config.debounce_ms, 500);
    let merged_server_port = config.merge_with_cli(server_port, config.server_port, 8080);

    let resolved = ResolvedConfig {
        workflow: parse_workflow(&merged_workflow)?,
        inbox_dir: PathBuf::from(merged_inbox),
        queue_dir: PathBuf::from(merged_queue),
        completed_dir: PathBuf::from(merged_completed),
        log_dir: PathBuf::from(merged_log_dir),
        container_image: merged_container_image,
        debounce_ms: merged_debounce_ms,
        server_port: merged_server_port,
    }
    .validate()?;

    for dir in [
        &resolved.inbox_dir,
        &resolved.queue_dir,
        &resolved.completed_dir,
        &resolved.log_dir,
    ] {
        std::fs::create_dir_all(dir)?;
    }

    let vcs = Arc::new(GitVcs::new(std::env::current_dir()?));
    let executor = Arc::new(ProcessExecutor::new(resolved.container_image.clone()));

    let runner_config = RunnerConfig {
        lock_path: std::env::current_dir()?.join(".dark-factory.lock"),
        inbox_dir: resolved.inbox_dir,
        queue_dir: resolved.queue_dir,
        completed_dir: resolved.completed_dir,
        log_dir: resolved.log_dir,
        container_prefix: "dark-factory".to_string(),
        branch_prefix: "dark-factory".to_string(),
        engine_version: env!("CARGO_PKG_VERSION").to_string(),
        workflow: resolved.workflow,
        debounce: Duration::from_millis(resolved.debounce_ms),
        processor_tick: Duration::from_secs(5),
        server_port: resolved.server_port,
        executor,
        releaser: vcs.clone(),
        brancher: vcs.clone(),
        pr_creator: vcs.clone(),
        mover: vcs,
    };

    let (shutdown, cancel) = ShutdownHandle::new();
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("shutdown requested");
        handler_shutdown.request();
    })?;

    runner::run(runner_config, cancel, shutdown)
}

fn status(server_port: u16) -> Result<()> {
    let url = format!("http://127.0.0.1:{server_port}/api/v1/status");
    let body = http_get(&url)?;
    println!("{body}");
    Ok(())
}

fn promote(file: Option<String>, all: bool, server_port: u16) -> Result<()> {
    match (file, all) {
        (Some(_), true) => anyhow::bail!("pass either a file name or --all, not both"),
        (None, false) => anyhow::bail!("pass a file name or --all"),
        (Some(name), false) => {
            let url = format!("http://127.0.0.1:{server_port}/api/v1/queue/action");
            let body = http_post(&url, &format!(r#"{{"file":"{name}"}}"#))?;
            println!("{body}");
        }
        (None, true) => {
            let url = format!("http://127.0.0.1:{server_port}/api/v1/queue/action/all");
            let body = http_post(&url, "{}")?;
            println!("{body}");
        }
    }
    Ok(())
}

/// Minimal blocking HTTP client for the CLI's own commands. No async runtime
/// runs anywhere else in the binary, so pulling one in just for these two
/// calls would be the odd one out; a handful of lines of raw TCP is cheaper.
fn http_get(url: &str) -> Result<String> {
    http_request(url, "GET", None)
}

fn http_post(url: &str, body: &str) -> Result<String> {
    http_request(url, "POST", Some(body))
}

fn http_request(url: &str, method: &str, body: Option<&str>) -> Result<String> {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    let stripped = url
        .strip_prefix("http://")
        .ok_or_else(|| anyhow::anyhow!("only http:// URLs are supported"))?;
    let (authority, path) = stripped.split_once('/').unwrap_or((stripped, ""));
    let path = format!("/{path}");

    let mut stream = TcpStream::connect(authority)
        .map_err(|err| anyhow::anyhow!("failed to connect to {authority}: {err}"))?;

    let payload = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{payload}",
        payload.len()
    );
    stream.write_all(request.as_bytes())?;

    let mut raw = String::new();
    stream.read_to_string(&mut raw)?;
    let body = raw.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or(&raw);
    Ok(body.to_string())
}
