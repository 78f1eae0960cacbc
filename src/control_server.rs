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

//! Stateless HTTP surface for inspection and inbox->queue promotion. Backed
//! by read-only filesystem inspection plus the normalization/move
//! operations `PromptStore` already exposes. No async runtime: a single
//! accept loop on a background thread, same shape as the executor's
//! synchronous subprocess handling.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tiny_http::{Header, Method, Response, Server};
use tracing::{info, warn};

use crate::cancellation::CancellationToken;
use crate::store;
use crate::vcs::Mover;

const MAX_BODY_BYTES: u64 = 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_millis(200);

pub struct ControlServer {
    pub inbox_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub completed_dir: PathBuf,
    pub log_dir: PathBuf,
    pub mover: Arc<dyn Mover>,
    pub cancel: CancellationToken,
}

#[derive(Serialize)]
struct PromotedPair {
    old: String,
    new: String,
}

impl ControlServer {
    pub fn run(&self, port: u16) -> Result<()> {
        let server = Server::http(("0.0.0.0", port))
            .map_err(|err| anyhow::anyhow!("failed to bind control server on port {port}: {err}"))?;

        info!(port, "control server listening");

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match server.recv_timeout(READ_TIMEOUT) {
                Ok(Some(request)) => {
                    if let Err(err) = self.handle(request) {
                        warn!(error = %err, "control server request failed");
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    return Err(err).context("control server accept loop failed");
                }
            }
        }
    }

    fn handle(&self, mut request: tiny_http::Request) -> Result<()> {
        let method = request.method().clone();
        let url = request.url().to_string();
        let path = url.split('?').next().unwrap_or("").to_string();

        let response = match (method.clone(), path.as_str()) {
            (Method::Get, "/health") => json_response(200, &json!({"status": "ok"})),
            (Method::Get, "/api/v1/status") => self.handle_status(),
            (Method::Get, "/api/v1/queue") => self.handle_queue(),
            (Method::Get, "/api/v1/completed") => self.handle_completed(&url),
            (Method::Get, "/api/v1/inbox") => self.handle_inbox(),
            (Method::Post, "/api/v1/queue/action") => self.handle_promote_one(&mut request),
            (Method::Post, "/api/v1/queue/action/all") => self.handle_promote_all(),
            (m, p) if is_known_path(p) => {
                json_response(405, &json!({"error": format!("method {m:?} not allowed on {p}")}))
            }
            _ => json_response(404, &json!({"error": "not found"})),
        };

        request
            .respond(response)
            .context("failed to write HTTP response")
    }

    fn handle_status(&self) -> Response<std::io::Cursor<Vec<u8>>> {
        let executing = find_executing(&self.queue_dir);
        let queue_names = list_md_names(&self.queue_dir);
        let completed_count = list_md_names(&self.completed_dir).len();
        let inbox_count = list_md_names(&self.inbox_dir).len();
        let newest_log = newest_log_file(&self.log_dir);

        let body = json!({
            "executing": executing.as_ref().map(|e| &e.name),
            "container": executing.as_ref().map(|e| &e.container),
            "elapsed_seconds": executing.as_ref().map(|e| {
                (Utc::now() - e.started).num_seconds().max(0)
            }),
            "queue_length": queue_names.len(),
            "queue": queue_names,
            "completed_count": completed_count,
            "inbox_count": inbox_count,
            "newest_log": newest_log,
        });
        json_response(200, &body)
    }

    fn handle_queue(&self) -> Response<std::io::Cursor<Vec<u8>>> {
        let mut entries = Vec::new();
        for name in list_md_names(&self.queue_dir) {
            let path = self.queue_dir.join(&name);
            let title = store::title(&path).unwrap_or_default();
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            entries.push(json!({"name": name, "title": title, "size": size}));
        }
        json_response(200, &json!({"queue": entries}))
    }

    fn handle_completed(&self, url: &str) -> Response<std::io::Cursor<Vec<u8>>> {
        let limit = parse_limit(url);
        let mut names = list_md_names(&self.completed_dir);
        names.sort();
        names.reverse();
        names.truncate(limit);
        json_response(200, &json!({"completed": names}))
    }

    fn handle_inbox(&self) -> Response<std::io::Cursor<Vec<u8>>> {
        json_response(200, &json!({"inbox": list_md_names(&self.inbox_dir)}))
    }

    fn handle_promote_one(
        &self,
        request: &mut tiny_http::Request,
    ) -> Response<std::io::Cursor<Vec<u8>>> {
        if request.body_length().map(|n| n as u64).unwrap_or(0) > MAX_BODY_BYTES {
            return json_response(400, &json!({"error": "request body too large"}));
        }
        let mut body = String::new();
        if request.as_reader().read_to_string(&mut body).is_err() {
            return json_response(400, &json!({"error": "failed to read request body"}));
        }
        let parsed: serde_json::Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(_) => return json_response(400, &json!({"error": "invalid JSON body"})),
        };
        let Some(file) = parsed.get("file").and_then(|v| v.as_str()) else {
            return json_response(400, &json!({"error": "missing field `file`"}));
        };
        if !is_safe_name(file) {
            return json_response(400, &json!({"error": "invalid file name"}));
        }

        let source = self.inbox_dir.join(file);
        if !source.is_file() {
            return json_response(404, &json!({"error": "file not found in inbox"}));
        }

        match self.promote(&source) {
            Ok(pair) => json_response(200, &json!({"promoted": pair})),
            Err(err) => json_response(500, &json!({"error": err.to_string()})),
        }
    }

    fn handle_promote_all(&self) -> Response<std::io::Cursor<Vec<u8>>> {
        let mut results = Vec::new();
        for name in list_md_names(&self.inbox_dir) {
            let source = self.inbox_dir.join(&name);
            match self.promote(&source) {
                Ok(pair) => results.push(json!({"promoted": pair})),
                Err(err) => results.push(json!({"file": name, "error": err.to_string()})),
            }
        }
        json_response(200, &json!({"results": results}))
    }

    fn promote(&self, source: &Path) -> Result<PromotedPair> {
        let name = source
            .file_name()
            .context("inbox file has no name")?
            .to_string_lossy()
            .to_string();
        let dest = self.queue_dir.join(&name);
        std::fs::rename(source, &dest)
            .with_context(|| format!("failed to promote {}", source.display()))?;

        store::normalize(&self.queue_dir, &self.completed_dir, self.mover.as_ref())
            .context("normalize after promotion failed")?;

        Ok(PromotedPair {
            old: name,
            new: dest
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        })
    }
}

fn is_known_path(path: &str) -> bool {
    matches!(
        path,
        "/health"
            | "/api/v1/status"
            | "/api/v1/queue"
            | "/api/v1/completed"
            | "/api/v1/inbox"
            | "/api/v1/queue/action"
            | "/api/v1/queue/action/all"
    )
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains("..")
}

fn parse_limit(url: &str) -> usize {
    const DEFAULT: usize = 10;
    let Some(query) = url.split_once('?').map(|(_, q)| q) else {
        return DEFAULT;
    };
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("limit=") {
            if let Ok(n) = value.parse::<usize>() {
                return n.clamp(1, 1000);
            }
        }
    }
    DEFAULT
}

fn list_md_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.ends_with(".md"))
        .collect();
    names.sort();
    names
}

/// The currently-executing prompt's name, container identifier, and start
/// time, as surfaced by `GET /api/v1/status` per spec's daemon summary.
struct Executing {
    name: String,
    container: String,
    started: DateTime<Utc>,
}

fn find_executing(queue_dir: &Path) -> Option<Executing> {
    let entries = std::fs::read_dir(queue_dir).ok()?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() || path.extension().map(|e| e != "md").unwrap_or(true) {
            continue;
        }
        let Ok(doc) = store::read_frontmatter(&path) else {
            continue;
        };
        let status = crate::prompt::Status::parse(
            crate::frontmatter::get_str(&doc.fields, store::KEY_STATUS).as_deref(),
        );
        if status == crate::prompt::Status::Executing {
            let name = entry.file_name().to_string_lossy().to_string();
            let container =
                crate::frontmatter::get_str(&doc.fields, store::KEY_CONTAINER).unwrap_or_default();
            let started = crate::frontmatter::get_str(&doc.fields, store::KEY_STARTED)
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            return Some(Executing {
                name,
                container,
                started,
            });
        }
    }
    None
}

fn newest_log_file(log_dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(log_dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .max_by_key(|e| {
            e.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
        .map(|e| e.file_name().to_string_lossy().to_string())
}

fn json_response(status: u16, body: &serde_json::Value) -> Response<std::io::Cursor<Vec<u8>>> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let header = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap();
    Response::from_data(payload)
        .with_status_code(status)
        .with_header(header)
}
