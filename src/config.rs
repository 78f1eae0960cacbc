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

//! On-disk configuration: every field is optional so a config file can
//! override as little or as much as it likes, with CLI flags taking
//! precedence over the file and built-in defaults filling whatever's left.
//! Validated once, at startup — invalid configuration fails fast rather
//! than silently masking a missing required field.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::processor::Workflow;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// `direct` or `pr`.
    pub workflow: Option<String>,
    pub inbox_dir: Option<String>,
    pub queue_dir: Option<String>,
    pub completed_dir: Option<String>,
    pub log_dir: Option<String>,
    /// Opaque string passed to the Executor (the container/program to run).
    pub container_image: Option<String>,
    pub debounce_ms: Option<u64>,
    /// `0` disables the control server.
    pub server_port: Option<u16>,
}

impl Config {
    /// Load config from a file, or return defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Merge this config with a CLI value, where the CLI value takes
    /// precedence whenever it differs from its own default.
    pub fn merge_with_cli<T>(&self, cli_value: T, config_value: Option<T>, default_value: T) -> T
    where
        T: PartialEq + Clone,
    {
        if cli_value != default_value {
            cli_value
        } else if let Some(config_val) = config_value {
            config_val
        } else {
            default_value
        }
    }
}

/// Fully resolved, validated configuration: the shape the Runner consumes.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub workflow: Workflow,
    pub inbox_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub completed_dir: PathBuf,
    pub log_dir: PathBuf,
    pub container_image: String,
    pub debounce_ms: u64,
    pub server_port: u16,
}

impl ResolvedConfig {
    pub fn validate(self) -> Result<Self> {
        if self.queue_dir == self.completed_dir {
            return Err(EngineError::InvalidConfig(
                "queueDir and completedDir must differ".to_string(),
            )
            .into());
        }
        if self.inbox_dir == self.completed_dir {
            return Err(EngineError::InvalidConfig(
                "inboxDir and completedDir must differ".to_string(),
            )
            .into());
        }
        if self.container_image.trim().is_empty() {
            return Err(
                EngineError::InvalidConfig("containerImage must not be empty".to_string()).into(),
            );
        }
        // server_port is a u16, so [0, 65535] is automatic; 0 means disabled
        // and needs no further validation.
        Ok(self)
    }
}

pub fn parse_workflow(raw: &str) -> Result<Workflow> {
    match raw {
        "direct" => Ok(Workflow::Direct),
        "pr" => Ok(Workflow::Pr),
        other => Err(EngineError::InvalidConfig(format!(
            "workflow must be \"direct\" or \"pr\", got \"{other}\""
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/dark-factory.toml")).unwrap();
        assert!(config.workflow.is_none());
    }

    #[test]
    fn merge_with_cli_prefers_non_default_cli_value() {
        let config = Config::default();
        let merged = config.merge_with_cli(500u64, Some(750), 500);
        assert_eq!(merged, 500);
    }

    #[test]
    fn merge_with_cli_falls_back_to_config_then_default() {
        let config = Config::default();
        assert_eq!(config.merge_with_cli(500u64, Some(750), 500), 500);

        let mut with_value = Config::default();
        with_value.debounce_ms = Some(750);
        assert_eq!(
            with_value.merge_with_cli(500u64, with_value.debounce_ms, 500),
            750
        );
    }

    #[test]
    fn parse_workflow_rejects_unknown_values() {
        assert!(parse_workflow("direct").is_ok());
        assert!(parse_workflow("pr").is_ok());
        assert!(parse_workflow("bogus").is_err());
    }

    #[test]
    fn validate_rejects_identical_queue_and_completed() {
        let config = ResolvedConfig {
            workflow: Workflow::Direct,
            inbox_dir: PathBuf::from("inbox"),
            queue_dir: PathBuf::from("queue"),
            completed_dir: PathBuf::from("queue"),
            log_dir: PathBuf::from("logs"),
            container_image: "worker".to_string(),
            debounce_ms: 500,
            server_port: 8080,
        };
        assert!(config.validate().is_err());
    }
}
