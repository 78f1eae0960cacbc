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

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dark-factory")]
#[command(about = "Executes a pipeline of markdown prompts through a sandboxed worker")]
#[command(version)]
pub struct Cli {
    /// Path to config file (defaults to dark-factory.toml in the current directory if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Starts the daemon when omitted
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the daemon: acquire the lock, recover, and run until shutdown
    Run {
        /// `direct` or `pr`
        #[arg(long, default_value = "direct")]
        workflow: String,

        #[arg(long, default_value = "inbox")]
        inbox_dir: PathBuf,

        #[arg(long, default_value = "queue")]
        queue_dir: PathBuf,

        #[arg(long, default_value = "completed")]
        completed_dir: PathBuf,

        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,

        /// Opaque executor identifier (a program or container image name)
        #[arg(long)]
        container_image: Option<String>,

        #[arg(long, default_value_t = 500)]
        debounce_ms: u64,

        /// `0` disables the control server
        #[arg(long, default_value_t = 8080)]
        server_port: u16,
    },

    /// Query the running daemon's status
    Status {
        #[arg(long, default_value_t = 8080)]
        server_port: u16,
    },

    /// Promote one (or, with --all, every) inbox file into the queue
    Promote {
        /// File name within the inbox directory; omit when using --all
        file: Option<String>,

        #[arg(long)]
        all: bool,

        #[arg(long, default_value_t = 8080)]
        server_port: u16,
    },
}
