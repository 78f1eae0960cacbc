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

pub mod cancellation;
pub mod cli;
pub mod config;
pub mod control_server;
pub mod error;
pub mod executor;
pub mod frontmatter;
pub mod lock;
pub mod processor;
pub mod prompt;
pub mod runner;
pub mod store;
pub mod vcs;
pub mod version;
pub mod watcher;
