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

//! Named error variants the engine's control flow branches on. Everything
//! else travels as an opaque `anyhow::Error` context chain; these are the
//! handful of cases a caller needs to distinguish by kind rather than by
//! message, so they're matched via `downcast_ref` at the call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Returned by `content()` when the body is empty or whitespace-only
    /// after stripping front-matter and secondary empty fences.
    #[error("prompt body is empty or whitespace-only")]
    EmptyPrompt,

    /// The on-disk lock file is already held by another process.
    #[error("lock already held by pid {0}")]
    LockHeld(u32),

    /// Configuration failed validation at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
