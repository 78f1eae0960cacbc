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

//! Byte-oriented front-matter fence splitter plus a key-preserving YAML
//! decoder. Deliberately not a full round-trip YAML document parser: we
//! only need to find the `---`-delimited block at the top of the file,
//! decode it into a generic mapping, and re-encode it after mutating a
//! handful of known keys while leaving unknown keys untouched.

use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};

const FENCE_OPEN: &str = "---\n";

/// A parsed markdown file: the front-matter mapping (empty if none was
/// present) and the body that follows the closing fence.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub fields: Mapping,
    pub body: String,
}

/// Split `text` into a front-matter block and body.
///
/// The opening fence must be exactly `---\n` at byte offset 0. The closing
/// fence must be `\n---\n` on its own line, or `\n---` at end-of-file
/// without a trailing newline. An unclosed opening fence means there is no
/// front-matter at all — the whole file is treated as body.
pub fn parse(text: &str) -> Result<Document> {
    if !text.starts_with(FENCE_OPEN) {
        return Ok(Document {
            fields: Mapping::new(),
            body: text.to_string(),
        });
    }

    let after_open = &text[FENCE_OPEN.len()..];

    let close = find_closing_fence(after_open);
    let Some((yaml_block, body_start)) = close else {
        return Ok(Document {
            fields: Mapping::new(),
            body: text.to_string(),
        });
    };

    let fields = if yaml_block.trim().is_empty() {
        Mapping::new()
    } else {
        let value: Value = serde_yaml::from_str(yaml_block)
            .context("failed to parse front-matter YAML block")?;
        match value {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            other => {
                anyhow::bail!("front-matter block is not a YAML mapping: {:?}", other)
            }
        }
    };

    Ok(Document {
        fields,
        body: after_open[body_start..].to_string(),
    })
}

/// Find the closing fence within `after_open` (the text following the
/// opening `---\n`). Returns the YAML block text and the byte offset (into
/// `after_open`) where the body starts.
fn find_closing_fence(after_open: &str) -> Option<(&str, usize)> {
    // Closing fence on its own line: "\n---\n"
    if let Some(pos) = after_open.find("\n---\n") {
        return Some((&after_open[..pos], pos + "\n---\n".len()));
    }
    // Trailing variant at EOF without a final newline: "\n---" at the very end.
    if after_open.ends_with("\n---") {
        let pos = after_open.len() - "\n---".len();
        return Some((&after_open[..pos], after_open.len()));
    }
    // The opening fence alone, with nothing else, counts as unclosed.
    None
}

/// Render a document back to its on-disk text form. Always writes a fence,
/// even if `fields` is empty and none existed before — callers decide
/// whether to call this (set-field synthesizes front-matter on first write).
pub fn render(doc: &Document) -> Result<String> {
    let yaml = if doc.fields.is_empty() {
        String::new()
    } else {
        serde_yaml::to_string(&Value::Mapping(doc.fields.clone()))
            .context("failed to serialize front-matter YAML block")?
    };

    let mut out = String::from("---\n");
    out.push_str(&yaml);
    out.push_str("---\n");
    out.push_str(&doc.body);
    Ok(out)
}

pub fn get_str(fields: &Mapping, key: &str) -> Option<String> {
    fields
        .get(Value::String(key.to_string()))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn set_str(fields: &mut Mapping, key: &str, value: &str) {
    fields.insert(Value::String(key.to_string()), Value::String(value.to_string()));
}
