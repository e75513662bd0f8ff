//! Tolerant extraction of code blocks and tool calls from LLM replies.
//!
//! Parsing never fails: malformed input degrades to warnings and whatever
//! valid blocks exist. A reply with no blocks and no tool calls is the
//! loop's "final answer" signal, so an empty outcome is a normal result,
//! not an error.
//!
//! Recognized syntax:
//!
//! - Fenced code blocks (``` or ~~~, three or more fence characters). The
//!   info string carries the language tag and optional `key=value`
//!   attributes; `name=...` names the block.
//! - Unnamed blocks get deterministic names: the first is `main`, the Nth
//!   unnamed block is `blockN`.
//! - A fence with the language tag `toolcall` is a tool-call directive:
//!   its body is a JSON object `{"name": ..., "arguments": {...}}`.
//!
//! Free text outside fences is collected as commentary for display only.

use crate::block::CodeBlock;
use crate::tools::ToolCall;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Fence language tag marking a tool-call directive.
const TOOLCALL_LANG: &str = "toolcall";

/// A non-fatal problem found while parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    /// 1-based line in the reply where the problem starts.
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Structured result of parsing one reply.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub blocks: Vec<CodeBlock>,
    pub tool_calls: Vec<ToolCall>,
    /// Free text outside fences, for display only.
    pub commentary: String,
    pub warnings: Vec<ParseWarning>,
}

impl ParseOutcome {
    /// True when the reply contains nothing to execute: the model produced
    /// a final answer.
    pub fn is_final(&self) -> bool {
        self.blocks.is_empty() && self.tool_calls.is_empty()
    }
}

struct OpenFence {
    marker: char,
    run: usize,
    lang: String,
    name: Option<String>,
    start_line: usize,
    body: Vec<String>,
}

/// Parses a full (de-streamed) LLM reply.
pub fn parse(reply: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let mut commentary: Vec<&str> = Vec::new();
    let mut open: Option<OpenFence> = None;
    let mut unnamed = 0usize;
    let mut used_names: Vec<String> = Vec::new();

    for (idx, line) in reply.lines().enumerate() {
        let lineno = idx + 1;
        let closes = open
            .as_ref()
            .is_some_and(|fence| is_closing_fence(line, fence.marker, fence.run));
        if closes {
            let fence = open.take().unwrap();
            finish_fence(fence, &mut outcome, &mut unnamed, &mut used_names);
        } else if let Some(fence) = open.as_mut() {
            fence.body.push(line.to_string());
        } else if let Some((marker, run, info)) = opening_fence(line) {
            let (lang, name) = parse_info_string(info);
            open = Some(OpenFence {
                marker,
                run,
                lang,
                name,
                start_line: lineno,
                body: Vec::new(),
            });
        } else {
            commentary.push(line);
        }
    }

    if let Some(fence) = open {
        outcome.warnings.push(ParseWarning {
            line: fence.start_line,
            message: format!("unterminated code fence (```{}) dropped", fence.lang),
        });
    }

    outcome.commentary = commentary.join("\n").trim().to_string();
    debug!(
        blocks = outcome.blocks.len(),
        tool_calls = outcome.tool_calls.len(),
        warnings = outcome.warnings.len(),
        "Reply parsed"
    );
    outcome
}

fn finish_fence(
    fence: OpenFence,
    outcome: &mut ParseOutcome,
    unnamed: &mut usize,
    used_names: &mut Vec<String>,
) {
    let body = fence.body.join("\n");
    if body.trim().is_empty() {
        outcome.warnings.push(ParseWarning {
            line: fence.start_line,
            message: "empty code block dropped".to_string(),
        });
        return;
    }

    if fence.lang == TOOLCALL_LANG {
        match serde_json::from_str::<ToolCall>(&body) {
            Ok(call) if !call.name.trim().is_empty() => outcome.tool_calls.push(call),
            Ok(_) => outcome.warnings.push(ParseWarning {
                line: fence.start_line,
                message: "tool call with empty name dropped".to_string(),
            }),
            Err(e) => outcome.warnings.push(ParseWarning {
                line: fence.start_line,
                message: format!("invalid tool call JSON: {e}"),
            }),
        }
        return;
    }

    let mut name = match fence.name {
        Some(name) => name,
        None => {
            *unnamed += 1;
            if *unnamed == 1 {
                "main".to_string()
            } else {
                format!("block{unnamed}")
            }
        }
    };

    // Names must be unique within one reply so events and tool calls can
    // reference blocks unambiguously.
    if used_names.contains(&name) {
        let mut suffix = 2;
        while used_names.contains(&format!("{name}_{suffix}")) {
            suffix += 1;
        }
        outcome.warnings.push(ParseWarning {
            line: fence.start_line,
            message: format!("duplicate block name `{name}` renamed to `{name}_{suffix}`"),
        });
        name = format!("{name}_{suffix}");
    }
    used_names.push(name.clone());

    let position = outcome.blocks.len();
    outcome
        .blocks
        .push(CodeBlock::new(name, fence.lang, body, position));
}

/// Returns (marker, run length, info string) when the line opens a fence.
fn opening_fence(line: &str) -> Option<(char, usize, &str)> {
    let trimmed = line.trim_start();
    let marker = trimmed.chars().next()?;
    if marker != '`' && marker != '~' {
        return None;
    }
    let run = trimmed.chars().take_while(|&c| c == marker).count();
    if run < 3 {
        return None;
    }
    let info = &trimmed[run..];
    // An info string containing the fence marker is not a valid opener.
    if info.contains(marker) {
        return None;
    }
    Some((marker, run, info))
}

/// A closing fence is a run of the opening marker at least as long as the
/// opener, with nothing else on the line.
fn is_closing_fence(line: &str, marker: char, open_run: usize) -> bool {
    let trimmed = line.trim();
    if trimmed.len() < open_run {
        return false;
    }
    trimmed.chars().all(|c| c == marker) && trimmed.chars().count() >= open_run
}

/// Splits an info string into (language tag, optional block name).
///
/// The first bare token is the language; `key=value` tokens are
/// attributes, of which only `name` is meaningful.
fn parse_info_string(info: &str) -> (String, Option<String>) {
    let mut lang = String::new();
    let mut name = None;
    for (i, token) in info.split_whitespace().enumerate() {
        match token.split_once('=') {
            Some(("name", value)) if !value.is_empty() => name = Some(value.to_string()),
            Some(_) => {}
            None if i == 0 => lang = token.to_lowercase(),
            None => {}
        }
    }
    if lang.is_empty() {
        lang = "text".to_string();
    }
    (lang, name)
}
