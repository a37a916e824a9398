//! Read-until-pattern primitive for text dialogues over a PTY.
//!
//! Both the interactive shell and the scripted login drive remote programs
//! by sending a line and waiting for a pattern. [`read_until`] is the single
//! implementation of the waiting half:
//!
//! - polls [`ShellStream::try_recv`] without blocking, sleeping
//!   `poll_interval` between empty polls, until `step.timeout` elapses
//! - decodes UTF-8 across chunk boundaries and matches on text with ANSI
//!   escape sequences removed
//! - answers `--More--` pager markers with a space and drops them from the
//!   output
//! - when `step.echo` is set, only text received after the echo of the sent
//!   line is matched, so a command never matches its own echo
//! - failure patterns are checked before success patterns
//!
//! [`strip_response`] then turns the matched text into command output.

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::transport::{ShellStream, TransportError};

/// Pager marker, highlighted or plain at the end of the buffer.
static PAGER_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[7m--More--\x1b\[27m|--More--[ \t]*$").expect("valid pager regex")
});

/// CSI and OSC escape sequences.
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("valid escape regex")
});

/// Where a success pattern must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Anywhere in the text after the echo.
    Anywhere,
    /// Within the last line only (shell prompts).
    LastLine,
}

/// One wait.
#[derive(Debug, Clone, Copy)]
pub struct ExpectStep<'a> {
    /// Success patterns; the index of the first one that matches is reported.
    pub patterns: &'a [Regex],
    /// Text that must be echoed before matching starts.
    pub echo: Option<&'a str>,
    pub anchor: Anchor,
    /// Patterns that end the wait with [`ExpectError::Failure`].
    pub failures: &'a [Regex],
    pub timeout: Duration,
}

impl<'a> ExpectStep<'a> {
    pub fn new(patterns: &'a [Regex], timeout: Duration) -> Self {
        Self {
            patterns,
            echo: None,
            anchor: Anchor::Anywhere,
            failures: &[],
            timeout,
        }
    }

    pub fn after_echo(mut self, echo: &'a str) -> Self {
        self.echo = Some(echo).filter(|e| !e.is_empty());
        self
    }

    pub fn anchored(mut self, anchor: Anchor) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn failing_on(mut self, failures: &'a [Regex]) -> Self {
        self.failures = failures;
        self
    }

    fn describe(&self) -> String {
        let patterns: Vec<&str> = self.patterns.iter().map(Regex::as_str).collect();
        format!("'{}'", patterns.join("' | '"))
    }
}

/// A successful wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matched {
    /// Index into [`ExpectStep::patterns`].
    pub index: usize,
    /// Everything received during the wait, escape sequences removed.
    pub output: String,
}

#[derive(Error, Debug)]
pub enum ExpectError {
    #[error("timed out after {waited:?} waiting for {pattern}")]
    Timeout {
        pattern: String,
        waited: Duration,
        partial: String,
    },

    #[error("stream closed while waiting for {pattern}")]
    Closed { pattern: String, partial: String },

    #[error("{line}")]
    Failure { line: String, partial: String },

    #[error("{0}")]
    Transport(#[from] TransportError),
}

impl ExpectError {
    /// Text received before the wait ended.
    pub fn partial(&self) -> &str {
        match self {
            ExpectError::Timeout { partial, .. }
            | ExpectError::Closed { partial, .. }
            | ExpectError::Failure { partial, .. } => partial,
            ExpectError::Transport(_) => "",
        }
    }
}

/// Send `line` terminated by CRLF.
pub async fn send_line(stream: &mut dyn ShellStream, line: &str) -> Result<(), TransportError> {
    let mut data = Vec::with_capacity(line.len() + 2);
    data.extend_from_slice(line.as_bytes());
    data.extend_from_slice(b"\r\n");
    stream.send(&data).await
}

/// Wait until one of `step.patterns` matches.
///
/// # Arguments
///
/// * `stream` - The PTY to read from (and to answer pagers on)
/// * `step` - What to wait for
/// * `poll_interval` - Sleep between empty polls
///
/// # Returns
///
/// * `Ok(Matched)` - Which pattern matched and the received text
/// * `Err(ExpectError::Timeout)` - `step.timeout` elapsed
/// * `Err(ExpectError::Closed)` - The remote closed the stream first
/// * `Err(ExpectError::Failure)` - A failure pattern matched
pub async fn read_until(
    stream: &mut dyn ShellStream,
    step: ExpectStep<'_>,
    poll_interval: Duration,
) -> Result<Matched, ExpectError> {
    let started = Instant::now();
    let deadline = started + step.timeout;
    let mut decoder = Utf8Decoder::default();
    let mut raw = String::new();
    let mut closed = false;

    loop {
        let mut received = false;
        loop {
            match stream.try_recv() {
                Ok(Some(chunk)) => {
                    decoder.push(&chunk, &mut raw);
                    received = true;
                }
                Ok(None) => break,
                Err(TransportError::Closed) => {
                    closed = true;
                    break;
                }
                Err(e) => return Err(ExpectError::Transport(e)),
            }
        }

        if received {
            if PAGER_MARKER.is_match(&raw) {
                raw = PAGER_MARKER.replace_all(&raw, "").into_owned();
                debug!("Pager marker seen, sending continuation");
                stream.send(b" ").await?;
                continue;
            }

            let text = strip_ansi(&raw);
            if let Some(outcome) = evaluate(&text, &step) {
                return outcome;
            }
        }

        if closed {
            return Err(ExpectError::Closed {
                pattern: step.describe(),
                partial: strip_ansi(&raw),
            });
        }

        let now = Instant::now();
        if now >= deadline {
            let partial = strip_ansi(&raw);
            warn!(
                "Timed out after {:?} waiting for {} ({} bytes received)",
                step.timeout,
                step.describe(),
                partial.len()
            );
            return Err(ExpectError::Timeout {
                pattern: step.describe(),
                waited: now - started,
                partial,
            });
        }

        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

/// Check the accumulated text against a step.
fn evaluate(text: &str, step: &ExpectStep<'_>) -> Option<Result<Matched, ExpectError>> {
    let region = match step.echo {
        Some(echo) => &text[text.find(echo)? + echo.len()..],
        None => text,
    };

    for failure in step.failures {
        if let Some(found) = failure.find(region) {
            let line = line_around(region, found.start()).trim().to_string();
            return Some(Err(ExpectError::Failure {
                line,
                partial: text.to_string(),
            }));
        }
    }

    let haystack = match step.anchor {
        Anchor::Anywhere => region,
        Anchor::LastLine => last_line(region),
    };

    step.patterns
        .iter()
        .position(|pattern| pattern.is_match(haystack))
        .map(|index| {
            Ok(Matched {
                index,
                output: text.to_string(),
            })
        })
}

fn last_line(text: &str) -> &str {
    let line = text.rsplit('\n').next().unwrap_or(text);
    line.trim_start_matches('\r')
}

fn line_around(text: &str, offset: usize) -> &str {
    let start = text[..offset].rfind('\n').map_or(0, |i| i + 1);
    let end = text[offset..].find('\n').map_or(text.len(), |i| offset + i);
    &text[start..end]
}

/// Remove terminal escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Turn the text of a matched wait into command output.
///
/// Drops everything up to and including the line that carries `echo`, then
/// drops the trailing line when it matches `prompt`. Carriage returns are
/// removed and the result is trimmed.
pub fn strip_response(output: &str, echo: Option<&str>, prompt: &Regex) -> String {
    let text = output.replace('\r', "");

    let body = match echo.filter(|e| !e.is_empty()).and_then(|e| {
        text.find(e).map(|at| at + e.len())
    }) {
        Some(echo_end) => match text[echo_end..].find('\n') {
            Some(newline) => &text[echo_end + newline + 1..],
            None => "",
        },
        None => text.as_str(),
    };

    let mut lines: Vec<&str> = body.lines().collect();
    if let Some(last) = lines.last()
        && prompt.is_match(last)
    {
        lines.pop();
    }

    lines.join("\n").trim().to_string()
}

/// Last non-empty line of `output` that does not match `prompt`.
pub fn last_response_line(output: &str, prompt: &Regex) -> Option<String> {
    output
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty() && !prompt.is_match(line))
        .next_back()
        .map(|line| line.trim().to_string())
}

/// Fill `{name}` placeholders from `vars`.
///
/// With `escape`, substituted values are regex-escaped so the result can be
/// compiled as a pattern. Unknown placeholders are left untouched.
pub fn interpolate(template: &str, vars: &HashMap<String, String>, escape: bool) -> String {
    let mut result = template.to_string();
    for (name, value) in vars {
        let placeholder = format!("{{{}}}", name);
        if result.contains(&placeholder) {
            let value = if escape {
                regex::escape(value)
            } else {
                value.clone()
            };
            result = result.replace(&placeholder, &value);
        }
    }
    result
}

/// Incremental UTF-8 decoding; a multi-byte character split across chunks is
/// held back until it is complete.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, chunk: &[u8], out: &mut String) {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                out.push_str(text);
                self.pending.clear();
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                self.pending.drain(..valid);
            }
            Err(_) => {
                out.push_str(&String::from_utf8_lossy(&self.pending));
                self.pending.clear();
            }
        }
    }
}
