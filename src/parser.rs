//! Stream parser: extracts framed agent output from interleaved stdout/stderr
//! byte streams, enforcing size caps, a startup timeout, and an idle timeout.
//!
//! Wire format (stdout only, newline-delimited):
//! ```text
//! OUTPUT_START
//! { "status": "success"|"error", "result": ..., "newSessionId": ..., "error": ... }
//! OUTPUT_END
//! ```
//! Anything outside a marker pair is diagnostic noise, captured but not parsed.
//!
//! Grounded on `acp/process.rs::AcpProcess::spawn`'s bounded stderr-capture
//! task (`MAX_STDERR_BYTES`) and `acp/worker.rs`'s single-reader-task pattern:
//! both streams are meant to be fed from one task, so `feed_stdout`/
//! `feed_stderr` are plain `&mut self` methods rather than needing interior
//! locking.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

/// Decoded payload of one `OUTPUT_START ... OUTPUT_END` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AgentOutput {
    pub status: AgentOutputStatus,
    pub result: Option<String>,
    #[serde(rename = "newSessionId", default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutputStatus {
    Success,
    Error,
}

/// One event produced by feeding bytes into the parser.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    Output(AgentOutput),
    ParseError { reason: String, raw: String },
}

/// What the caller should treat a fired timeout as, per the spec's
/// "on timeout with prior output, success/null; with none, error/null" rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    SuccessNull,
    ErrorNull,
}

/// Snapshot of accumulated parser state, mirroring `getState()`.
#[derive(Debug, Clone)]
pub struct ParserState {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub had_streaming_output: bool,
    pub new_session_id: Option<String>,
    pub timed_out: bool,
}

/// Back-pressure handle: resolves once every dispatched output callback has
/// finished. Cloning is cheap (shared counter); hold a clone across the
/// caller's dispatch loop and `.join().await` it at shutdown.
#[derive(Debug, Clone)]
pub struct OutputChain(Arc<ChainInner>);

#[derive(Debug)]
struct ChainInner {
    pending: AtomicUsize,
    idle: Notify,
}

impl Default for OutputChain {
    fn default() -> Self {
        Self(Arc::new(ChainInner {
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        }))
    }
}

impl OutputChain {
    /// Mark one callback as started; returns a guard that marks it finished on drop.
    pub fn begin(&self) -> ChainGuard {
        self.0.pending.fetch_add(1, Ordering::SeqCst);
        ChainGuard(self.0.clone())
    }

    /// Wait until there are no in-flight callbacks.
    pub async fn join(&self) {
        loop {
            // Register for the next `notify_waiters()` before checking
            // `pending`, so a guard dropping between the check and the
            // `.await` can't produce a wakeup this call never sees.
            let notified = self.0.idle.notified();
            if self.0.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct ChainGuard(Arc<ChainInner>);

impl Drop for ChainGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Bounded byte/line capture with line-granular truncation: a partial line
/// that would overflow the cap is never stored, so truncation never splits a
/// marker line.
struct LineAccumulator {
    cap: usize,
    pending: Vec<u8>,
    captured: Vec<u8>,
    truncated: bool,
}

impl LineAccumulator {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            pending: Vec::new(),
            captured: Vec::new(),
            truncated: false,
        }
    }

    /// Feed raw bytes, returning any complete (newline-terminated) lines.
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(idx) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=idx).collect();
            self.capture(&raw);
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            lines.push(text);
        }
        lines
    }

    fn capture(&mut self, line_with_newline: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.cap.saturating_sub(self.captured.len());
        if line_with_newline.len() <= remaining {
            self.captured.extend_from_slice(line_with_newline);
        } else {
            self.truncated = true;
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.captured).into_owned()
    }
}

enum MarkerState {
    Searching,
    AwaitingJson,
    AwaitingEnd(AgentOutput),
}

/// Stateful parser for one agent session's stdout/stderr.
pub struct OutputParser {
    stdout: LineAccumulator,
    stderr: LineAccumulator,
    marker_state: MarkerState,
    had_streaming_output: bool,
    new_session_id: Option<String>,
    last_pair: Option<AgentOutput>,
    timed_out: bool,
    started_at: Instant,
    last_output_at: Option<Instant>,
    startup_timeout: Duration,
    idle_timeout: Duration,
    chain: OutputChain,
}

impl OutputParser {
    pub fn new(max_bytes: usize, startup_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            stdout: LineAccumulator::new(max_bytes),
            stderr: LineAccumulator::new(max_bytes),
            marker_state: MarkerState::Searching,
            had_streaming_output: false,
            new_session_id: None,
            last_pair: None,
            timed_out: false,
            started_at: Instant::now(),
            last_output_at: None,
            startup_timeout,
            idle_timeout,
            chain: OutputChain::default(),
        }
    }

    /// Feed a chunk of stdout. Markers are only recognized on stdout.
    pub fn feed_stdout(&mut self, bytes: &[u8]) -> Vec<OutputEvent> {
        let mut queue: VecDeque<String> = self.stdout.feed(bytes).into();
        let mut events = Vec::new();

        while let Some(line) = queue.pop_front() {
            match std::mem::replace(&mut self.marker_state, MarkerState::Searching) {
                MarkerState::Searching => {
                    if line == "OUTPUT_START" {
                        self.marker_state = MarkerState::AwaitingJson;
                    }
                    // else: noise, stays in Searching.
                }
                MarkerState::AwaitingJson => match serde_json::from_str::<AgentOutput>(&line) {
                    Ok(parsed) => self.marker_state = MarkerState::AwaitingEnd(parsed),
                    Err(source) => {
                        events.push(OutputEvent::ParseError {
                            reason: source.to_string(),
                            raw: line,
                        });
                        // back in Searching
                    }
                },
                MarkerState::AwaitingEnd(parsed) => {
                    if line == "OUTPUT_END" {
                        self.record_output(&parsed);
                        events.push(OutputEvent::Output(parsed));
                    } else {
                        events.push(OutputEvent::ParseError {
                            reason: "expected OUTPUT_END".to_string(),
                            raw: line.clone(),
                        });
                        // re-feed this line as if freshly arrived in Searching,
                        // so a stray OUTPUT_START isn't swallowed.
                        queue.push_front(line);
                    }
                }
            }
        }

        events
    }

    /// Feed a chunk of stderr. Stderr is diagnostic-only; no markers are
    /// recognized there.
    pub fn feed_stderr(&mut self, bytes: &[u8]) {
        self.stderr.feed(bytes);
    }

    fn record_output(&mut self, parsed: &AgentOutput) {
        self.had_streaming_output = true;
        self.last_output_at = Some(Instant::now());
        if parsed.new_session_id.is_some() {
            self.new_session_id = parsed.new_session_id.clone();
        }
        self.last_pair = Some(parsed.clone());
    }

    /// Record an already-decoded output, bypassing marker framing.
    ///
    /// Used by backends whose transport hands over a fully-formed `Output`
    /// object directly (the S3-outbox backend downloads `<id>.json` objects
    /// that already are one JSON object, never wrapped in `OUTPUT_START`/
    /// `OUTPUT_END`) instead of an interleaved byte stream. Still
    /// participates in idle-timeout bookkeeping and `parse_final_output`.
    pub fn ingest_output(&mut self, parsed: AgentOutput) {
        self.record_output(&parsed);
    }

    /// Final-pair parse for legacy callers that never registered a streaming
    /// callback. Returns the last well-formed pair observed, if any.
    pub fn parse_final_output(&self) -> Option<AgentOutput> {
        self.last_pair.clone()
    }

    /// Check whether the startup/idle deadline has elapsed, firing at most once.
    pub fn check_timeout(&mut self, now: Instant) -> Option<TimeoutOutcome> {
        if self.timed_out {
            return None;
        }
        let deadline = match self.last_output_at {
            Some(last) => last + self.idle_timeout,
            None => self.started_at + self.startup_timeout,
        };
        if now < deadline {
            return None;
        }
        self.timed_out = true;
        Some(if self.had_streaming_output {
            TimeoutOutcome::SuccessNull
        } else {
            TimeoutOutcome::ErrorNull
        })
    }

    pub fn output_chain(&self) -> OutputChain {
        self.chain.clone()
    }

    pub fn get_state(&self) -> ParserState {
        ParserState {
            stdout: self.stdout.text(),
            stderr: self.stderr.text(),
            stdout_truncated: self.stdout.truncated,
            stderr_truncated: self.stderr.truncated,
            had_streaming_output: self.had_streaming_output,
            new_session_id: self.new_session_id.clone(),
            timed_out: self.timed_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(json: &str) -> String {
        format!("OUTPUT_START\n{json}\nOUTPUT_END\n")
    }

    #[test]
    fn parses_well_formed_pair_in_one_chunk() {
        let mut parser = OutputParser::new(1 << 20, Duration::from_secs(1), Duration::from_secs(1));
        let events = parser.feed_stdout(output(r#"{"status":"success","result":"hi"}"#).as_bytes());
        assert_eq!(events.len(), 1);
        match &events[0] {
            OutputEvent::Output(out) => {
                assert_eq!(out.status, AgentOutputStatus::Success);
                assert_eq!(out.result.as_deref(), Some("hi"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(parser.get_state().had_streaming_output);
    }

    #[test]
    fn parses_pair_split_across_arbitrary_chunks() {
        let mut parser = OutputParser::new(1 << 20, Duration::from_secs(1), Duration::from_secs(1));
        let whole = output(r#"{"status":"success","result":"hi"}"#);
        let bytes = whole.as_bytes();
        let mut events = Vec::new();
        for chunk in bytes.chunks(3) {
            events.extend(parser.feed_stdout(chunk));
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], OutputEvent::Output(_)));
    }

    #[test]
    fn invalid_json_emits_parse_error_and_continues() {
        let mut parser = OutputParser::new(1 << 20, Duration::from_secs(1), Duration::from_secs(1));
        let mut malformed = String::from("OUTPUT_START\nnot json\nOUTPUT_END\n");
        malformed.push_str(&output(r#"{"status":"success","result":"ok"}"#));
        let events = parser.feed_stdout(malformed.as_bytes());
        assert!(matches!(events[0], OutputEvent::ParseError { .. }));
        assert!(events.iter().any(|e| matches!(e, OutputEvent::Output(_))));
    }

    #[test]
    fn truncation_never_splits_a_line() {
        let mut parser = OutputParser::new(10, Duration::from_secs(1), Duration::from_secs(1));
        parser.feed_stdout(b"0123456789AB\n");
        let state = parser.get_state();
        assert!(state.stdout_truncated);
        assert!(state.stdout.is_empty() || !state.stdout.contains('\u{0}'));
    }

    #[test]
    fn legacy_mode_returns_last_pair() {
        let mut parser = OutputParser::new(1 << 20, Duration::from_secs(1), Duration::from_secs(1));
        parser.feed_stdout(output(r#"{"status":"success","result":"first"}"#).as_bytes());
        parser.feed_stdout(output(r#"{"status":"success","result":"second"}"#).as_bytes());
        let last = parser.parse_final_output().unwrap();
        assert_eq!(last.result.as_deref(), Some("second"));
    }

    #[test]
    fn startup_timeout_without_output_is_error_null() {
        let mut parser = OutputParser::new(1 << 20, Duration::from_millis(0), Duration::from_secs(60));
        let outcome = parser.check_timeout(Instant::now() + Duration::from_millis(1));
        assert_eq!(outcome, Some(TimeoutOutcome::ErrorNull));
        assert_eq!(parser.check_timeout(Instant::now()), None, "fires only once");
    }

    #[test]
    fn idle_timeout_after_output_is_success_null() {
        let mut parser = OutputParser::new(1 << 20, Duration::from_secs(60), Duration::from_millis(0));
        parser.feed_stdout(output(r#"{"status":"success","result":"hi"}"#).as_bytes());
        let outcome = parser.check_timeout(Instant::now() + Duration::from_millis(5));
        assert_eq!(outcome, Some(TimeoutOutcome::SuccessNull));
    }

    #[tokio::test]
    async fn output_chain_joins_after_all_callbacks_finish() {
        let chain = OutputChain::default();
        let guard = chain.begin();
        let chain2 = chain.clone();
        let joined = tokio::spawn(async move {
            chain2.join().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        joined.await.unwrap();
    }
}
