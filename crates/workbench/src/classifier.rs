//! Turns unstructured process output into a single outcome.
//!
//! Output arrives in arbitrary chunks. Each chunk is forwarded to the output
//! sink first, then decoded and checked against a [`RuleSet`]: every failure
//! rule before any success rule, first match settles. Rules match within one
//! line; the line that was still incomplete before a chunk is rescanned
//! together with the chunk, so tokens split across chunks are found.
//!
//! A failure settles as soon as it is seen. A success found on a line that
//! has not ended yet is held until the line ends (or the stream does), so its
//! excerpt is the whole line.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use regex::Regex;
use sandbox::OutputStream;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, WorkbenchError};
use crate::notify::OutputSink;

/// Decoded output kept for diagnostics.
pub const TAIL_BYTES: usize = 4096;
/// Longest excerpt reported for a match.
const EXCERPT_CHARS: usize = 512;
/// Longest incomplete line kept for rescanning.
const MAX_PENDING_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Success,
    Failure,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::Success => f.write_str("success"),
            RuleKind::Failure => f.write_str("failure"),
        }
    }
}

/// A pattern and the outcome it settles. A line matching any of the
/// exceptions is ignored by this rule.
///
/// Patterns are tested against one line at a time, without its `\n`. A
/// pattern that needs text from two lines (`a\nb`, `a\s+b` across a line
/// break) never matches.
#[derive(Debug, Clone)]
pub struct Rule {
    kind: RuleKind,
    pattern: Regex,
    except: Vec<Regex>,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| WorkbenchError::Config(format!("pattern {pattern:?}: {e}")))
}

impl Rule {
    pub fn success(pattern: &str) -> Result<Self> {
        Self::new(RuleKind::Success, pattern)
    }

    pub fn failure(pattern: &str) -> Result<Self> {
        Self::new(RuleKind::Failure, pattern)
    }

    fn new(kind: RuleKind, pattern: &str) -> Result<Self> {
        Ok(Self {
            kind,
            pattern: compile(pattern)?,
            except: Vec::new(),
        })
    }

    pub fn except(mut self, pattern: &str) -> Result<Self> {
        self.except.push(compile(pattern)?);
        Ok(self)
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    fn matches(&self, line: &str) -> bool {
        self.pattern.is_match(line) && !self.except.iter().any(|e| e.is_match(line))
    }
}

/// What a rule decided, with the line it matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub kind: RuleKind,
    pub pattern: String,
    /// Matched line, trimmed and capped.
    pub excerpt: String,
}

/// Ordered rules. Failure rules are always tested before success rules;
/// within a kind, insertion order decides.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn with(mut self, rule: Rule) -> Self {
        self.push(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check a block of text line by line.
    pub fn check(&self, text: &str) -> Option<Verdict> {
        [RuleKind::Failure, RuleKind::Success]
            .into_iter()
            .find_map(|kind| {
                self.rules
                    .iter()
                    .filter(|rule| rule.kind == kind)
                    .find_map(|rule| {
                        text.split('\n')
                            .find(|line| rule.matches(line))
                            .map(|line| Verdict {
                                kind,
                                pattern: rule.pattern().to_owned(),
                                excerpt: excerpt(line),
                            })
                    })
            })
    }
}

fn excerpt(line: &str) -> String {
    let trimmed = line.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", trimmed.get(..cut).unwrap_or(trimmed)),
        None => trimmed.to_owned(),
    }
}

/// Incremental UTF-8 decoder. A multi-byte sequence split across chunks is
/// held back until complete; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    partial: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.partial);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut input: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    input = &[];
                    break;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = rest.get(len..).unwrap_or_default();
                        }
                        // Incomplete sequence at the end: wait for more.
                        None => {
                            input = rest;
                            break;
                        }
                    }
                }
            }
        }
        self.partial = input.to_vec();
        out
    }

    /// Flush at end of stream; a dangling partial sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.partial.is_empty() {
            String::new()
        } else {
            self.partial.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

/// Last `cap` bytes of decoded output, cut on a char boundary.
#[derive(Debug, Clone)]
pub struct Tail {
    text: String,
    cap: usize,
}

impl Tail {
    pub fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            cap,
        }
    }

    pub fn push(&mut self, text: &str) {
        self.text.push_str(text);
        if self.text.len() > self.cap {
            let mut cut = self.text.len() - self.cap;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Incremental rule matching over a byte stream.
pub struct Matcher {
    rules: Arc<RuleSet>,
    decoder: Utf8Decoder,
    /// Text after the last newline seen.
    pending: String,
    /// Success matched on the unfinished line at the start of `pending`.
    held: Option<Verdict>,
}

impl Matcher {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self {
            rules,
            decoder: Utf8Decoder::default(),
            pending: String::new(),
            held: None,
        }
    }

    /// Decode `chunk` and check it. Returns the decoded text and the verdict,
    /// if the chunk settled one.
    pub fn feed(&mut self, chunk: &[u8]) -> (String, Option<Verdict>) {
        let text = self.decoder.decode(chunk);
        let verdict = self.scan(&text);
        (text, verdict)
    }

    /// Flush the decoder at end of stream.
    pub fn finish(&mut self) -> (String, Option<Verdict>) {
        let text = self.decoder.finish();
        let mut verdict = if text.is_empty() {
            None
        } else {
            self.scan(&text)
        };
        if verdict.is_none() {
            verdict = self.release_held();
        }
        (text, verdict)
    }

    fn scan(&mut self, text: &str) -> Option<Verdict> {
        self.pending.push_str(text);
        let mut verdict = match self.held.take() {
            Some(held) => self.complete_held(held),
            None => self.check_pending(),
        };

        if let Some(newline) = self.pending.rfind('\n') {
            self.pending.drain(..=newline);
        }
        if self.pending.len() > MAX_PENDING_LINE {
            if verdict.is_none() {
                verdict = self.release_held();
            }
            let mut cut = self.pending.len() - MAX_PENDING_LINE;
            while !self.pending.is_char_boundary(cut) {
                cut += 1;
            }
            self.pending.drain(..cut);
        }
        verdict
    }

    fn check_pending(&mut self) -> Option<Verdict> {
        let verdict = self.rules.check(&self.pending)?;
        if verdict.kind == RuleKind::Failure {
            return Some(verdict);
        }
        let complete = match self.pending.rfind('\n') {
            Some(newline) => self.pending.get(..=newline).unwrap_or_default(),
            None => "",
        };
        let settled = self.rules.check(complete);
        if settled.is_none() {
            self.held = Some(verdict);
        }
        settled
    }

    /// The held line is the start of `pending`. Once it ends, the whole line
    /// is checked again: a failure later on the line still wins.
    fn complete_held(&mut self, held: Verdict) -> Option<Verdict> {
        let Some(newline) = self.pending.find('\n') else {
            self.held = Some(held);
            return None;
        };
        let line = self.pending.get(..newline).unwrap_or_default();
        Some(self.rules.check(line).unwrap_or_else(|| Verdict {
            excerpt: excerpt(line),
            ..held
        }))
    }

    fn release_held(&mut self) -> Option<Verdict> {
        let held = self.held.take()?;
        Some(Verdict {
            excerpt: excerpt(&self.pending),
            ..held
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Verdict),
    Failure(Verdict),
    /// Nothing matched before the deadline.
    Timeout,
    /// The stream failed before a match.
    StreamAborted(String),
    /// The stream ended before a match.
    Closed,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub outcome: Outcome,
    /// Decoded output tail at settlement.
    pub tail: String,
}

/// Classifies process output streams with a fixed rule set, forwarding every
/// chunk to a sink.
#[derive(Clone)]
pub struct Classifier {
    rules: Arc<RuleSet>,
    sink: OutputSink,
}

impl Classifier {
    pub fn new(rules: RuleSet, sink: OutputSink) -> Self {
        Self {
            rules: Arc::new(rules),
            sink,
        }
    }

    /// Start pumping `stream`. The pump runs until the stream ends, also
    /// after the outcome settled or the deadline passed.
    pub fn watch(&self, stream: OutputStream) -> Watch {
        let (tx, rx) = oneshot::channel();
        let tail = Arc::new(Mutex::new(Tail::new(TAIL_BYTES)));
        tokio::spawn(pump(
            stream,
            Matcher::new(Arc::clone(&self.rules)),
            Arc::clone(&self.sink),
            Arc::clone(&tail),
            tx,
        ));
        Watch { settled: rx, tail }
    }
}

async fn pump(
    mut stream: OutputStream,
    mut matcher: Matcher,
    sink: OutputSink,
    tail: Arc<Mutex<Tail>>,
    tx: oneshot::Sender<Outcome>,
) {
    let mut tx = Some(tx);
    let settle = |tx: &mut Option<oneshot::Sender<Outcome>>, outcome: Outcome| {
        if let Some(tx) = tx.take() {
            // The receiver is gone once the deadline passed.
            let _ = tx.send(outcome);
        }
    };

    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                sink(chunk.as_ref());
                let (text, verdict) = matcher.feed(&chunk);
                push_tail(&tail, &text);
                if tx.is_some()
                    && let Some(verdict) = verdict
                {
                    debug!(kind = %verdict.kind, pattern = %verdict.pattern, "output settled");
                    settle(&mut tx, into_outcome(verdict));
                }
            }
            Err(e) => {
                debug!(error = %e, "output stream failed");
                settle(&mut tx, Outcome::StreamAborted(e.to_string()));
                return;
            }
        }
    }

    let (text, verdict) = matcher.finish();
    push_tail(&tail, &text);
    match verdict {
        Some(verdict) => settle(&mut tx, into_outcome(verdict)),
        None => settle(&mut tx, Outcome::Closed),
    }
}

fn into_outcome(verdict: Verdict) -> Outcome {
    match verdict.kind {
        RuleKind::Success => Outcome::Success(verdict),
        RuleKind::Failure => Outcome::Failure(verdict),
    }
}

fn push_tail(tail: &Mutex<Tail>, text: &str) {
    if !text.is_empty() {
        tail.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text);
    }
}

/// A stream being classified.
pub struct Watch {
    settled: oneshot::Receiver<Outcome>,
    tail: Arc<Mutex<Tail>>,
}

impl Watch {
    /// Wait for the outcome, at most `deadline`.
    pub async fn settle(self, deadline: Duration) -> Classification {
        let outcome = match tokio::time::timeout(deadline, self.settled).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Outcome::StreamAborted("output pump stopped".into()),
            Err(_) => Outcome::Timeout,
        };
        let tail = self
            .tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_str()
            .to_owned();
        Classification { outcome, tail }
    }
}

/// First `http://` or `https://` URL in `text`.
pub fn find_url(text: &str) -> Option<String> {
    let start = ["http://", "https://"]
        .iter()
        .filter_map(|scheme| text.find(scheme))
        .min()?;
    let rest = text.get(start..)?;
    let end = rest
        .find(|c: char| c.is_whitespace() || c.is_control() || matches!(c, '"' | '\'' | '<' | '>'))
        .unwrap_or(rest.len());
    let url = rest
        .get(..end)?
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ')'));
    Some(url.to_owned())
}

#[cfg(test)]
mod tests {
    use std::io;

    use bytes::Bytes;
    use futures_util::stream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::RuleConfig;

    fn rules() -> RuleSet {
        RuleSet::new()
            .with(Rule::success("ready").unwrap())
            .with(Rule::failure("EADDRINUSE").unwrap())
    }

    fn recording_sink() -> (OutputSink, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: OutputSink = Arc::new(move |chunk: &[u8]| {
            sink_seen.lock().unwrap().extend_from_slice(chunk);
        });
        (sink, seen)
    }

    fn chunks(parts: &[&str]) -> OutputStream {
        let items: Vec<io::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        stream::iter(items).boxed()
    }

    #[test]
    fn failure_beats_later_success_across_chunks() {
        let mut matcher = Matcher::new(Arc::new(rules()));
        let mut first = None;
        for chunk in ["start", "ing up", "EADDRINUSE", "ready"] {
            let (_, verdict) = matcher.feed(chunk.as_bytes());
            if first.is_none() {
                first = verdict;
            }
        }
        let verdict = first.unwrap();
        assert_eq!(verdict.kind, RuleKind::Failure);
        assert_eq!(verdict.excerpt, "starting upEADDRINUSE");
    }

    #[test]
    fn failure_beats_success_in_same_chunk() {
        let verdict = rules().check("ready on :3000\nlisten EADDRINUSE").unwrap();
        assert_eq!(verdict.kind, RuleKind::Failure);
        assert_eq!(verdict.excerpt, "listen EADDRINUSE");
    }

    #[test]
    fn token_split_across_chunks_is_found() {
        let mut matcher = Matcher::new(Arc::new(rules()));
        assert!(matcher.feed(b"server re").1.is_none());
        let (_, verdict) = matcher.feed(b"ady\n");
        assert_eq!(verdict.unwrap().kind, RuleKind::Success);
    }

    #[test]
    fn success_waits_for_its_line_to_end() {
        let rules = RuleConfig::default().build().unwrap();
        let mut matcher = Matcher::new(Arc::new(rules));
        assert!(matcher.feed(b"  - Local:        http://localhost").1.is_none());
        let verdict = matcher.feed(b":5173/\n  - Network: use --host\n").1.unwrap();
        assert_eq!(verdict.kind, RuleKind::Success);
        assert_eq!(verdict.excerpt, "- Local:        http://localhost:5173/");
        assert_eq!(
            find_url(&verdict.excerpt).as_deref(),
            Some("http://localhost:5173/")
        );
    }

    #[test]
    fn failure_later_on_a_held_line_wins() {
        let mut matcher = Matcher::new(Arc::new(rules()));
        assert!(matcher.feed(b"ready? no: ").1.is_none());
        let verdict = matcher.feed(b"EADDRINUSE\n").1.unwrap();
        assert_eq!(verdict.kind, RuleKind::Failure);
        assert_eq!(verdict.excerpt, "ready? no: EADDRINUSE");
    }

    #[test]
    fn held_success_settles_at_end_of_stream() {
        let mut matcher = Matcher::new(Arc::new(rules()));
        assert!(matcher.feed(b"ready in 300 ms").1.is_none());
        let verdict = matcher.finish().1.unwrap();
        assert_eq!(verdict.kind, RuleKind::Success);
        assert_eq!(verdict.excerpt, "ready in 300 ms");
    }

    #[test]
    fn rules_do_not_span_lines() {
        let rules = RuleSet::new().with(Rule::success("ready now").unwrap());
        let mut matcher = Matcher::new(Arc::new(rules));
        assert!(matcher.feed(b"ready\n").1.is_none());
        assert!(matcher.feed(b" now\n").1.is_none());
    }

    #[test]
    fn multi_line_patterns_never_match() {
        let rules = RuleSet::new()
            .with(Rule::failure(r"Error\nat ").unwrap())
            .with(Rule::success(r"(?s)compiled\s+ready").unwrap());
        assert!(rules.check("Error\nat page.js:1\ncompiled\nready").is_none());

        let mut matcher = Matcher::new(Arc::new(rules));
        assert!(matcher.feed(b"compiled\n").1.is_none());
        assert!(matcher.feed(b"ready\n").1.is_none());
        assert!(matcher.finish().1.is_none());
    }

    #[test]
    fn carve_out_is_per_line() {
        let rules = RuleConfig::default().build().unwrap();
        assert!(rules.check("TS Error: Property 'x' does not exist").is_none());

        let verdict = rules
            .check("TS Error: ignored\nError: Cannot find module 'react'")
            .unwrap();
        assert_eq!(verdict.kind, RuleKind::Failure);
        assert_eq!(verdict.excerpt, "Error: Cannot find module 'react'");
    }

    #[test]
    fn default_success_markers() {
        let rules = RuleConfig::default().build().unwrap();
        for line in [
            "ready - started server on 0.0.0.0:3000",
            "  - Local:        http://localhost:3000",
            "started server on port 5173",
        ] {
            assert_eq!(rules.check(line).unwrap().kind, RuleKind::Success, "{line}");
        }
        assert!(rules.check("compiling...").is_none());
    }

    #[test]
    fn excerpt_is_trimmed_and_capped() {
        assert_eq!(excerpt("  Error: boom \r"), "Error: boom");
        let long = "x".repeat(EXCERPT_CHARS + 10);
        assert_eq!(excerpt(&long).chars().count(), EXCERPT_CHARS + 3);
    }

    #[test]
    fn decoder_holds_split_multibyte_sequence() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "✓ Ready".as_bytes();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..2]), "");
        assert_eq!(decoder.decode(&bytes[2..]), "✓ Ready");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(decoder.decode(b"\xe2\x9c"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn tail_keeps_last_bytes_on_char_boundary() {
        let mut tail = Tail::new(4);
        tail.push("abc");
        tail.push("déf");
        assert_eq!(tail.as_str(), "déf");
        tail.push("ghi");
        assert_eq!(tail.as_str(), "fghi");
    }

    #[test]
    fn urls() {
        assert_eq!(
            find_url("  - Local:        http://localhost:3000\x1b[39m").as_deref(),
            Some("http://localhost:3000")
        );
        assert_eq!(
            find_url("ready on https://example.test:8443/app.").as_deref(),
            Some("https://example.test:8443/app")
        );
        assert_eq!(find_url("no url here"), None);
    }

    #[tokio::test]
    async fn watch_settles_failure_and_forwards_everything() {
        let (sink, seen) = recording_sink();
        let classifier = Classifier::new(rules(), sink);

        let result = classifier
            .watch(chunks(&["start", "ing up", "EADDRINUSE", "ready"]))
            .settle(Duration::from_secs(5))
            .await;

        assert!(matches!(result.outcome, Outcome::Failure(ref v) if v.pattern == "EADDRINUSE"));
        // The pump keeps forwarding after settlement.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(&*seen.lock().unwrap(), b"starting upEADDRINUSEready");
    }

    #[tokio::test]
    async fn stream_error_is_aborted() {
        let (sink, _) = recording_sink();
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"compiling")),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
        ];
        let result = Classifier::new(rules(), sink)
            .watch(stream::iter(items).boxed())
            .settle(Duration::from_secs(5))
            .await;
        assert!(matches!(result.outcome, Outcome::StreamAborted(ref m) if m.contains("pipe closed")));
        assert_eq!(result.tail, "compiling");
    }

    #[tokio::test]
    async fn closed_without_match() {
        let (sink, _) = recording_sink();
        let result = Classifier::new(rules(), sink)
            .watch(chunks(&["npm ERR! missing script: dev\n"]))
            .settle(Duration::from_secs(5))
            .await;
        assert_eq!(result.outcome, Outcome::Closed);
        assert_eq!(result.tail, "npm ERR! missing script: dev\n");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_late_chunks_still_reach_sink() {
        let (sink, seen) = recording_sink();
        let (tx, rx) = mpsc::unbounded_channel::<io::Result<Bytes>>();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        let classifier = Classifier::new(rules(), sink);
        let watch = classifier.watch(stream);
        tx.send(Ok(Bytes::from_static(b"compiling...\n"))).unwrap();

        let result = watch.settle(Duration::from_secs(60)).await;
        assert_eq!(result.outcome, Outcome::Timeout);
        assert_eq!(result.tail, "compiling...\n");

        tx.send(Ok(Bytes::from_static(b"ready\n"))).unwrap();
        drop(tx);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(&*seen.lock().unwrap(), b"compiling...\nready\n");
        assert_eq!(result.outcome, Outcome::Timeout);
    }
}
