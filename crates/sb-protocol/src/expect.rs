//! Expect matching state machine
//!
//! [`ExpectMatcher`] is fed lines one at a time, in the order they were
//! received, and decides when an expect is complete. It does no I/O and
//! has no notion of time; the caller measures elapsed time and decides when
//! to stop feeding it.
//!
//! Each channel has its own search window holding the last
//! `max(search_window, 1)` lines received on it. Patterns are searched in the
//! concatenated window text, so a pattern may span several lines of the same
//! channel but never lines of different channels.
//!
//! Text outside the windows is kept for `before`, `after` and the transcript,
//! but only the newest [`MAX_TRANSCRIPT_BYTES`] of it.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use crate::pattern::{ExpectMode, ExpectSpec, Pattern};

/// Most output an expect keeps outside its search windows, per channel and
/// for the combined transcript
pub const MAX_TRANSCRIPT_BYTES: usize = 64 * 1024;

/// A successful match of one pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// Channel whose window matched
    pub channel: usize,
    /// Whole matched text
    pub matched: String,
    /// Positional capture groups (group 1 onward); `None` for groups that did not participate
    pub groups: Vec<Option<String>>,
    /// Named capture groups that participated
    pub named_groups: BTreeMap<String, String>,
    /// The line whose arrival completed the match
    pub line: String,
}

/// Outcome for one pattern of an expect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternOutcome {
    /// Pattern text
    pub pattern: String,
    /// Match details, if the pattern matched
    pub matched: Option<PatternMatch>,
}

/// Why an expect stopped before its timeout without completing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptReason {
    /// The channel was closed
    Closed,
    /// The channel faulted
    Faulted(String),
}

/// A target channel went away while an expect was waiting on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interruption {
    /// Channel that went away
    pub channel: usize,
    /// What happened to it
    pub reason: InterruptReason,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            InterruptReason::Closed => write!(f, "channel {} closed", self.channel),
            InterruptReason::Faulted(why) => write!(f, "channel {} faulted: {}", self.channel, why),
        }
    }
}

/// Result of an expect call
///
/// A timeout is a normal outcome: `timed_out` is set and whatever matched
/// before the deadline is reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectResult {
    /// Combination mode the expect ran with
    pub mode: ExpectMode,
    /// Per-pattern outcome, in declaration order
    pub outcomes: Vec<PatternOutcome>,
    /// Pattern that completed the expect, or the last one that matched on timeout
    pub index: Option<usize>,
    /// Patterns that never matched
    pub remaining: Vec<String>,
    /// Channel output up to the deciding match (everything received on timeout)
    pub before: String,
    /// Channel output from the deciding match onward; `None` on timeout
    pub after: Option<String>,
    /// Lines the expect accepted, in arrival order; only the newest
    /// [`MAX_TRANSCRIPT_BYTES`] are kept
    pub transcript: String,
    /// Time spent waiting
    pub elapsed: Duration,
    /// The expect did not complete
    pub timed_out: bool,
    /// Set when a target channel closed or faulted mid-expect
    pub interruption: Option<Interruption>,
}

impl ExpectResult {
    /// Whether the expect completed
    pub fn matched(&self) -> bool {
        !self.timed_out
    }

    /// Match details for pattern `index`
    pub fn match_for(&self, index: usize) -> Option<&PatternMatch> {
        self.outcomes.get(index)?.matched.as_ref()
    }

    /// The deciding match, if any
    pub fn deciding_match(&self) -> Option<&PatternMatch> {
        self.match_for(self.index?)
    }

    /// Capture groups of the deciding match (empty when nothing matched)
    pub fn groups(&self) -> Vec<Option<&str>> {
        self.deciding_match()
            .map(|m| m.groups.iter().map(|g| g.as_deref()).collect())
            .unwrap_or_default()
    }

    /// Group `n` of the deciding match; 0 is the whole match
    pub fn group(&self, n: usize) -> Option<&str> {
        let m = self.deciding_match()?;
        match n {
            0 => Some(m.matched.as_str()),
            n => m.groups.get(n - 1)?.as_deref(),
        }
    }

    /// Every match, in declaration order of the patterns
    pub fn matches(&self) -> impl Iterator<Item = &PatternMatch> {
        self.outcomes.iter().filter_map(|o| o.matched.as_ref())
    }
}

impl fmt::Display for ExpectResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out {
            write!(
                f,
                "not matched, timed out after {:.1}s waiting for [{}]",
                self.elapsed.as_secs_f64(),
                self.remaining.join(", ")
            )?;
            if let Some(interruption) = &self.interruption {
                write!(f, " ({})", interruption)?;
            }
            Ok(())
        } else {
            write!(
                f,
                "mode {} matched pattern {} in {:.3}s",
                self.mode,
                self.index.unwrap_or_default(),
                self.elapsed.as_secs_f64()
            )
        }
    }
}

/// Progress report after feeding a line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchStep {
    /// Patterns that matched on this line, in the order they matched
    pub newly_matched: Vec<usize>,
    /// The expect is now complete
    pub complete: bool,
}

/// Accumulated output of one channel
///
/// Offsets are absolute: they count every byte the channel ever delivered,
/// including bytes already dropped from the front of `text`.
#[derive(Debug, Default)]
struct ChannelView {
    text: String,
    dropped: usize,
    line_starts: VecDeque<usize>,
    trimmed_to: usize,
}

impl ChannelView {
    fn push(&mut self, line: &str, capacity: usize) {
        self.line_starts.push_back(self.dropped + self.text.len());
        self.text.push_str(line);
        while self.line_starts.len() > capacity {
            self.line_starts.pop_front();
        }

        // Never drop into the window
        let keep_from = self.window_start() - self.dropped;
        let excess = self.text.len().saturating_sub(MAX_TRANSCRIPT_BYTES);
        let cut = char_boundary(&self.text, excess.min(keep_from));
        if cut > 0 {
            self.text.drain(..cut);
            self.dropped += cut;
        }
    }

    fn window_start(&self) -> usize {
        let first_line = self.line_starts.front().copied().unwrap_or(self.dropped);
        first_line.max(self.trimmed_to)
    }

    fn window(&self) -> &str {
        &self.text[self.window_start() - self.dropped..]
    }

    /// Text before and from absolute offset `at`
    fn split_at(&self, at: usize) -> (&str, &str) {
        let at = at.saturating_sub(self.dropped).min(self.text.len());
        self.text.split_at(at)
    }
}

/// First char boundary at or after `at`
fn char_boundary(text: &str, at: usize) -> usize {
    (at..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(text.len())
}

/// Keep only the newest [`MAX_TRANSCRIPT_BYTES`] of `text`
fn cap_transcript(text: &mut String) {
    let excess = text.len().saturating_sub(MAX_TRANSCRIPT_BYTES);
    if excess > 0 {
        let cut = char_boundary(text, excess);
        text.drain(..cut);
    }
}

/// Line-driven expect state machine
#[derive(Debug)]
pub struct ExpectMatcher {
    patterns: Vec<Pattern>,
    mode: ExpectMode,
    capacity: usize,
    views: BTreeMap<usize, ChannelView>,
    transcript: String,
    outcomes: Vec<Option<PatternMatch>>,
    matched_count: usize,
    last_index: Option<usize>,
    deciding: Option<(usize, usize)>,
    complete: bool,
}

impl ExpectMatcher {
    /// Start matching for `spec`
    pub fn new(spec: &ExpectSpec) -> Self {
        Self {
            patterns: spec.patterns.clone(),
            mode: spec.mode,
            capacity: spec.search_window.max(1),
            views: BTreeMap::new(),
            transcript: String::new(),
            outcomes: vec![None; spec.patterns.len()],
            matched_count: 0,
            last_index: None,
            deciding: None,
            complete: false,
        }
    }

    /// Whether the expect has completed
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Patterns that have not matched yet
    pub fn remaining(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .zip(&self.patterns)
            .filter(|(o, _)| o.is_none())
            .map(|(_, p)| p.as_str().to_string())
            .collect()
    }

    /// Feed the next accepted line from `channel`
    ///
    /// Lines fed after completion are ignored.
    pub fn feed(&mut self, channel: usize, line: &str) -> MatchStep {
        let mut step = MatchStep::default();
        if self.complete {
            step.complete = true;
            return step;
        }

        self.transcript.push_str(line);
        cap_transcript(&mut self.transcript);
        let capacity = self.capacity;
        self.views
            .entry(channel)
            .or_default()
            .push(line, capacity);

        match self.mode {
            ExpectMode::Any => self.feed_any(channel, line, &mut step),
            ExpectMode::All => self.feed_all(channel, line, &mut step),
            ExpectMode::Sequential => self.feed_sequential(channel, line, &mut step),
        }

        self.complete = match self.mode {
            ExpectMode::Any => self.matched_count > 0,
            ExpectMode::All | ExpectMode::Sequential => self.matched_count == self.patterns.len(),
        };
        step.complete = self.complete;
        step
    }

    fn feed_any(&mut self, channel: usize, line: &str, step: &mut MatchStep) {
        let Some(view) = self.views.get(&channel) else {
            return;
        };
        let start = view.window_start();
        let found = self.patterns.iter().enumerate().find_map(|(i, p)| {
            let caps = p.regex().captures(view.window())?;
            Some((i, capture(p, channel, line, &caps), caps.get(0)?.start()))
        });
        if let Some((i, m, at)) = found {
            self.record(i, m, (channel, start + at), step);
        }
    }

    fn feed_all(&mut self, channel: usize, line: &str, step: &mut MatchStep) {
        let Some(view) = self.views.get(&channel) else {
            return;
        };
        let start = view.window_start();
        let window = view.window();
        let mut found = Vec::new();
        for (i, p) in self.patterns.iter().enumerate() {
            if self.outcomes[i].is_some() {
                continue;
            }
            if let Some(caps) = p.regex().captures(window) {
                let at = caps.get(0).map_or(0, |m| m.start());
                found.push((i, capture(p, channel, line, &caps), start + at));
            }
        }
        for (i, m, at) in found {
            self.record(i, m, (channel, at), step);
        }
    }

    fn feed_sequential(&mut self, channel: usize, line: &str, step: &mut MatchStep) {
        while self.matched_count < self.patterns.len() {
            let next = self.matched_count;
            let Some(view) = self.views.get_mut(&channel) else {
                return;
            };
            let start = view.window_start();
            let Some(caps) = self.patterns[next].regex().captures(view.window()) else {
                return;
            };
            let Some(whole) = caps.get(0) else {
                return;
            };
            let m = capture(&self.patterns[next], channel, line, &caps);
            let (at, end) = (start + whole.start(), start + whole.end());
            view.trimmed_to = end;
            self.record(next, m, (channel, at), step);
        }
    }

    fn record(&mut self, index: usize, m: PatternMatch, at: (usize, usize), step: &mut MatchStep) {
        tracing::trace!(
            "pattern {} matched on channel {}: {:?}",
            index,
            m.channel,
            m.matched
        );
        self.outcomes[index] = Some(m);
        self.matched_count += 1;
        self.last_index = Some(index);
        self.deciding = Some(at);
        step.newly_matched.push(index);
    }

    /// Produce the result
    ///
    /// `timed_out` is forced on when the expect had not completed.
    pub fn finish(self, elapsed: Duration, interruption: Option<Interruption>) -> ExpectResult {
        let remaining = self.remaining();
        let timed_out = !self.complete;

        let (before, after) = match (timed_out, self.deciding) {
            (false, Some((channel, at))) => {
                let (before, after) = self
                    .views
                    .get(&channel)
                    .map(|v| v.split_at(at))
                    .unwrap_or_default();
                (before.to_string(), Some(after.to_string()))
            }
            _ => (self.transcript.clone(), None),
        };

        let outcomes = self
            .patterns
            .iter()
            .zip(self.outcomes)
            .map(|(p, matched)| PatternOutcome {
                pattern: p.as_str().to_string(),
                matched,
            })
            .collect();

        ExpectResult {
            mode: self.mode,
            outcomes,
            index: self.last_index,
            remaining,
            before,
            after,
            transcript: self.transcript,
            elapsed,
            timed_out,
            interruption: if timed_out { interruption } else { None },
        }
    }
}

fn capture(pattern: &Pattern, channel: usize, line: &str, caps: &regex::Captures<'_>) -> PatternMatch {
    let groups = caps
        .iter()
        .skip(1)
        .map(|g| g.map(|g| g.as_str().to_string()))
        .collect();
    let named_groups = pattern
        .named_groups()
        .into_iter()
        .filter_map(|name| Some((name.to_string(), caps.name(name)?.as_str().to_string())))
        .collect();
    PatternMatch {
        channel,
        matched: caps
            .get(0)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
        groups,
        named_groups,
        line: line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(patterns: &[&str], mode: ExpectMode) -> ExpectSpec {
        ExpectSpec::new(patterns).unwrap().mode(mode).channels([0, 1])
    }

    #[test]
    fn test_return_code_spans_lines() {
        let mut m = ExpectMatcher::new(&spec(&[r"(.*)Return Code: (\d+)"], ExpectMode::Any));
        assert!(!m.feed(0, "foo\n").complete);
        let step = m.feed(0, "Return Code: 0\n");
        assert!(step.complete);
        assert_eq!(step.newly_matched, vec![0]);

        let result = m.finish(Duration::from_millis(5), None);
        assert!(!result.timed_out);
        assert_eq!(result.groups(), vec![Some("foo\n"), Some("0")]);
        assert_eq!(result.group(2), Some("0"));
        assert_eq!(result.before, "");
        assert_eq!(result.after.as_deref(), Some("foo\nReturn Code: 0\n"));
    }

    #[test]
    fn test_any_first_declared_wins() {
        let mut m = ExpectMatcher::new(&spec(&["ok", "o"], ExpectMode::Any));
        let step = m.feed(0, "ok\n");
        assert_eq!(step.newly_matched, vec![0]);
        let result = m.finish(Duration::ZERO, None);
        assert_eq!(result.index, Some(0));
        assert_eq!(result.remaining, vec!["o".to_string()]);
    }

    #[test]
    fn test_all_tests_every_pattern_on_same_line() {
        let mut m = ExpectMatcher::new(&spec(&["alpha", "beta", "gamma"], ExpectMode::All));
        let step = m.feed(0, "alpha beta\n");
        assert_eq!(step.newly_matched, vec![0, 1]);
        assert!(!step.complete);
        let step = m.feed(1, "gamma\n");
        assert!(step.complete);

        let result = m.finish(Duration::ZERO, None);
        assert_eq!(result.match_for(0).unwrap().channel, 0);
        assert_eq!(result.match_for(2).unwrap().channel, 1);
        assert!(result.remaining.is_empty());
    }

    #[test]
    fn test_all_partial_on_timeout() {
        let mut m = ExpectMatcher::new(&spec(&["alpha", "beta"], ExpectMode::All));
        m.feed(0, "alpha\n");
        let result = m.finish(Duration::from_secs(1), None);
        assert!(result.timed_out);
        assert!(result.match_for(0).is_some());
        assert!(result.match_for(1).is_none());
        assert_eq!(result.remaining, vec!["beta".to_string()]);
        assert_eq!(result.index, Some(0));
        assert_eq!(result.after, None);
        assert_eq!(result.before, "alpha\n");
    }

    #[test]
    fn test_sequential_requires_order() {
        let mut m = ExpectMatcher::new(&spec(&["first", "second"], ExpectMode::Sequential));
        assert!(m.feed(0, "second\n").newly_matched.is_empty());
        assert_eq!(m.feed(0, "first\n").newly_matched, vec![0]);
        // "second" above is before the trim point and cannot satisfy stage 2
        assert!(!m.is_complete());
        assert!(m.feed(0, "second\n").complete);
    }

    #[test]
    fn test_sequential_same_line_pipeline() {
        let mut m = ExpectMatcher::new(&spec(&["a", "b", "c"], ExpectMode::Sequential));
        let step = m.feed(0, "a b c\n");
        assert_eq!(step.newly_matched, vec![0, 1, 2]);
        assert!(step.complete);
    }

    #[test]
    fn test_zero_window_sees_newest_line_only() {
        let spec = ExpectSpec::new([r"foo.*bar"]).unwrap().search_window(0);
        let mut m = ExpectMatcher::new(&spec);
        m.feed(0, "foo\n");
        assert!(!m.feed(0, "bar\n").complete);
        assert!(m.feed(0, "foo bar\n").complete);
    }

    #[test]
    fn test_window_bounds_history() {
        let spec = ExpectSpec::new([r"one.*three"]).unwrap().search_window(2);
        let mut m = ExpectMatcher::new(&spec);
        m.feed(0, "one\n");
        m.feed(0, "two\n");
        assert!(!m.feed(0, "three\n").complete);
    }

    #[test]
    fn test_windows_are_per_channel() {
        let mut m = ExpectMatcher::new(&spec(&[r"foo\nbar"], ExpectMode::Any));
        m.feed(0, "foo\n");
        assert!(!m.feed(1, "bar\n").complete);
        assert!(m.feed(0, "bar\n").complete);
    }

    #[test]
    fn test_lines_after_completion_ignored() {
        let mut m = ExpectMatcher::new(&spec(&["x"], ExpectMode::Any));
        m.feed(0, "x\n");
        m.feed(0, "y\n");
        let result = m.finish(Duration::ZERO, None);
        assert_eq!(result.transcript, "x\n");
    }

    #[test]
    fn test_interruption_only_kept_on_timeout() {
        let mut m = ExpectMatcher::new(&spec(&["x"], ExpectMode::Any));
        m.feed(0, "x\n");
        let result = m.finish(
            Duration::ZERO,
            Some(Interruption {
                channel: 0,
                reason: InterruptReason::Closed,
            }),
        );
        assert!(result.interruption.is_none());
    }

    #[test]
    fn test_named_groups_captured() {
        let mut m = ExpectMatcher::new(&spec(&[r"rc=(?P<rc>\d+)"], ExpectMode::Any));
        m.feed(0, "rc=7\n");
        let result = m.finish(Duration::ZERO, None);
        let found = result.deciding_match().unwrap();
        assert_eq!(found.named_groups.get("rc").map(String::as_str), Some("7"));
        assert_eq!(found.line, "rc=7\n");
    }

    #[test]
    fn test_timeout_display() {
        let m = ExpectMatcher::new(&spec(&["never"], ExpectMode::Any));
        let result = m.finish(Duration::from_secs(1), None);
        assert_eq!(
            result.to_string(),
            "not matched, timed out after 1.0s waiting for [never]"
        );
        assert!(result.groups().is_empty());
    }

    #[test]
    fn test_long_expect_keeps_bounded_output() {
        let mut m = ExpectMatcher::new(&spec(&[r"done (\d+)"], ExpectMode::Any));
        let noise = format!("{}\n", "x".repeat(99));
        for _ in 0..5000 {
            assert!(!m.feed(0, &noise).complete);
        }
        assert!(m.feed(0, "done 7\n").complete);

        let result = m.finish(Duration::ZERO, None);
        assert_eq!(result.group(1), Some("7"));
        assert_eq!(result.after.as_deref(), Some("done 7\n"));
        assert!(result.before.len() <= MAX_TRANSCRIPT_BYTES);
        assert!(result.before.ends_with(&noise));
        assert!(result.transcript.len() <= MAX_TRANSCRIPT_BYTES);
        assert!(result.transcript.ends_with("done 7\n"));
    }

    #[test]
    fn test_timeout_transcript_is_newest_output() {
        let mut m = ExpectMatcher::new(&spec(&["never"], ExpectMode::Any));
        for i in 0..20_000 {
            m.feed(0, &format!("line {:05} é\n", i));
        }
        let result = m.finish(Duration::from_secs(1), None);
        assert!(result.before.len() <= MAX_TRANSCRIPT_BYTES);
        assert!(result.before.ends_with("line 19999 é\n"));
        assert!(!result.before.contains("line 00000"));
    }
}
