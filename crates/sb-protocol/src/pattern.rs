//! Expect patterns and the parameters of a single expect call

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::classify::LineFilter;
use crate::error::ProtocolError;

/// Default number of trailing lines per channel an expect searches
pub const DEFAULT_SEARCH_WINDOW: usize = 64;

/// Default expect timeout
pub const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A compiled expect pattern
///
/// Patterns are compiled with `.` matching newlines and `^`/`$` matching at
/// line boundaries, since the search window spans several lines.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a pattern
    pub fn new(source: &str) -> Result<Self, ProtocolError> {
        let regex = RegexBuilder::new(source)
            .dot_matches_new_line(true)
            .multi_line(true)
            .build()
            .map_err(|e| ProtocolError::InvalidPattern {
                pattern: source.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    /// The pattern text as supplied
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The compiled regex
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Names of the named capture groups, in declaration order
    pub fn named_groups(&self) -> Vec<&str> {
        self.regex.capture_names().flatten().collect()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.source)
    }
}

impl FromStr for Pattern {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pattern::new(s)
    }
}

/// How the patterns of an expect combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectMode {
    /// The first pattern to match ends the expect
    #[default]
    Any,
    /// Every pattern must match at least once, in any order
    All,
    /// Patterns must match one after another, in declaration order
    Sequential,
}

impl fmt::Display for ExpectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectMode::Any => write!(f, "any"),
            ExpectMode::All => write!(f, "all"),
            ExpectMode::Sequential => write!(f, "sequential"),
        }
    }
}

/// Everything an expect call needs to know
///
/// ```
/// use std::time::Duration;
/// use sb_protocol::{ExpectMode, ExpectSpec};
///
/// let spec = ExpectSpec::new([r"login:", r"\$ $"])
///     .unwrap()
///     .mode(ExpectMode::Sequential)
///     .timeout(Duration::from_secs(5));
/// assert_eq!(spec.patterns.len(), 2);
/// assert_eq!(spec.channels, vec![0]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectSpec {
    /// Patterns in declaration order
    pub patterns: Vec<Pattern>,
    /// Target channel indices, ascending and without duplicates
    pub channels: Vec<usize>,
    /// Combination mode
    pub mode: ExpectMode,
    /// How long to wait before giving up
    pub timeout: Duration,
    /// Trailing lines per channel considered when matching; 0 means newest line only
    pub search_window: usize,
    /// Which line kinds are eligible
    pub line_filter: LineFilter,
}

impl ExpectSpec {
    /// Compile `patterns` into a spec targeting channel 0
    pub fn new<I, S>(patterns: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Pattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_patterns(patterns)
    }

    /// Build a spec from already compiled patterns
    pub fn from_patterns(patterns: Vec<Pattern>) -> Result<Self, ProtocolError> {
        if patterns.is_empty() {
            return Err(ProtocolError::EmptyPatternList);
        }
        Ok(Self {
            patterns,
            channels: vec![0],
            mode: ExpectMode::default(),
            timeout: DEFAULT_EXPECT_TIMEOUT,
            search_window: DEFAULT_SEARCH_WINDOW,
            line_filter: LineFilter::default(),
        })
    }

    /// Target a single channel
    pub fn channel(self, channel: usize) -> Self {
        self.channels([channel])
    }

    /// Target several channels
    pub fn channels(mut self, channels: impl IntoIterator<Item = usize>) -> Self {
        let mut channels: Vec<usize> = channels.into_iter().collect();
        channels.sort_unstable();
        channels.dedup();
        self.channels = channels;
        self
    }

    /// Set the combination mode
    pub fn mode(mut self, mode: ExpectMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-channel search window, in lines
    pub fn search_window(mut self, lines: usize) -> Self {
        self.search_window = lines;
        self
    }

    /// Set which line kinds are eligible
    pub fn line_filter(mut self, filter: LineFilter) -> Self {
        self.line_filter = filter;
        self
    }

    /// Check the spec can be run
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.patterns.is_empty() {
            return Err(ProtocolError::EmptyPatternList);
        }
        if self.channels.is_empty() {
            return Err(ProtocolError::EmptyChannelSet);
        }
        Ok(())
    }
}
