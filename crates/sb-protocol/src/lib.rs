//! Switchboard Protocol Library
//!
//! Pure, synchronous building blocks shared by the switchboard runtime:
//!
//! - **Framing**: split raw channel bytes into lines ([`LineBuffer`], [`Framer`])
//! - **Classification**: tag lines as responses, logs or unknown ([`LineClassifier`])
//! - **Expect**: patterns, expect parameters and the matching state machine
//!   ([`Pattern`], [`ExpectSpec`], [`ExpectMatcher`], [`ExpectResult`])
//! - **Event filters**: named regex rules producing [`LogEvent`]s ([`LogEventFilter`])
//!
//! Nothing in this crate performs I/O except loading filter files.
//!
//! # Example
//!
//! ```rust
//! use sb_protocol::{ExpectMatcher, ExpectSpec, LineBuffer};
//! use std::time::Duration;
//!
//! let spec = ExpectSpec::new([r"(.*)Return Code: (\d+)"]).unwrap();
//! let mut matcher = ExpectMatcher::new(&spec);
//! let mut lines = LineBuffer::default();
//!
//! lines.push_bytes(b"foo\nReturn Code: 0\n");
//! while let Some(line) = lines.next_line() {
//!     matcher.feed(0, &line.text);
//! }
//!
//! let result = matcher.finish(Duration::ZERO, None);
//! assert!(!result.timed_out);
//! assert_eq!(result.groups(), vec![Some("foo\n"), Some("0")]);
//! ```

pub mod classify;
pub mod error;
pub mod expect;
pub mod filter;
pub mod framing;
pub mod log_line;
pub mod pattern;

pub use classify::{
    AllLog, AllResponse, AllUnknown, LineClassifier, LineFilter, LineKind, Multiport, PortLog,
    RegexLog, RegexResponse,
};
pub use error::ProtocolError;
pub use expect::{
    ExpectMatcher, ExpectResult, InterruptReason, Interruption, MatchStep, PatternMatch,
    PatternOutcome, MAX_TRANSCRIPT_BYTES,
};
pub use filter::{FilterEntry, FilterFile, FilterSet, FilterVersion, LogEventFilter};
pub use framing::{FramedLine, Framer, LineBuffer};
pub use log_line::{LogEvent, LogLine, LogSource, NO_EOL_MARKER, TIMESTAMP_FORMAT};
pub use pattern::{
    ExpectMode, ExpectSpec, Pattern, DEFAULT_EXPECT_TIMEOUT, DEFAULT_SEARCH_WINDOW,
};
