//! Per-session transcript
//!
//! Every line lands in the transcript returned as
//! [`super::SessionResult::message`] and is forwarded to the `log` facade.
//! While the pause window is open, forwarding is held back: a frozen thread
//! may own the logger's lock, so the patching thread only appends to a buffer
//! reserved in advance and flushes once every thread runs again. A held line
//! that does not fit the reservation is dropped and counted rather than
//! growing the buffer.

use log::info;
use std::fmt;
use std::time::{Duration, Instant};

/// Lines reserved beyond one per patched function
const HELD_BASE_LINES: usize = 8;

/// Bytes reserved per held line
const HELD_LINE_BYTES: usize = 256;

/// Writes into a `String` without ever growing it
struct Bounded<'a>(&'a mut String);

impl fmt::Write for Bounded<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.0.len() + s.len() > self.0.capacity() {
            return Err(fmt::Error);
        }
        self.0.push_str(s);
        Ok(())
    }
}

fn write_line(out: &mut impl fmt::Write, elapsed: Duration, args: fmt::Arguments<'_>) -> fmt::Result {
    write!(out, "[hotfix] +{}.{:03}s ", elapsed.as_secs(), elapsed.subsec_millis())?;
    out.write_fmt(args)?;
    out.write_char('\n')
}

#[derive(Debug)]
pub struct SessionLog {
    start: Instant,
    text: String,
    held: bool,
    /// Byte offset of the first line not yet forwarded
    forwarded: usize,
    /// Lines that did not fit while held
    dropped: usize,
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLog {
    #[must_use]
    pub fn new() -> Self {
        Self { start: Instant::now(), text: String::new(), held: false, forwarded: 0, dropped: 0 }
    }

    /// Append one line; use through [`session_log!`](crate::session_log)
    pub fn record(&mut self, args: fmt::Arguments<'_>) {
        let line_start = self.text.len();
        let elapsed = self.start.elapsed();

        if self.held {
            if write_line(&mut Bounded(&mut self.text), elapsed, args).is_err() {
                self.text.truncate(line_start);
                self.dropped += 1;
            }
            return;
        }

        // Writing into a String cannot fail
        let _ = write_line(&mut self.text, elapsed, args);
        info!("{}", self.text[line_start..].trim_end());
        self.forwarded = self.text.len();
    }

    /// Stop forwarding and reserve room for `lines` lines plus a few more
    ///
    /// Nothing recorded until [`release`](Self::release) allocates.
    pub fn hold(&mut self, lines: usize) {
        self.text.reserve((lines + HELD_BASE_LINES) * HELD_LINE_BYTES);
        self.held = true;
        self.dropped = 0;
    }

    /// Forward everything recorded while held; no-op when not held
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        for line in self.text[self.forwarded..].lines() {
            info!("{line}");
        }
        self.forwarded = self.text.len();

        let dropped = std::mem::take(&mut self.dropped);
        if dropped > 0 {
            self.record(format_args!("{dropped} lines dropped while paused"));
        }
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Final transcript without the trailing newline
    #[must_use]
    pub fn into_message(mut self) -> String {
        self.release();
        let len = self.text.trim_end().len();
        self.text.truncate(len);
        self.text
    }
}

/// `format!`-style line into a [`SessionLog`]
#[macro_export]
macro_rules! session_log {
    ($log:expr, $($arg:tt)+) => {
        $log.record(format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_prefixed() {
        let mut log = SessionLog::new();
        session_log!(log, "loading main image ...");
        session_log!(log, "found {} functions", 3);

        let message = log.into_message();
        let lines: Vec<&str> = message.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[hotfix] +0."));
        assert!(lines[0].ends_with("loading main image ..."));
        assert!(lines[1].ends_with("found 3 functions"));
    }

    #[test]
    fn test_held_lines_stay_in_transcript() {
        let mut log = SessionLog::new();
        session_log!(log, "before");
        let before = log.as_str().len();
        log.hold(1);
        assert!(log.is_held());
        session_log!(log, "inside window");
        assert_eq!(log.forwarded, before);
        log.release();
        assert!(!log.is_held());
        assert_eq!(log.forwarded, log.as_str().len());
        assert!(log.into_message().ends_with("inside window"));
    }

    fn patched_line(log: &mut SessionLog, i: u64) {
        session_log!(
            log,
            "patched pkg.(*Widget).Method{i}: {:#x} -> {:#x}",
            0x0040_1000 + i * 0x40,
            0x7f00_0000_1000 + i * 0x40
        );
    }

    #[test]
    fn test_held_lines_never_grow_buffer() {
        let mut log = SessionLog::new();
        session_log!(log, "apply patch ...");
        log.hold(0);
        let capacity = log.as_str().len() + (HELD_BASE_LINES * HELD_LINE_BYTES);
        let reserved = log.text.capacity();
        assert!(reserved >= capacity);

        for i in 0..200 {
            patched_line(&mut log, i);
        }
        assert_eq!(log.text.capacity(), reserved);
        assert!(log.dropped > 0);
        assert!(log.as_str().ends_with('\n'));

        let dropped = log.dropped;
        log.release();
        let message = log.into_message();
        assert!(message.ends_with(&format!("{dropped} lines dropped while paused")));
        assert!(message.contains("Method0:"));
        assert!(!message.contains("Method199:"));
    }

    #[test]
    fn test_hold_sized_from_line_count() {
        let mut log = SessionLog::new();
        log.hold(200);
        let reserved = log.text.capacity();
        for i in 0..200 {
            patched_line(&mut log, i);
        }
        assert_eq!(log.text.capacity(), reserved);
        assert_eq!(log.dropped, 0);
        log.release();

        let message = log.into_message();
        assert_eq!(message.lines().count(), 200);
        assert!(!message.contains("dropped"));
    }

    #[test]
    fn test_release_without_hold() {
        let mut log = SessionLog::new();
        log.release();
        assert_eq!(log.into_message(), "");
    }
}
