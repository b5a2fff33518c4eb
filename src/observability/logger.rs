//! Structured JSON logging
//!
//! One log line per event, synchronous, deterministic field ordering:
//! `event` first, then `severity`, then the remaining fields sorted by
//! key. Warnings and above go to stderr so operational problems are
//! visible even when stdout is piped away.

use std::fmt;
use std::io::{self, Write};

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Trace,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Synchronous structured logger.
pub struct Logger;

impl Logger {
    /// Emits one event with the given fields.
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        let line = Self::render(severity, event, fields);
        if severity >= Severity::Warn {
            let _ = writeln!(io::stderr(), "{}", line);
        } else {
            let _ = writeln!(io::stdout(), "{}", line);
        }
    }

    fn render(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
        let mut out = String::with_capacity(128);
        out.push_str("{\"event\":\"");
        escape_into(&mut out, event);
        out.push_str("\",\"severity\":\"");
        out.push_str(severity.as_str());
        out.push('"');

        let mut sorted: Vec<&(&str, &str)> = fields.iter().collect();
        sorted.sort_by_key(|(key, _)| *key);
        for (key, value) in sorted {
            out.push_str(",\"");
            escape_into(&mut out, key);
            out.push_str("\":\"");
            escape_into(&mut out, value);
            out.push('"');
        }
        out.push('}');
        out
    }
}

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_and_severity_lead_the_line() {
        let line = Logger::render(Severity::Info, "store_opened", &[("path", "/tmp/idx")]);
        assert!(line.starts_with("{\"event\":\"store_opened\",\"severity\":\"INFO\""));
        assert!(line.contains("\"path\":\"/tmp/idx\""));
    }

    #[test]
    fn fields_are_sorted_for_determinism() {
        let line = Logger::render(Severity::Info, "e", &[("z", "1"), ("a", "2")]);
        let z = line.find("\"z\"").unwrap();
        let a = line.find("\"a\"").unwrap();
        assert!(a < z);
    }

    #[test]
    fn special_characters_are_escaped() {
        let line = Logger::render(Severity::Warn, "e", &[("msg", "line\n\"quoted\"")]);
        assert!(line.contains("line\\n\\\"quoted\\\""));
        assert!(serde_json::from_str::<serde_json::Value>(&line).is_ok());
    }
}
