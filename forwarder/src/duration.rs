//! Go-style duration strings (`15s`, `1m30s`, `500ms`) for timeout
//! configuration values.

use std::{fmt, str::FromStr, time::Duration};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timeout(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("empty duration")]
    Empty,

    #[error("timeouts cannot be negative")]
    Negative,

    #[error("expected a number before {0:?}")]
    ExpectedNumber(String),

    #[error("invalid number {0:?}")]
    InvalidNumber(String),

    #[error("number {0:?} has no unit; {UNITS}")]
    MissingUnit(String),

    #[error("unknown unit {0:?}; {UNITS}")]
    UnknownUnit(String),
}

const UNITS: &str = "valid units are ns, us, ms, s, m, and h";

impl Timeout {
    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<Timeout> for Duration {
    fn from(Timeout(duration): Timeout) -> Self {
        duration
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

fn unit_nanos(unit: &str) -> Option<u64> {
    Some(match unit {
        "ns" => 1,
        // Accept both the micro sign and the Greek mu, like Go does.
        "us" | "\u{00b5}s" | "\u{03bc}s" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        "h" => 3_600 * 1_000_000_000,
        _ => return None,
    })
}

fn is_numeric(c: char) -> bool {
    c.is_ascii_digit() || c == '.'
}

impl FromStr for Timeout {
    type Err = ParseError;

    /// Parses a sequence of `<number><unit>` segments ("1m30s", "1.5s").
    /// A bare "0" needs no unit.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let s = input.trim();
        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        let s = s.strip_prefix('+').unwrap_or(s);
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s == "0" {
            return Ok(Self(Duration::ZERO));
        }

        let mut nanos = 0f64;
        let mut rest = s;
        while !rest.is_empty() {
            // Each segment is a run of digits (and at most one dot)
            // followed by a run of unit characters.
            let number_end = rest.find(|c| !is_numeric(c)).unwrap_or(rest.len());
            let (number, tail) = rest.split_at(number_end);
            if number.is_empty() {
                return Err(ParseError::ExpectedNumber(tail.to_string()));
            }
            let value: f64 = number
                .parse()
                .map_err(|_| ParseError::InvalidNumber(number.to_string()))?;
            if tail.is_empty() {
                return Err(ParseError::MissingUnit(number.to_string()));
            }

            let unit_end = tail.find(is_numeric).unwrap_or(tail.len());
            let (unit, next) = tail.split_at(unit_end);
            let scale =
                unit_nanos(unit).ok_or_else(|| ParseError::UnknownUnit(unit.to_string()))?;
            nanos += value * scale as f64;
            rest = next;
        }

        Ok(Self(Duration::from_nanos(nanos as u64)))
    }
}
