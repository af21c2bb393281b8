//! Assertion evaluation against a received response.

use crate::duration::{format_duration, parse_duration};
use crate::http::HttpResponse;
use crate::json_path;
use crate::model::{Assertion, AssertionKind, AssertionResult};
use regex::Regex;
use std::cmp::Ordering;

/// What a single comparison produced before `negate` is applied.
enum Outcome {
    Compared { passed: bool, actual: String },
    /// The expectation itself is unusable; fails regardless of `negate`.
    Invalid { actual: String, reason: String },
}

/// Evaluate one assertion. Never fails: malformed expectations yield a
/// failed [`AssertionResult`] with an explanatory message.
pub fn evaluate(assertion: &Assertion, response: &HttpResponse) -> AssertionResult {
    let expected = assertion.expected.as_str();
    let outcome = match assertion.kind {
        AssertionKind::Status => check_status(expected, response.status),
        AssertionKind::Contains => Outcome::Compared {
            passed: contains_bytes(&response.body, expected.as_bytes()),
            actual: summarize(response),
        },
        AssertionKind::NotContains => Outcome::Compared {
            passed: !contains_bytes(&response.body, expected.as_bytes()),
            actual: summarize(response),
        },
        AssertionKind::Regex => check_regex(expected, response),
        AssertionKind::JsonPath => {
            let actual = json_path::lookup_str(&response.text(), &assertion.target);
            Outcome::Compared {
                passed: actual.as_deref() == Some(expected),
                actual: actual.unwrap_or_else(|| "<missing>".to_string()),
            }
        }
        AssertionKind::Header => {
            let actual = response.header(&assertion.target);
            Outcome::Compared {
                passed: actual == Some(expected),
                actual: actual.unwrap_or("<missing>").to_string(),
            }
        }
        AssertionKind::Length => check_length(expected, response.body.len()),
        AssertionKind::Time => match parse_duration(expected) {
            Ok(limit) => Outcome::Compared {
                passed: response.duration <= limit,
                actual: format_duration(response.duration),
            },
            Err(e) => Outcome::Invalid {
                actual: format_duration(response.duration),
                reason: e.to_string(),
            },
        },
    };

    let (passed, actual, failure) = match outcome {
        Outcome::Compared { passed, actual } => {
            let passed = passed != assertion.negate;
            (passed, actual, None)
        }
        Outcome::Invalid { actual, reason } => (false, actual, Some(reason)),
    };

    let message = if passed {
        None
    } else {
        Some(
            assertion
                .message
                .clone()
                .or(failure)
                .unwrap_or_else(|| default_message(assertion, &actual)),
        )
    };

    AssertionResult {
        kind: assertion.kind,
        target: assertion.target.clone(),
        expected: assertion.expected.clone(),
        actual,
        passed,
        message,
    }
}

/// Evaluate every assertion; none short-circuits.
pub fn evaluate_all(assertions: &[Assertion], response: &HttpResponse) -> Vec<AssertionResult> {
    assertions
        .iter()
        .map(|assertion| evaluate(assertion, response))
        .collect()
}

fn default_message(assertion: &Assertion, actual: &str) -> String {
    let subject = match assertion.kind {
        AssertionKind::Status => "status".to_string(),
        AssertionKind::Contains | AssertionKind::NotContains | AssertionKind::Regex => {
            format!("body ({})", assertion.kind)
        }
        AssertionKind::JsonPath => format!("jsonpath '{}'", assertion.target),
        AssertionKind::Header => format!("header '{}'", assertion.target),
        AssertionKind::Length => "body length".to_string(),
        AssertionKind::Time => "response time".to_string(),
    };
    let verb = if assertion.negate { "not to be" } else { "to be" };
    format!(
        "expected {subject} {verb} {}, got {actual}",
        assertion.expected
    )
}

fn check_status(expected: &str, status: u16) -> Outcome {
    match expected.trim().parse::<u16>() {
        Ok(code) => Outcome::Compared {
            passed: code == status,
            actual: status.to_string(),
        },
        Err(_) => Outcome::Invalid {
            actual: status.to_string(),
            reason: format!("invalid status expectation '{expected}'"),
        },
    }
}

fn check_regex(pattern: &str, response: &HttpResponse) -> Outcome {
    match Regex::new(pattern) {
        Ok(re) => Outcome::Compared {
            passed: re.is_match(&response.text()),
            actual: summarize(response),
        },
        Err(e) => Outcome::Invalid {
            actual: summarize(response),
            reason: format!("invalid regex '{pattern}': {e}"),
        },
    }
}

/// `expected` is a bare integer or one prefixed with `>`, `<`, `>=`,
/// `<=`.
fn check_length(expected: &str, length: usize) -> Outcome {
    let trimmed = expected.trim();
    let (accepts, number): (fn(Ordering) -> bool, &str) =
        if let Some(rest) = trimmed.strip_prefix(">=") {
            (Ordering::is_ge, rest)
        } else if let Some(rest) = trimmed.strip_prefix("<=") {
            (Ordering::is_le, rest)
        } else if let Some(rest) = trimmed.strip_prefix('>') {
            (Ordering::is_gt, rest)
        } else if let Some(rest) = trimmed.strip_prefix('<') {
            (Ordering::is_lt, rest)
        } else {
            (Ordering::is_eq, trimmed)
        };

    match number.trim().parse::<usize>() {
        Ok(bound) => Outcome::Compared {
            passed: accepts(length.cmp(&bound)),
            actual: length.to_string(),
        },
        Err(_) => Outcome::Invalid {
            actual: length.to_string(),
            reason: format!("invalid length expectation '{expected}'"),
        },
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

/// Short rendering of a body for failure messages.
fn summarize(response: &HttpResponse) -> String {
    const LIMIT: usize = 120;
    let text = response.text();
    if text.chars().count() <= LIMIT {
        text.into_owned()
    } else {
        let head: String = text.chars().take(LIMIT).collect();
        format!("{head}...")
    }
}
