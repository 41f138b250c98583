//! Output comparison for one test case
//!
//! Every strategy is a pure function of the two strings: the same pair
//! always gives the same answer.

use serde::{Deserialize, Serialize};

/// Comparison strategy a problem can opt into
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Comparison {
    /// Line-by-line, ignoring trailing whitespace and trailing blank lines
    #[default]
    Exact,
    /// Whitespace-separated tokens must be identical
    Tokens,
    /// Like `Tokens`, but numeric tokens may differ by `epsilon`
    /// (absolute, or relative to the expected value)
    Float { epsilon: f64 },
}

impl Comparison {
    pub fn matches(&self, actual: &str, expected: &str) -> bool {
        match *self {
            Comparison::Exact => compare_lines(actual, expected),
            Comparison::Tokens => actual.split_whitespace().eq(expected.split_whitespace()),
            Comparison::Float { epsilon } => compare_floats(actual, expected, epsilon),
        }
    }
}

/// Compare program output with expected output
fn compare_lines(actual: &str, expected: &str) -> bool {
    // Normalize outputs: trim trailing whitespace from each line and trailing newlines
    fn normalize(s: &str) -> Vec<&str> {
        let mut lines: Vec<&str> = s.lines().map(str::trim_end).collect();
        // Remove trailing empty lines
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        lines
    }

    normalize(actual) == normalize(expected)
}

fn compare_floats(actual: &str, expected: &str, epsilon: f64) -> bool {
    let mut actual_tokens = actual.split_whitespace();
    let mut expected_tokens = expected.split_whitespace();

    loop {
        match (actual_tokens.next(), expected_tokens.next()) {
            (None, None) => return true,
            (Some(a), Some(e)) => {
                if !tokens_close(a, e, epsilon) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

fn tokens_close(actual: &str, expected: &str, epsilon: f64) -> bool {
    if actual == expected {
        return true;
    }
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(e)) if a.is_finite() && e.is_finite() => {
            let diff = (a - e).abs();
            diff <= epsilon || diff <= epsilon * e.abs()
        }
        _ => false,
    }
}
