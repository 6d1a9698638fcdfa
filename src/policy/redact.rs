//! Secret redaction on serialised results.
//!
//! Every user-visible payload passes through here before leaving the
//! gateway. Each configured regex is applied to the serialised result;
//! matched secret material is replaced with `***` while the match position
//! is preserved so the surrounding structure is unchanged.
//!
//! # Replacement Rules
//!
//! - A pattern with capture groups keeps the full match but replaces each
//!   redactable group span with `***`. Unnamed groups are always redacted;
//!   named groups only when the name contains `secret`, `key`, `token`, or
//!   `password` (case-insensitive).
//! - A pattern without groups keeps everything up to the last `=` or `:`
//!   inside the match and redacts the remainder, so `api_key=\w+` turns
//!   `api_key=hunter2` into `api_key=***`.
//! - A groupless match without a separator is replaced whole.

use std::borrow::Cow;

use regex::{Captures, Regex};

use crate::error::ConfigError;

/// The replacement text for redacted material.
const MASK: &str = "***";

/// Group names containing any of these are treated as secret-bearing.
const SECRET_NAME_HINTS: &[&str] = &["secret", "key", "token", "password"];

/// A compiled redaction pattern.
#[derive(Debug, Clone)]
struct RedactionPattern {
    original: String,
    regex: Regex,
}

/// Applies the policy's redaction patterns to serialised output.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    patterns: Vec<RedactionPattern>,
}

impl Redactor {
    /// Compiles a redactor from regex strings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRedaction`] if any pattern fails to
    /// compile.
    pub fn compile(patterns: &[String]) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map(|regex| RedactionPattern {
                        original: p.clone(),
                        regex,
                    })
                    .map_err(|e| ConfigError::InvalidRedaction {
                        pattern: p.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// A redactor with no patterns (permissive default).
    #[must_use]
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Returns the number of compiled patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns `true` when no patterns are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Redacts all pattern matches in the input.
    ///
    /// Returns `Cow::Borrowed` when nothing matched.
    #[must_use]
    pub fn redact<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let mut result = Cow::Borrowed(input);
        for pattern in &self.patterns {
            if pattern.regex.is_match(&result) {
                let replaced = pattern
                    .regex
                    .replace_all(&result, |caps: &Captures<'_>| {
                        redact_match(&pattern.regex, caps)
                    })
                    .into_owned();
                result = Cow::Owned(replaced);
            }
        }
        result
    }
}

impl std::fmt::Display for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.patterns.iter().map(|p| p.original.as_str()).collect();
        write!(f, "Redactor[{}]", names.join(", "))
    }
}

/// Builds the replacement for one match according to the group rules.
fn redact_match(regex: &Regex, caps: &Captures<'_>) -> String {
    let Some(full) = caps.get(0) else {
        return MASK.to_string();
    };
    let full_text = full.as_str();

    // Collect redactable group spans, relative to the full match
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for (index, name) in regex.capture_names().enumerate() {
        if index == 0 {
            continue;
        }
        let redactable = name.map_or(true, |n| {
            let lowered = n.to_lowercase();
            SECRET_NAME_HINTS.iter().any(|hint| lowered.contains(hint))
        });
        if !redactable {
            continue;
        }
        if let Some(group) = caps.get(index) {
            spans.push((group.start() - full.start(), group.end() - full.start()));
        }
    }

    if spans.is_empty() {
        // Groupless pattern: preserve a key=/key: prefix when present
        return match full_text.rfind(['=', ':']) {
            Some(sep) => format!("{}{MASK}", &full_text[..=sep]),
            None => MASK.to_string(),
        };
    }

    spans.sort_unstable();
    let mut out = String::with_capacity(full_text.len());
    let mut cursor = 0;
    for (start, end) in spans {
        if start < cursor {
            // Nested or overlapping group already covered
            continue;
        }
        out.push_str(&full_text[cursor..start]);
        out.push_str(MASK);
        cursor = end;
    }
    out.push_str(&full_text[cursor..]);
    out
}
