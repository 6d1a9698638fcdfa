//! Output size capping.
//!
//! After a downstream result is serialised, oversized payloads are cut down
//! to fit the policy's byte and token budgets. Truncation always yields a
//! valid JSON document: the original serialisation is carried as a string
//! (cut at a character boundary) next to a synthetic `_truncated_at` marker
//! recording how many bytes survived.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Numeric caps from the policy's `limits` section.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Limits {
    /// Per-server tool cap applied at catalog rebuild.
    #[serde(default = "default_max_tools_per_server")]
    pub max_tools_per_server: usize,

    /// Serialised byte budget per user-visible payload.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Estimated token budget per user-visible payload.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,
}

const fn default_max_tools_per_server() -> usize {
    50
}

const fn default_max_output_bytes() -> usize {
    65_536
}

const fn default_max_output_tokens() -> usize {
    16_384
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_tools_per_server: default_max_tools_per_server(),
            max_output_bytes: default_max_output_bytes(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Result of applying the size cap to one payload.
#[derive(Debug, Clone)]
pub struct CappedOutput {
    /// The (possibly truncated) payload.
    pub value: Value,
    /// Whether truncation occurred.
    pub truncated: bool,
    /// Serialised size of the original payload in bytes.
    pub raw_size: usize,
}

impl Limits {
    /// Estimates the token count of a serialised payload (bytes ÷ 4, floor).
    #[must_use]
    pub const fn estimate_tokens(byte_len: usize) -> usize {
        byte_len / 4
    }

    /// The effective byte budget: the tighter of the byte cap and the token
    /// cap converted back to bytes.
    #[must_use]
    pub const fn byte_budget(&self) -> usize {
        let token_bytes = self.max_output_tokens.saturating_mul(4);
        if token_bytes < self.max_output_bytes {
            token_bytes
        } else {
            self.max_output_bytes
        }
    }

    /// Applies the size cap to a payload.
    ///
    /// Payloads within budget pass through unchanged. Oversized payloads are
    /// replaced with a wrapper document carrying a prefix of the original
    /// serialisation and a `_truncated_at` marker.
    #[must_use]
    pub fn cap(&self, value: &Value) -> CappedOutput {
        let serialised = value.to_string();
        let raw_size = serialised.len();

        if raw_size <= self.max_output_bytes
            && Self::estimate_tokens(raw_size) <= self.max_output_tokens
        {
            return CappedOutput {
                value: value.clone(),
                truncated: false,
                raw_size,
            };
        }

        let budget = self.byte_budget();
        let value = truncate_to_budget(&serialised, budget);
        CappedOutput {
            value,
            truncated: true,
            raw_size,
        }
    }
}

/// Builds the truncation wrapper, shrinking the carried prefix until the
/// whole document fits the budget (or the prefix is empty).
fn truncate_to_budget(serialised: &str, budget: usize) -> Value {
    let mut keep = budget.min(serialised.len());
    loop {
        keep = floor_char_boundary(serialised, keep);
        let wrapper = json!({
            "_truncated_at": keep,
            "content": &serialised[..keep],
        });
        let size = wrapper.to_string().len();
        if size <= budget || keep == 0 {
            return wrapper;
        }
        keep = keep.saturating_sub(size - budget);
    }
}

/// Largest index `<= at` that lies on a character boundary.
fn floor_char_boundary(text: &str, at: usize) -> usize {
    let mut index = at.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_passes_through() {
        let limits = Limits::default();
        let value = json!({"ok": true});
        let capped = limits.cap(&value);
        assert!(!capped.truncated);
        assert_eq!(capped.value, value);
        assert_eq!(capped.raw_size, value.to_string().len());
    }

    #[test]
    fn oversized_payload_is_truncated_and_valid_json() {
        let limits = Limits {
            max_tools_per_server: 50,
            max_output_bytes: 50,
            max_output_tokens: 16_384,
        };
        let value = json!({"data": "x".repeat(100)});
        let raw = value.to_string().len();

        let capped = limits.cap(&value);
        assert!(capped.truncated);
        assert_eq!(capped.raw_size, raw);
        assert!(capped.value.get("_truncated_at").is_some());
        assert!(capped.value.to_string().len() <= 50);
    }

    #[test]
    fn token_cap_applies_independently() {
        let limits = Limits {
            max_tools_per_server: 50,
            max_output_bytes: 1_000_000,
            max_output_tokens: 10, // 40 bytes
        };
        let value = json!({"data": "y".repeat(100)});
        let capped = limits.cap(&value);
        assert!(capped.truncated);
        assert!(capped.value.to_string().len() <= 40);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let limits = Limits {
            max_tools_per_server: 50,
            max_output_bytes: 60,
            max_output_tokens: 16_384,
        };
        // Multi-byte characters near every candidate cut point
        let value = json!({"data": "héllö wörld ünïcode ẑẑẑ".repeat(5)});
        let capped = limits.cap(&value);
        assert!(capped.truncated);
        // to_string panics on invalid UTF-8 slices, so reaching here proves
        // the cut was boundary-safe; verify the wrapper still parses.
        let rendered = capped.value.to_string();
        let reparsed: Value = serde_json::from_str(&rendered).unwrap();
        assert!(reparsed.get("content").is_some());
    }

    #[test]
    fn token_estimate_is_floor_of_quarter() {
        assert_eq!(Limits::estimate_tokens(0), 0);
        assert_eq!(Limits::estimate_tokens(3), 0);
        assert_eq!(Limits::estimate_tokens(4), 1);
        assert_eq!(Limits::estimate_tokens(103), 25);
    }

    #[test]
    fn defaults_are_consistent() {
        let limits = Limits::default();
        // Byte and token budgets agree under the 4-bytes-per-token estimate
        assert_eq!(limits.max_output_bytes, limits.max_output_tokens * 4);
    }
}
