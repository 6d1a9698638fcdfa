//! Allow/deny rule sets over glob patterns.
//!
//! # Pattern Syntax
//!
//! Patterns use glob-style wildcards:
//!
//! - `*` matches any sequence of characters (including `::`)
//! - `?` matches any single character
//! - `[abc]` matches any character in the set
//!
//! The `::` separator in tool ids is ordinary text to the glob engine, so
//! `*::delete_*` matches `files::delete_all` but not `files::list`.
//!
//! # Precedence
//!
//! Denial takes precedence over allowance. An empty allowlist means
//! "allow all"; an empty denylist denies nothing.

use glob::{MatchOptions, Pattern};

use crate::error::ConfigError;

/// A compiled policy pattern.
///
/// The original pattern string is preserved for error messages.
#[derive(Debug, Clone)]
pub struct PolicyPattern {
    original: String,
    pattern: Pattern,
}

impl PolicyPattern {
    /// Compiles a pattern string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] on invalid glob syntax.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let compiled = Pattern::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.msg.to_string(),
        })?;
        Ok(Self {
            original: pattern.to_string(),
            pattern: compiled,
        })
    }

    /// Returns the original pattern string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Checks whether the given name matches this pattern.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        let options = MatchOptions {
            // Tool ids are flat names; let * cross any character
            require_literal_separator: false,
            case_sensitive: true,
            require_literal_leading_dot: false,
        };
        self.pattern.matches_with(name, options)
    }
}

/// An allowlist/denylist pair for one policy category.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    allow: Vec<PolicyPattern>,
    deny: Vec<PolicyPattern>,
}

impl RuleSet {
    /// Compiles a rule set from pattern strings.
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern has invalid glob syntax.
    pub fn compile(allow: &[String], deny: &[String]) -> Result<Self, ConfigError> {
        let allow = allow
            .iter()
            .map(|p| PolicyPattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let deny = deny
            .iter()
            .map(|p| PolicyPattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { allow, deny })
    }

    /// A rule set that allows everything.
    #[must_use]
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Checks whether a name passes this rule set.
    ///
    /// Deny wins over allow; an empty allowlist allows all names.
    #[must_use]
    pub fn allows(&self, name: &str) -> bool {
        if self.deny.iter().any(|p| p.matches(name)) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|p| p.matches(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(allow: &[&str], deny: &[&str]) -> RuleSet {
        RuleSet::compile(
            &allow.iter().map(|s| (*s).to_string()).collect::<Vec<_>>(),
            &deny.iter().map(|s| (*s).to_string()).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    #[test]
    fn empty_rules_allow_everything() {
        let set = RuleSet::permissive();
        assert!(set.allows("anything"));
        assert!(set.allows("files::read"));
    }

    #[test]
    fn deny_wins_over_allow() {
        let set = rules(&["files::*"], &["files::delete_*"]);
        assert!(set.allows("files::read"));
        assert!(!set.allows("files::delete_all"));
    }

    #[test]
    fn allowlist_restricts_when_nonempty() {
        let set = rules(&["github::*"], &[]);
        assert!(set.allows("github::create_issue"));
        assert!(!set.allows("files::read"));
    }

    #[test]
    fn star_crosses_namespace_separator() {
        let set = rules(&[], &["*::delete_*"]);
        assert!(!set.allows("files::delete_all"));
        assert!(!set.allows("db::delete_rows"));
        assert!(set.allows("files::list"));
    }

    #[test]
    fn question_mark_matches_one_character() {
        let set = rules(&["server?"], &[]);
        assert!(set.allows("server1"));
        assert!(!set.allows("server12"));
    }

    #[test]
    fn patterns_are_case_sensitive() {
        let set = rules(&[], &["GitHub::*"]);
        assert!(set.allows("github::read"));
        assert!(!set.allows("GitHub::read"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let result = RuleSet::compile(&["[unclosed".to_string()], &[]);
        assert!(matches!(result, Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn pattern_preserves_original() {
        let pattern = PolicyPattern::new("files::*").unwrap();
        assert_eq!(pattern.as_str(), "files::*");
    }
}
