//! Capability matching for `request_capability`.
//!
//! Ranks running servers, manifest entries, and individual tools against a
//! free-text query. Scoring is an abstract seam: the deterministic
//! [`LexicalScorer`] is the default, and any smarter implementation (an
//! LLM-backed ranker, say) drops in behind [`CapabilityScorer`] without
//! touching callers.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::catalog::{Availability, CatalogSnapshot};
use crate::manifest::Manifest;

/// Bonus applied to candidates that are already running.
const RUNNING_BONUS: f32 = 0.1;

/// Bonus applied to manifest candidates whose required environment
/// variables are already set.
const ENV_READY_BONUS: f32 = 0.05;

/// What kind of thing a candidate is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateType {
    /// A currently connected server.
    ServerRunning,
    /// A provisionable server from the manifest.
    ServerManifest,
    /// An individual tool in the catalog.
    Tool,
}

/// One ranked match for a capability query.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    /// Server name or namespaced tool id.
    pub name: String,
    /// What kind of candidate this is.
    pub candidate_type: CandidateType,
    /// Relevance in `[0, 1]`.
    pub relevance_score: f32,
    /// Whether the capability is usable right now.
    pub is_running: bool,
    /// Whether the candidate needs an API key or token.
    pub requires_api_key: bool,
    /// Short description of the candidate.
    pub description: String,
    /// Required environment variables that are not currently set.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_env: Vec<String>,
    /// How to make the candidate available, when it is not running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_hint: Option<String>,
}

/// The fields scoring sees for any candidate.
pub struct CandidateFields<'a> {
    /// Candidate name.
    pub name: &'a str,
    /// Candidate description.
    pub description: &'a str,
    /// Capability tags.
    pub tags: &'a [String],
}

/// Pluggable relevance scoring.
pub trait CapabilityScorer: Send + Sync {
    /// Scores a candidate against a query; result must land in `[0, 1]`.
    fn score(&self, query: &str, candidate: &CandidateFields<'_>) -> f32;
}

/// Deterministic token-overlap scorer (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalScorer;

impl CapabilityScorer for LexicalScorer {
    fn score(&self, query: &str, candidate: &CandidateFields<'_>) -> f32 {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return 0.0;
        }

        let mut candidate_tokens = tokenize(candidate.name);
        candidate_tokens.extend(tokenize(candidate.description));
        for tag in candidate.tags {
            candidate_tokens.extend(tokenize(tag));
        }

        let overlap = query_tokens
            .iter()
            .filter(|token| candidate_tokens.contains(*token))
            .count();
        #[allow(clippy::cast_precision_loss)] // token counts are tiny
        let score = overlap as f32 / query_tokens.len() as f32;
        score
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 1)
        .map(String::from)
        .collect()
}

/// Ranks candidates for a capability query.
pub struct CapabilityMatcher {
    scorer: Box<dyn CapabilityScorer>,
}

impl CapabilityMatcher {
    /// Creates a matcher with the lexical scorer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scorer: Box::new(LexicalScorer),
        }
    }

    /// Creates a matcher with a custom scorer.
    #[must_use]
    pub fn with_scorer(scorer: Box<dyn CapabilityScorer>) -> Self {
        Self { scorer }
    }

    /// Ranks running servers, manifest entries, and catalog tools against
    /// the query. Results come back best-first; zero-score candidates are
    /// dropped.
    #[must_use]
    pub fn rank(
        &self,
        query: &str,
        manifest: &Manifest,
        running_servers: &[String],
        catalog: &CatalogSnapshot,
        env_is_set: &dyn Fn(&str) -> bool,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        for (name, entry) in &manifest.servers {
            let is_running = running_servers.contains(name);
            let base = self.scorer.score(
                query,
                &CandidateFields {
                    name,
                    description: &entry.description,
                    tags: &entry.tags,
                },
            );
            if base <= 0.0 {
                continue;
            }
            let missing: Vec<String> = entry
                .missing_env(|var| env_is_set(var))
                .into_iter()
                .map(String::from)
                .collect();
            let mut score = base;
            if is_running {
                score += RUNNING_BONUS;
            } else if missing.is_empty() {
                score += ENV_READY_BONUS;
            }
            candidates.push(Candidate {
                name: name.clone(),
                candidate_type: if is_running {
                    CandidateType::ServerRunning
                } else {
                    CandidateType::ServerManifest
                },
                relevance_score: score.clamp(0.0, 1.0),
                is_running,
                requires_api_key: entry.requires_api_key(),
                description: entry.description.clone(),
                missing_env: missing,
                install_hint: (!is_running)
                    .then(|| format!("provision {{\"server_name\": \"{name}\"}}")),
            });
        }

        // Running servers without a manifest entry still rank, scored over
        // their visible tool inventory
        for server in running_servers {
            if manifest.servers.contains_key(server) {
                continue;
            }
            let tool_names: Vec<String> = catalog
                .tools
                .iter()
                .filter(|card| &card.server == server)
                .map(|card| card.tool_name.clone())
                .collect();
            let description = format!("connected server with {} tools", tool_names.len());
            let base = self.scorer.score(
                query,
                &CandidateFields {
                    name: server,
                    description: &description,
                    tags: &tool_names,
                },
            );
            if base <= 0.0 {
                continue;
            }
            candidates.push(Candidate {
                name: server.clone(),
                candidate_type: CandidateType::ServerRunning,
                relevance_score: (base + RUNNING_BONUS).clamp(0.0, 1.0),
                is_running: true,
                requires_api_key: false,
                description,
                missing_env: Vec::new(),
                install_hint: None,
            });
        }

        for card in &catalog.tools {
            let base = self.scorer.score(
                query,
                &CandidateFields {
                    name: &card.tool_name,
                    description: &card.short_description,
                    tags: &card.tags,
                },
            );
            if base <= 0.0 {
                continue;
            }
            let is_running = card.availability == Availability::Online;
            let mut score = base;
            if is_running {
                score += RUNNING_BONUS;
            }
            candidates.push(Candidate {
                name: card.tool_id.clone(),
                candidate_type: CandidateType::Tool,
                relevance_score: score.clamp(0.0, 1.0),
                is_running,
                requires_api_key: false,
                description: card.short_description.clone(),
                missing_env: Vec::new(),
                install_hint: None,
            });
        }

        candidates.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        candidates
    }
}

impl Default for CapabilityMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::catalog::CatalogRegistry;
    use crate::policy::Policy;
    use crate::session::ToolDescriptor;

    fn empty_catalog() -> std::sync::Arc<CatalogSnapshot> {
        CatalogRegistry::new().snapshot()
    }

    #[test]
    fn lexical_scorer_overlap_fraction() {
        let scorer = LexicalScorer;
        let fields = CandidateFields {
            name: "github",
            description: "GitHub integration: repositories, issues, pull requests",
            tags: &["git".to_string(), "issues".to_string()],
        };

        let full = scorer.score("github issues", &fields);
        assert!((full - 1.0).abs() < f32::EPSILON);

        let half = scorer.score("github kubernetes", &fields);
        assert!((half - 0.5).abs() < f32::EPSILON);

        assert!(scorer.score("astrophysics", &fields).abs() < f32::EPSILON);
    }

    #[test]
    fn manifest_candidates_rank_by_relevance() {
        let manifest = Manifest::builtin().unwrap();
        let matcher = CapabilityMatcher::new();
        let catalog = empty_catalog();

        let results = matcher.rank("search the web", &manifest, &[], &catalog, &|_| false);
        assert!(!results.is_empty());
        assert_eq!(results[0].name, "brave-search");
        assert_eq!(results[0].candidate_type, CandidateType::ServerManifest);
        assert!(results[0].requires_api_key);
        assert_eq!(results[0].missing_env, vec!["BRAVE_API_KEY"]);
        assert!(results[0].install_hint.is_some());
    }

    #[test]
    fn running_server_gets_bonus() {
        let manifest = Manifest::builtin().unwrap();
        let matcher = CapabilityMatcher::new();
        let catalog = empty_catalog();

        // A partial-overlap query so the bonus is visible below the clamp
        let stopped = matcher.rank("github kubernetes", &manifest, &[], &catalog, &|_| false);
        let running = matcher.rank(
            "github kubernetes",
            &manifest,
            &["github".to_string()],
            &catalog,
            &|_| false,
        );

        let stopped_score = stopped.iter().find(|c| c.name == "github").unwrap();
        let running_score = running.iter().find(|c| c.name == "github").unwrap();
        assert!(running_score.relevance_score > stopped_score.relevance_score);
        assert_eq!(running_score.candidate_type, CandidateType::ServerRunning);
        assert!(running_score.is_running);
    }

    #[test]
    fn env_ready_manifest_gets_bonus() {
        let manifest = Manifest::builtin().unwrap();
        let matcher = CapabilityMatcher::new();
        let catalog = empty_catalog();

        let without = matcher.rank("github kubernetes", &manifest, &[], &catalog, &|_| false);
        let with = matcher.rank("github kubernetes", &manifest, &[], &catalog, &|var| {
            var == "GITHUB_PERSONAL_ACCESS_TOKEN"
        });

        let without_score = without.iter().find(|c| c.name == "github").unwrap();
        let with_score = with.iter().find(|c| c.name == "github").unwrap();
        assert!(with_score.relevance_score > without_score.relevance_score);
        assert!(with_score.missing_env.is_empty());
    }

    #[test]
    fn catalog_tools_appear_as_candidates() {
        let registry = CatalogRegistry::new();
        registry.install_inventory(
            "files",
            vec![ToolDescriptor {
                name: "grep_files".to_string(),
                description: Some("Searches files for a regex pattern.".to_string()),
                input_schema: json!({"type": "object"}),
                annotations: None,
            }],
            Vec::new(),
            Vec::new(),
            true,
        );
        registry.publish(&Policy::permissive());

        let manifest = Manifest::parse(r#"{"servers": {}}"#).unwrap();
        let matcher = CapabilityMatcher::new();
        let results = matcher.rank(
            "grep pattern",
            &manifest,
            &["files".to_string()],
            &registry.snapshot(),
            &|_| false,
        );

        let tool = results
            .iter()
            .find(|c| c.candidate_type == CandidateType::Tool)
            .unwrap();
        assert_eq!(tool.name, "files::grep_files");
        assert!(tool.is_running);
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let manifest = Manifest::builtin().unwrap();
        let matcher = CapabilityMatcher::new();
        let catalog = empty_catalog();

        let results = matcher.rank(
            "github git issues pull requests repository",
            &manifest,
            &["github".to_string()],
            &catalog,
            &|_| true,
        );
        for candidate in results {
            assert!(candidate.relevance_score >= 0.0);
            assert!(candidate.relevance_score <= 1.0);
        }
    }

    #[test]
    fn custom_scorer_is_a_drop_in() {
        struct Constant;
        impl CapabilityScorer for Constant {
            fn score(&self, _query: &str, _candidate: &CandidateFields<'_>) -> f32 {
                0.5
            }
        }

        let manifest = Manifest::builtin().unwrap();
        let matcher = CapabilityMatcher::with_scorer(Box::new(Constant));
        let catalog = empty_catalog();

        let results = matcher.rank("anything", &manifest, &[], &catalog, &|_| false);
        assert_eq!(results.len(), manifest.servers.len());
    }
}
