//! Lexical catalog search.
//!
//! Case-insensitive substring scoring: a query token matching the tool name
//! weighs 3, the short description 2, a tag 1. Scores sum over tokens; ties
//! break on tool name length (shorter first), then tool id. An empty query
//! returns the catalog head in its stable server-then-name order.

use serde::Serialize;

use super::{CatalogSnapshot, ToolCard};

/// Weight of a tool-name substring match.
const WEIGHT_NAME: u32 = 3;
/// Weight of a description substring match.
const WEIGHT_DESCRIPTION: u32 = 2;
/// Weight of a tag substring match.
const WEIGHT_TAG: u32 = 1;

/// Ranked search output with truncation flags.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    /// Matching cards, best first, at most `limit`.
    pub cards: Vec<ToolCard>,
    /// How many cards matched before the limit was applied.
    pub total_available: usize,
    /// Whether the limit cut the result set.
    pub truncated: bool,
}

/// Scores one card against a query. Zero means no match.
#[must_use]
pub fn score_card(card: &ToolCard, query: &str) -> u32 {
    let name = card.tool_name.to_lowercase();
    let description = card.short_description.to_lowercase();
    let tags: Vec<String> = card.tags.iter().map(|t| t.to_lowercase()).collect();

    let mut score = 0;
    for token in query.to_lowercase().split_whitespace() {
        if name.contains(token) {
            score += WEIGHT_NAME;
        }
        if description.contains(token) {
            score += WEIGHT_DESCRIPTION;
        }
        if tags.iter().any(|tag| tag.contains(token)) {
            score += WEIGHT_TAG;
        }
    }
    score
}

impl CatalogSnapshot {
    /// Searches the catalog.
    ///
    /// The snapshot is immutable, so one call always sees an internally
    /// consistent catalog.
    #[must_use]
    pub fn search(&self, query: &str, limit: usize) -> SearchResults {
        if query.trim().is_empty() {
            let total_available = self.tools.len();
            let mut head: Vec<&ToolCard> = self.tools.iter().collect();
            head.sort_by(|a, b| {
                a.server
                    .cmp(&b.server)
                    .then_with(|| a.tool_name.cmp(&b.tool_name))
            });
            let cards: Vec<ToolCard> = head.into_iter().take(limit).cloned().collect();
            return SearchResults {
                truncated: total_available > cards.len(),
                total_available,
                cards,
            };
        }

        let mut scored: Vec<(u32, &ToolCard)> = self
            .tools
            .iter()
            .filter_map(|card| {
                let score = score_card(card, query);
                (score > 0).then_some((score, card))
            })
            .collect();
        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .cmp(score_a)
                .then_with(|| a.tool_name.len().cmp(&b.tool_name.len()))
                .then_with(|| a.tool_id.cmp(&b.tool_id))
        });

        let total_available = scored.len();
        let cards: Vec<ToolCard> = scored
            .into_iter()
            .take(limit)
            .map(|(_, card)| card.clone())
            .collect();
        SearchResults {
            truncated: total_available > cards.len(),
            total_available,
            cards,
        }
    }
}
