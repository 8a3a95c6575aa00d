use crate::registry::AgentMetadata;
use async_trait::async_trait;
use std::collections::HashSet;
use swarmline_core::Payload;

/// Picks an agent for a task that did not name one.
#[async_trait]
pub trait AgentSelector: Send + Sync {
    /// Returns a candidate name, or `None` if no agent fits.
    async fn select(
        &self,
        description: &str,
        input: &Payload,
        candidates: &[AgentMetadata],
    ) -> Option<String>;
}

/// Scores candidates by word overlap between the task description and the
/// agent's name, category and capabilities.
#[derive(Debug, Clone, Default)]
pub struct KeywordSelector {
    fallback: Option<String>,
}

impl KeywordSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agent to use when nothing matches.
    pub fn with_fallback(mut self, agent: impl Into<String>) -> Self {
        self.fallback = Some(agent.into());
        self
    }

    fn score(words: &HashSet<String>, agent: &AgentMetadata) -> usize {
        let mut terms = tokenize(&agent.name);
        terms.extend(tokenize(&agent.category));
        for cap in &agent.capabilities {
            terms.extend(tokenize(cap));
        }
        terms.intersection(words).count()
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl AgentSelector for KeywordSelector {
    async fn select(
        &self,
        description: &str,
        _input: &Payload,
        candidates: &[AgentMetadata],
    ) -> Option<String> {
        let words = tokenize(description);
        let best = candidates
            .iter()
            .map(|agent| (Self::score(&words, agent), agent))
            .filter(|(score, _)| *score > 0)
            // Highest score wins; ties go to the alphabetically first name.
            .max_by(|(sa, a), (sb, b)| sa.cmp(sb).then_with(|| b.name.cmp(&a.name)));
        match best {
            Some((_, agent)) => Some(agent.name.clone()),
            None => self
                .fallback
                .clone()
                .filter(|name| candidates.iter().any(|c| &c.name == name)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn candidates() -> Vec<AgentMetadata> {
        vec![
            AgentMetadata::new("coder")
                .with_category("engineering")
                .with_capabilities(&["rust", "refactor", "code-review"]),
            AgentMetadata::new("researcher")
                .with_category("research")
                .with_capabilities(&["search", "summarize"]),
            AgentMetadata::new("writer")
                .with_category("content")
                .with_capabilities(&["draft", "summarize"]),
        ]
    }

    #[tokio::test]
    async fn test_best_overlap_wins() {
        let selector = KeywordSelector::new();
        let picked = selector
            .select("Refactor the Rust parser", &Payload::new(), &candidates())
            .await;
        assert_eq!(picked.as_deref(), Some("coder"));

        let picked = selector
            .select("search papers and summarize them", &Payload::new(), &candidates())
            .await;
        assert_eq!(picked.as_deref(), Some("researcher"));
    }

    #[tokio::test]
    async fn test_tie_breaks_by_name() {
        let picked = KeywordSelector::new()
            .select("summarize this", &Payload::new(), &candidates())
            .await;
        assert_eq!(picked.as_deref(), Some("researcher"));
    }

    #[tokio::test]
    async fn test_no_match_uses_fallback_if_registered() {
        let input = Payload::new();
        assert!(KeywordSelector::new()
            .select("bake bread", &input, &candidates())
            .await
            .is_none());
        let picked = KeywordSelector::new()
            .with_fallback("writer")
            .select("bake bread", &input, &candidates())
            .await;
        assert_eq!(picked.as_deref(), Some("writer"));
        assert!(KeywordSelector::new()
            .with_fallback("ghost")
            .select("bake bread", &input, &candidates())
            .await
            .is_none());
    }
}
