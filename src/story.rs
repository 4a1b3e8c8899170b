//! Story enumeration and batching
//!
//! Stories are read from the catalog's in-page registry once per run and then
//! split into contiguous batches for the orchestrator.

use crate::capture::{apply_device, evaluate_value, navigate_and_settle};
use crate::{BrowserSession, Config, DiffError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Projects the registry down to plain data; story render functions do not
/// survive serialization.
const REGISTRY_EXPRESSION: &str = r#"(() => {
    const api = window.__STORYBOOK_CLIENT_API__;
    if (!api || typeof api.getStorybook !== 'function') {
        return { ready: false, kinds: null };
    }
    return {
        ready: true,
        kinds: api.getStorybook().map((group) => ({
            kind: group.kind,
            stories: group.stories.map((story) => ({ name: story.name })),
        })),
    };
})()"#;

const REGISTRY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One renderable story of the catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoryRef {
    pub kind: String,
    pub name: String,
    /// `selectedKind=...&selectedStory=...`, appended to either origin
    pub query: String,
}

impl StoryRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        let kind = kind.into();
        let name = name.into();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("selectedKind", &kind)
            .append_pair("selectedStory", &name)
            .finish();

        Self { kind, name, query }
    }

    /// `kind-name`, used for logs and the composite caption
    pub fn label(&self) -> String {
        format!("{}-{}", self.kind, self.name)
    }
}

#[derive(Debug, Deserialize)]
struct RegistrySnapshot {
    ready: bool,
    #[serde(default)]
    kinds: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RegistryKind {
    kind: String,
    #[serde(default)]
    stories: Vec<RegistryStory>,
}

#[derive(Debug, Deserialize)]
struct RegistryStory {
    name: String,
}

/// Flatten the catalog registry into stories, in registry order
///
/// `null` means the catalog never exposed its client API.
pub fn parse_registry(value: serde_json::Value) -> Result<Vec<StoryRef>, DiffError> {
    if value.is_null() {
        return Err(DiffError::Enumeration(
            "catalog registry is not available".to_string(),
        ));
    }

    let kinds: Vec<RegistryKind> = serde_json::from_value(value)
        .map_err(|e| DiffError::Enumeration(format!("unexpected registry shape: {e}")))?;

    Ok(kinds
        .into_iter()
        .flat_map(|group| {
            let kind = group.kind;
            group
                .stories
                .into_iter()
                .map(move |story| StoryRef::new(kind.clone(), story.name))
        })
        .collect())
}

/// Split stories into contiguous batches of `size`; the last one may be shorter
pub fn partition(stories: &[StoryRef], size: usize) -> Vec<Vec<StoryRef>> {
    stories
        .chunks(size.max(1))
        .map(<[StoryRef]>::to_vec)
        .collect()
}

/// Stories whose `(kind, name)` already appeared earlier in the list
pub fn find_duplicates(stories: &[StoryRef]) -> Vec<&StoryRef> {
    let mut seen = HashSet::new();
    stories
        .iter()
        .filter(|story| !seen.insert((story.kind.as_str(), story.name.as_str())))
        .collect()
}

/// Source of the story list
#[async_trait]
pub trait StoryCatalog: Send + Sync {
    async fn stories(&self) -> Result<Vec<StoryRef>, DiffError>;
}

/// Reads the registry of a live catalog page
pub struct ChromeCatalog {
    session: Arc<BrowserSession>,
    url: String,
    config: Config,
}

impl ChromeCatalog {
    pub fn new(session: Arc<BrowserSession>, url: impl Into<String>, config: Config) -> Self {
        Self {
            session,
            url: url.into(),
            config,
        }
    }

    async fn read_registry(&self, page: &chromiumoxide::Page) -> Result<Vec<StoryRef>, DiffError> {
        apply_device(page, &self.config.device)
            .await
            .map_err(|e| DiffError::Enumeration(e.to_string()))?;
        navigate_and_settle(page, &self.url, self.config.timeouts.network_idle)
            .await
            .map_err(|e| DiffError::Enumeration(e.to_string()))?;

        debug!("Catalog loaded from {}", self.url);

        // the client API appears once the catalog has booted
        loop {
            let snapshot: RegistrySnapshot = evaluate_value(page, REGISTRY_EXPRESSION)
                .await
                .map_err(|e| DiffError::Enumeration(e.to_string()))?;
            if snapshot.ready {
                return parse_registry(snapshot.kinds);
            }
            sleep(REGISTRY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl StoryCatalog for ChromeCatalog {
    async fn stories(&self) -> Result<Vec<StoryRef>, DiffError> {
        let page = self
            .session
            .new_page()
            .await
            .map_err(|e| DiffError::Enumeration(e.to_string()))?;

        let limit = self.config.timeouts.enumeration;
        let result = match timeout(limit, self.read_registry(&page)).await {
            Ok(result) => result,
            Err(_) => Err(DiffError::Enumeration(format!(
                "catalog registry not available after {limit:?}"
            ))),
        };

        if let Err(e) = page.close().await {
            warn!("Failed to close catalog page: {}", e);
        }

        if let Ok(stories) = &result {
            info!("Enumerated {} stories from {}", stories.len(), self.url);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stories(n: usize) -> Vec<StoryRef> {
        (0..n).map(|i| StoryRef::new("Kind", format!("story {i}"))).collect()
    }

    #[test]
    fn test_story_query_and_label() {
        let story = StoryRef::new("Forms/Button", "primary large");
        assert_eq!(
            story.query,
            "selectedKind=Forms%2FButton&selectedStory=primary+large"
        );
        assert_eq!(story.label(), "Forms/Button-primary large");
    }

    #[test]
    fn test_parse_registry_flattens_in_order() {
        let registry = json!([
            { "kind": "Button", "stories": [{ "name": "primary" }, { "name": "secondary" }] },
            { "kind": "Card", "stories": [{ "name": "empty" }] },
            { "kind": "Empty" }
        ]);

        let parsed = parse_registry(registry).unwrap();
        let labels: Vec<String> = parsed.iter().map(StoryRef::label).collect();
        assert_eq!(labels, vec!["Button-primary", "Button-secondary", "Card-empty"]);
    }

    #[test]
    fn test_parse_registry_missing_api() {
        assert!(matches!(
            parse_registry(serde_json::Value::Null),
            Err(DiffError::Enumeration(_))
        ));
        assert!(matches!(
            parse_registry(json!({ "kind": "not a list" })),
            Err(DiffError::Enumeration(_))
        ));
    }

    #[test]
    fn test_partition_preserves_order_and_sizes() {
        for len in 0..25 {
            for size in 1..7 {
                let input = stories(len);
                let batches = partition(&input, size);

                assert_eq!(batches.len(), (len + size - 1) / size);
                if let Some((last, full)) = batches.split_last() {
                    assert!(full.iter().all(|b| b.len() == size));
                    assert!(!last.is_empty() && last.len() <= size);
                }
                let flattened: Vec<StoryRef> = batches.into_iter().flatten().collect();
                assert_eq!(flattened, input);
            }
        }
    }

    #[test]
    fn test_partition_three_stories_by_two() {
        let batches = partition(&stories(3), 2);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn test_partition_zero_size_is_one() {
        assert_eq!(partition(&stories(3), 0).len(), 3);
    }

    #[test]
    fn test_duplicates_are_reported_not_removed() {
        let mut list = stories(2);
        list.push(StoryRef::new("Kind", "story 0"));

        let duplicates = find_duplicates(&list);
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].name, "story 0");
        assert_eq!(partition(&list, 10)[0].len(), 3);
    }
}
