//! Topic pattern registry
//!
//! Maps regex patterns to handler strategies. Patterns are matched against the
//! whole topic string, never as a substring search. When several patterns match
//! the same topic, the one registered first wins; re-registering a pattern string
//! swaps the handler but keeps its original position.
//!
//! The registry is assembled once at startup (see [`RegistryBuilder`]) and then
//! shared read-only behind an `Arc`, so dispatch needs no locking.

use super::strategy::HandlerStrategy;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Registration errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid topic pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One pattern and the strategy that owns it
#[derive(Clone)]
pub struct TopicPatternEntry {
    pattern: String,
    matcher: Regex,
    handler: Arc<dyn HandlerStrategy>,
}

impl TopicPatternEntry {
    fn new(pattern: &str, handler: Arc<dyn HandlerStrategy>) -> Result<Self, DispatchError> {
        let matcher = compile_full_match(pattern)?;
        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
            handler,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn handler(&self) -> &Arc<dyn HandlerStrategy> {
        &self.handler
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.matcher.is_match(topic)
    }
}

impl std::fmt::Debug for TopicPatternEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicPatternEntry")
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Anchor a pattern so it only matches the complete topic
fn compile_full_match(pattern: &str) -> Result<Regex, DispatchError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| DispatchError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Pattern → handler mapping with first-registered-wins resolution
#[derive(Debug, Default, Clone)]
pub struct DispatchRegistry {
    entries: Vec<TopicPatternEntry>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Associate `pattern` with `handler`
    ///
    /// Returns the handler previously registered under the same pattern string,
    /// if any. Replacement is silent and keeps the entry's position.
    pub fn register(
        &mut self,
        pattern: &str,
        handler: Arc<dyn HandlerStrategy>,
    ) -> Result<Option<Arc<dyn HandlerStrategy>>, DispatchError> {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.pattern == pattern) {
            debug!(pattern = %pattern, "Replacing handler for existing pattern");
            let previous = std::mem::replace(&mut existing.handler, handler);
            return Ok(Some(previous));
        }

        let entry = TopicPatternEntry::new(pattern, handler)?;
        self.entries.push(entry);
        info!(pattern = %pattern, "Registered topic handler");
        Ok(None)
    }

    /// Register a strategy under the pattern it reports
    pub fn register_strategy(
        &mut self,
        handler: Arc<dyn HandlerStrategy>,
    ) -> Result<Option<Arc<dyn HandlerStrategy>>, DispatchError> {
        let pattern = handler.topic_pattern().to_string();
        self.register(&pattern, handler)
    }

    /// Find the entry responsible for `topic`
    pub fn resolve_entry(&self, topic: &str) -> Option<&TopicPatternEntry> {
        self.entries.iter().find(|entry| entry.matches(topic))
    }

    /// Find the handler responsible for `topic`
    pub fn resolve(&self, topic: &str) -> Option<Arc<dyn HandlerStrategy>> {
        self.resolve_entry(topic).map(|entry| entry.handler.clone())
    }

    /// Registered patterns in resolution order
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.pattern.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Startup-time assembly of a [`DispatchRegistry`]
///
/// Collects strategies and explicit routes, then validates every pattern in
/// [`RegistryBuilder::build`].
#[derive(Default)]
pub struct RegistryBuilder {
    routes: Vec<(String, Arc<dyn HandlerStrategy>)>,
}

impl RegistryBuilder {
    /// Add a strategy under its own reported pattern
    pub fn strategy(mut self, handler: Arc<dyn HandlerStrategy>) -> Self {
        self.routes
            .push((handler.topic_pattern().to_string(), handler));
        self
    }

    /// Add a handler under an explicit pattern
    pub fn route(mut self, pattern: impl Into<String>, handler: Arc<dyn HandlerStrategy>) -> Self {
        self.routes.push((pattern.into(), handler));
        self
    }

    /// Add a batch of strategies, each under its own pattern
    pub fn strategies<I>(self, handlers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn HandlerStrategy>>,
    {
        handlers.into_iter().fold(self, Self::strategy)
    }

    pub fn build(self) -> Result<DispatchRegistry, DispatchError> {
        let mut registry = DispatchRegistry::new();
        for (pattern, handler) in self.routes {
            registry.register(&pattern, handler)?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::strategy::FnHandler;

    fn noop(pattern: &str) -> Arc<dyn HandlerStrategy> {
        Arc::new(FnHandler::new(pattern, |_| async { Ok(()) }))
    }

    #[test]
    fn test_resolve_full_match_only() {
        let mut registry = DispatchRegistry::new();
        registry.register("/api/v1/.*mqtt/dataResp", noop("/api/v1/.*mqtt/dataResp")).unwrap();

        assert!(registry.resolve("/api/v1/device123/mqtt/dataResp").is_some());
        // Substring hits are not matches
        assert!(registry.resolve("/prefix/api/v1/x/mqtt/dataResp").is_none());
        assert!(registry.resolve("/api/v1/x/mqtt/dataResp/extra").is_none());
        assert!(registry.resolve("/unknown/topic").is_none());
    }

    #[test]
    fn test_alternation_is_anchored_as_a_whole() {
        let mut registry = DispatchRegistry::new();
        registry.register("a|b", noop("a|b")).unwrap();

        assert!(registry.resolve("a").is_some());
        assert!(registry.resolve("b").is_some());
        assert!(registry.resolve("ab").is_none());
        assert!(registry.resolve("xa").is_none());
    }

    #[test]
    fn test_reregistration_replaces_handler() {
        let first = noop("/x/.*");
        let second = noop("/x/.*");
        let mut registry = DispatchRegistry::new();

        assert!(registry.register("/x/.*", first.clone()).unwrap().is_none());
        let replaced = registry.register("/x/.*", second.clone()).unwrap();

        assert!(Arc::ptr_eq(&replaced.unwrap(), &first));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.resolve("/x/1").unwrap(), &second));
    }

    #[test]
    fn test_first_registered_wins_on_overlap() {
        let broad = noop("/api/.*");
        let narrow = noop("/api/v1/.*");
        let registry = DispatchRegistry::builder()
            .strategy(broad.clone())
            .strategy(narrow.clone())
            .build()
            .unwrap();

        let resolved = registry.resolve("/api/v1/thing").unwrap();
        assert!(Arc::ptr_eq(&resolved, &broad));
    }

    #[test]
    fn test_replacement_keeps_position() {
        let broad = noop("/api/.*");
        let narrow = noop("/api/v1/.*");
        let broad_again = noop("/api/.*");
        let mut registry = DispatchRegistry::builder()
            .strategy(broad)
            .strategy(narrow)
            .build()
            .unwrap();

        registry.register("/api/.*", broad_again.clone()).unwrap();

        let resolved = registry.resolve("/api/v1/thing").unwrap();
        assert!(Arc::ptr_eq(&resolved, &broad_again));
        assert_eq!(registry.patterns().collect::<Vec<_>>(), vec!["/api/.*", "/api/v1/.*"]);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut registry = DispatchRegistry::new();
        let err = registry.register("/api/(unclosed", noop("/api/(unclosed")).err().unwrap();
        assert!(err.to_string().contains("/api/(unclosed"));
        assert!(registry.is_empty());

        let built = DispatchRegistry::builder().strategy(noop("[")).build();
        assert!(built.is_err());
    }

    #[test]
    fn test_explicit_route_overrides_reported_pattern() {
        let handler = noop("/reported/.*");
        let registry = DispatchRegistry::builder()
            .route("/explicit/.*", handler)
            .build()
            .unwrap();

        assert!(registry.resolve("/explicit/1").is_some());
        assert!(registry.resolve("/reported/1").is_none());
    }

    #[test]
    fn test_resolve_entry_reports_pattern() {
        let registry = DispatchRegistry::builder()
            .strategies(vec![noop("/a/.*"), noop("/b/.*")])
            .build()
            .unwrap();

        assert_eq!(registry.resolve_entry("/b/1").unwrap().pattern(), "/b/.*");
        assert_eq!(registry.len(), 2);
    }
}
