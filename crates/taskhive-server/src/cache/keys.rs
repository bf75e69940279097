//! Structured cache key construction.
//!
//! Every key lives under a fixed namespace prefix and is built from an entity
//! type, one or more ids, and optional qualifier segments, all joined with a
//! fixed delimiter:
//!
//! ```text
//! taskhive:workspace:42:tasks:af39c2
//! ```
//!
//! Coarse pattern invalidation relies on this layout: invalidating
//! `workspace:42:` clears every finer-grained key beneath it.

use std::fmt::Display;

/// Namespace prefix shared by every cache key this process writes.
pub const CACHE_PREFIX: &str = "taskhive:";

/// Delimiter between key segments.
pub const KEY_DELIMITER: &str = ":";

/// Builder for namespaced cache keys.
pub struct CacheKey {
    segments: Vec<String>,
}

impl CacheKey {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            segments: vec![entity.into()],
        }
    }

    /// Append a single id segment.
    pub fn id(mut self, id: impl Display) -> Self {
        self.segments.push(id.to_string());
        self
    }

    /// Append an ordered sequence of ids as one segment each.
    pub fn ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        self.segments.extend(ids.into_iter().map(|i| i.to_string()));
        self
    }

    /// Append a qualifier segment (filter hash, sub-collection name, ...).
    pub fn segment(mut self, part: impl Display) -> Self {
        self.segments.push(part.to_string());
        self
    }

    pub fn build(self) -> String {
        format!("{CACHE_PREFIX}{}", self.segments.join(KEY_DELIMITER))
    }
}

/// Shorthand for the common entity/id/qualifiers shape.
pub fn cache_key(entity: &str, id: impl Display, extra: &[&str]) -> String {
    let mut key = CacheKey::new(entity).id(id);
    for part in extra {
        key = key.segment(part);
    }
    key.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_key() {
        assert_eq!(cache_key("workspace", 42, &[]), "taskhive:workspace:42");
    }

    #[test]
    fn test_key_with_qualifiers() {
        assert_eq!(
            cache_key("workspace", 42, &["tasks", "af39c2"]),
            "taskhive:workspace:42:tasks:af39c2"
        );
    }

    #[test]
    fn test_builder_with_id_sequence() {
        let key = CacheKey::new("task").ids(["7", "9"]).segment("detail").build();
        assert_eq!(key, "taskhive:task:7:9:detail");
    }

    #[test]
    fn test_coarse_pattern_prefixes_fine_keys() {
        let fine = cache_key("workspace", "W", &["tasks", "h1"]);
        let coarse = format!("{CACHE_PREFIX}workspace{KEY_DELIMITER}W{KEY_DELIMITER}");
        assert!(fine.starts_with(&coarse));
    }
}
