use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::e621::ClientResult;

/// Prefixes the board reads as modifiers: exclusion and "any of".
const MODIFIERS: [char; 2] = ['-', '~'];

/// Remote lookups alias resolution needs.
#[async_trait]
pub trait TagLookup: Send + Sync {
    /// True when `name` is a tag in the board's index.
    async fn tag_exists(&self, name: &str) -> ClientResult<bool>;

    /// The active alias target of `name`, if any.
    async fn alias_of(&self, name: &str) -> ClientResult<Option<String>>;
}

/// Resolves user-written tags to canonical names, remembering every answer
/// for the lifetime of the process.
#[derive(Debug, Default)]
pub struct TagResolver {
    resolved: DashMap<String, String>,
}

impl TagResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical form of `tag` with its modifiers kept. Returns an empty string
    /// for tags the board does not know.
    pub async fn resolve<L: TagLookup + ?Sized>(&self, lookup: &L, tag: &str) -> ClientResult<String> {
        let lowered = tag.trim().to_lowercase();

        let mut prefix = String::new();
        let mut bare = lowered.as_str();
        while let Some(first) = bare.chars().next().filter(|c| MODIFIERS.contains(c)) {
            prefix.push(first);
            bare = &bare[first.len_utf8()..];
        }

        if bare.is_empty() {
            return Ok(String::new());
        }

        let cached = self.resolved.get(bare).map(|hit| hit.value().clone());
        let canonical = match cached {
            Some(hit) => hit,
            None => {
                let canonical = self.lookup_canonical(lookup, bare).await?;
                self.resolved.insert(bare.to_string(), canonical.clone());
                canonical
            }
        };

        if canonical.is_empty() {
            return Ok(canonical);
        }
        Ok(format!("{}{}", prefix, canonical))
    }

    async fn lookup_canonical<L: TagLookup + ?Sized>(&self, lookup: &L, bare: &str) -> ClientResult<String> {
        // Meta-tags and wildcards cannot be checked against the tag index.
        if bare.contains(':') || bare.contains('*') {
            return Ok(bare.to_string());
        }

        if lookup.tag_exists(bare).await? {
            return Ok(bare.to_string());
        }

        if let Some(target) = lookup.alias_of(bare).await? {
            debug!("Tag '{}' is an alias of '{}'", bare, target);
            return Ok(target);
        }

        warn!("Tag '{}' is not known to e621 and will be ignored", bare);
        Ok(String::new())
    }

    pub fn cached(&self) -> usize {
        self.resolved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeIndex {
        tags: Vec<&'static str>,
        aliases: HashMap<&'static str, &'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TagLookup for FakeIndex {
        async fn tag_exists(&self, name: &str) -> ClientResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.tags.contains(&name))
        }

        async fn alias_of(&self, name: &str) -> ClientResult<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.aliases.get(name).map(|s| s.to_string()))
        }
    }

    fn index() -> FakeIndex {
        FakeIndex {
            tags: vec!["cat", "domestic_cat"],
            aliases: [("kitty", "domestic_cat")].into_iter().collect(),
            ..FakeIndex::default()
        }
    }

    #[tokio::test]
    async fn test_exact_tag_wins() {
        let resolver = TagResolver::new();
        assert_eq!(resolver.resolve(&index(), "Cat").await.unwrap(), "cat");
    }

    #[tokio::test]
    async fn test_alias_is_followed_and_modifiers_reattached() {
        let resolver = TagResolver::new();
        let index = index();
        assert_eq!(resolver.resolve(&index, "kitty").await.unwrap(), "domestic_cat");
        assert_eq!(resolver.resolve(&index, "-kitty").await.unwrap(), "-domestic_cat");
        assert_eq!(resolver.resolve(&index, "~KITTY").await.unwrap(), "~domestic_cat");
    }

    #[tokio::test]
    async fn test_results_are_memoized_on_the_bare_tag() {
        let resolver = TagResolver::new();
        let index = index();
        resolver.resolve(&index, "kitty").await.unwrap();
        let calls = index.calls.load(Ordering::SeqCst);

        resolver.resolve(&index, "-Kitty").await.unwrap();
        resolver.resolve(&index, "kitty").await.unwrap();
        assert_eq!(index.calls.load(Ordering::SeqCst), calls);
        assert_eq!(resolver.cached(), 1);
    }

    #[tokio::test]
    async fn test_meta_and_wildcard_tags_pass_through() {
        let resolver = TagResolver::new();
        let index = index();
        assert_eq!(resolver.resolve(&index, "rating:s").await.unwrap(), "rating:s");
        assert_eq!(resolver.resolve(&index, "-cat*").await.unwrap(), "-cat*");
        assert_eq!(index.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tag_resolves_to_empty() {
        let resolver = TagResolver::new();
        assert_eq!(resolver.resolve(&index(), "-nonsense").await.unwrap(), "");
        assert_eq!(resolver.resolve(&index(), "--").await.unwrap(), "");
    }
}
