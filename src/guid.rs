//! External-id matching.
//!
//! Backends only share provider GUIDs (`imdb://tt…`, `tmdb://…`), so identity
//! is decided by guid-set intersection. The [`GuidIndex`] keeps lookups
//! constant time per guid pair instead of scanning every entity.

use std::collections::HashMap;

use crate::entity::{EntityId, GuidMap, MediaKind};

/// Lowercase, trimmed provider scheme. Plex legacy agents
/// (`com.plexapp.agents.imdb`) collapse to their last segment, and agent
/// names map to the provider ids other servers use.
pub fn normalize_scheme(scheme: &str) -> String {
    let scheme = scheme.trim().to_lowercase();
    let scheme = match scheme.rsplit_once('.') {
        Some((_, last)) if !last.is_empty() => last.to_string(),
        _ => scheme,
    };
    match scheme.as_str() {
        "thetvdb" => "tvdb".to_string(),
        "themoviedb" => "tmdb".to_string(),
        _ => scheme,
    }
}

/// Parse `scheme://value` (optionally with a `?query` suffix) into a pair.
pub fn parse_guid_uri(uri: &str) -> Option<(String, String)> {
    let (scheme, rest) = uri.split_once("://")?;
    let value = rest.split('?').next().unwrap_or_default().trim();
    let scheme = normalize_scheme(scheme);
    if scheme.is_empty() || value.is_empty() {
        return None;
    }
    Some((scheme, value.to_string()))
}

/// True iff the two sets share at least one (scheme, value) pair.
pub fn intersects(a: &GuidMap, b: &GuidMap) -> bool {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .any(|(scheme, value)| large.get(scheme) == Some(value))
}

/// Add the schemes of `incoming` that `existing` lacks. Existing values are
/// never overwritten. Returns the number of schemes added.
pub fn union_first_seen(existing: &mut GuidMap, incoming: &GuidMap) -> usize {
    let mut added = 0;
    for (scheme, value) in incoming {
        if !existing.contains_key(scheme) {
            existing.insert(scheme.clone(), value.clone());
            added += 1;
        }
    }
    added
}

/// Stable entity key derived from the guid set at creation time.
pub fn entity_key(kind: MediaKind, guids: &GuidMap) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.to_string().as_bytes());
    for (scheme, value) in guids {
        hasher.update(b"\x1f");
        hasher.update(scheme.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hasher.finalize().to_hex()[..32].to_string()
}

/// Key for an entity with no guids: only its origin identifies it.
pub fn local_key(backend: &str, item_id: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"local\x1f");
    hasher.update(backend.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(item_id.as_bytes());
    hasher.finalize().to_hex()[..32].to_string()
}

/// (scheme, value) → entity handle
#[derive(Debug, Default, Clone)]
pub struct GuidIndex {
    pairs: HashMap<(String, String), EntityId>,
}

impl GuidIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every pair of `guids` for `id`. A pair already owned by
    /// another entity keeps its first owner.
    pub fn register(&mut self, id: EntityId, guids: &GuidMap) {
        for (scheme, value) in guids {
            self.pairs
                .entry((scheme.clone(), value.clone()))
                .or_insert(id);
        }
    }

    /// Distinct entities owning any pair of `guids`, lowest handle first.
    pub fn candidates(&self, guids: &GuidMap) -> Vec<EntityId> {
        let mut found: Vec<EntityId> = guids
            .iter()
            .filter_map(|(scheme, value)| {
                self.pairs.get(&(scheme.clone(), value.clone())).copied()
            })
            .collect();
        found.sort();
        found.dedup();
        found
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guids(pairs: &[(&str, &str)]) -> GuidMap {
        pairs
            .iter()
            .map(|(s, v)| (s.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_normalize_scheme() {
        assert_eq!(normalize_scheme("IMDB"), "imdb");
        assert_eq!(normalize_scheme(" tmdb "), "tmdb");
        assert_eq!(normalize_scheme("com.plexapp.agents.thetvdb"), "tvdb");
        assert_eq!(normalize_scheme("com.plexapp.agents.themoviedb"), "tmdb");
        assert_eq!(normalize_scheme("Tvdb"), "tvdb");
    }

    #[test]
    fn test_parse_guid_uri() {
        assert_eq!(
            parse_guid_uri("imdb://tt0111161"),
            Some(("imdb".to_string(), "tt0111161".to_string()))
        );
        assert_eq!(
            parse_guid_uri("com.plexapp.agents.imdb://tt0111161?lang=en"),
            Some(("imdb".to_string(), "tt0111161".to_string()))
        );
        assert_eq!(
            parse_guid_uri("com.plexapp.agents.thetvdb://81189/1/1?lang=en"),
            Some(("tvdb".to_string(), "81189/1/1".to_string()))
        );
        assert_eq!(parse_guid_uri("plex://"), None);
        assert_eq!(parse_guid_uri("not a guid"), None);
    }

    #[test]
    fn test_intersects() {
        let a = guids(&[("imdb", "tt1"), ("tmdb", "10")]);
        let b = guids(&[("tvdb", "5"), ("tmdb", "10")]);
        let c = guids(&[("imdb", "tt2")]);
        assert!(intersects(&a, &b));
        assert!(intersects(&b, &a));
        assert!(!intersects(&a, &c));
        assert!(!intersects(&a, &GuidMap::new()));
    }

    #[test]
    fn test_same_scheme_different_value_does_not_match() {
        let a = guids(&[("imdb", "tt1")]);
        let b = guids(&[("imdb", "tt10")]);
        assert!(!intersects(&a, &b));
    }

    #[test]
    fn test_union_first_seen_keeps_existing_values() {
        let mut existing = guids(&[("imdb", "tt1")]);
        let added = union_first_seen(&mut existing, &guids(&[("imdb", "tt9"), ("tmdb", "10")]));
        assert_eq!(added, 1);
        assert_eq!(existing.get("imdb").map(String::as_str), Some("tt1"));
        assert_eq!(existing.get("tmdb").map(String::as_str), Some("10"));
    }

    #[test]
    fn test_entity_key_is_stable_and_kind_sensitive() {
        let g = guids(&[("imdb", "tt1"), ("tmdb", "10")]);
        assert_eq!(entity_key(MediaKind::Movie, &g), entity_key(MediaKind::Movie, &g.clone()));
        assert_ne!(entity_key(MediaKind::Movie, &g), entity_key(MediaKind::Episode, &g));
        assert_eq!(entity_key(MediaKind::Movie, &g).len(), 32);
        assert_ne!(local_key("plex", "1"), local_key("jelly", "1"));
    }

    #[test]
    fn test_index_first_owner_wins() {
        let mut index = GuidIndex::new();
        index.register(EntityId(1), &guids(&[("imdb", "tt1")]));
        index.register(EntityId(2), &guids(&[("imdb", "tt1"), ("tmdb", "7")]));

        assert_eq!(index.candidates(&guids(&[("imdb", "tt1")])), vec![EntityId(1)]);
        assert_eq!(
            index.candidates(&guids(&[("imdb", "tt1"), ("tmdb", "7")])),
            vec![EntityId(1), EntityId(2)]
        );

        index.clear();
        assert!(index.is_empty());
    }
}
