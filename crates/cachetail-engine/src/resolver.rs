use cachetail_types::{ContentKey, GameKey, ResolvedApp};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Read-only snapshot of the external content-key → app mapping.
///
/// The mapping table is produced elsewhere; the pipeline must never block on
/// a per-line lookup, so the runtime refreshes a whole snapshot periodically
/// and every lookup reads the current `Arc` without touching the store. An
/// unresolved key simply yields a placeholder game key and stays eligible for
/// relabeling once a later snapshot contains it.
pub struct ResolverCache {
    snapshot: RwLock<Arc<HashMap<u32, ResolvedApp>>>,
}

impl ResolverCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Replace the snapshot wholesale. Readers holding the previous `Arc`
    /// keep a consistent view until their lookup completes.
    pub fn install(&self, mappings: Vec<(u32, ResolvedApp)>) {
        let map: HashMap<u32, ResolvedApp> = mappings.into_iter().collect();
        let mut guard = self.snapshot.write().expect("resolver snapshot poisoned");
        *guard = Arc::new(map);
    }

    pub fn resolve(&self, key: &ContentKey) -> Option<ResolvedApp> {
        match key {
            ContentKey::SteamDepot(depot_id) => {
                let snapshot = self
                    .snapshot
                    .read()
                    .expect("resolver snapshot poisoned")
                    .clone();
                snapshot.get(depot_id).cloned()
            }
            // Only Steam depots have a mapping table today; other keys stay raw.
            ContentKey::BlizzardArchive(_) | ContentKey::None => None,
        }
    }

    /// Game key for a content key: the resolved app when known, otherwise the
    /// raw key as a placeholder.
    pub fn game_key_for(&self, key: &ContentKey) -> GameKey {
        match self.resolve(key) {
            Some(app) => GameKey::App(app),
            None => GameKey::Content(key.clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot
            .read()
            .expect("resolver snapshot poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResolverCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_key_yields_placeholder() {
        let resolver = ResolverCache::new();
        let key = ContentKey::SteamDepot(441);

        assert_eq!(resolver.resolve(&key), None);
        assert_eq!(resolver.game_key_for(&key), GameKey::Content(key));
    }

    #[test]
    fn installed_snapshot_resolves() {
        let resolver = ResolverCache::new();
        resolver.install(vec![(
            441,
            ResolvedApp {
                app_id: 730,
                name: Some("Counter-Strike 2".to_string()),
            },
        )]);

        let game = resolver.game_key_for(&ContentKey::SteamDepot(441));
        assert_eq!(game.app_id(), Some(730));
        assert!(game.is_resolved());
    }

    #[test]
    fn reinstall_replaces_previous_snapshot() {
        let resolver = ResolverCache::new();
        resolver.install(vec![(1, ResolvedApp { app_id: 10, name: None })]);
        resolver.install(vec![(2, ResolvedApp { app_id: 20, name: None })]);

        assert_eq!(resolver.resolve(&ContentKey::SteamDepot(1)), None);
        assert_eq!(
            resolver.resolve(&ContentKey::SteamDepot(2)).map(|a| a.app_id),
            Some(20)
        );
    }

    #[test]
    fn non_steam_keys_never_resolve() {
        let resolver = ResolverCache::new();
        let key = ContentKey::BlizzardArchive("3bf0".to_string());
        assert_eq!(resolver.resolve(&key), None);
    }
}
