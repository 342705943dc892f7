//! Catalog Merger
//!
//! Turns the raw records of one scan cycle into the catalog the UI sees and
//! publishes it as an immutable snapshot. Readers always get a complete
//! catalog, either the previous one or the new one.

use crate::library::{GameRecord, IdentityKey};
use crate::persistence::RecentList;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Unique by identity key, in display order
    pub games: Vec<GameRecord>,
    /// Most recent first; may name games that are currently not installed
    pub recent: Vec<IdentityKey>,
}

impl Catalog {
    pub fn find(&self, id: &IdentityKey) -> Option<&GameRecord> {
        self.games.iter().find(|game| &game.id == id)
    }

    /// Recently launched games that are present in this catalog.
    pub fn recent_games(&self) -> impl Iterator<Item = &GameRecord> + '_ {
        self.recent.iter().filter_map(|id| self.find(id))
    }
}

// Lower wins when two sources report the same key
fn preference(a: &GameRecord, b: &GameRecord) -> Ordering {
    a.source
        .cmp(&b.source)
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.launch.cmp(&b.launch))
        .then_with(|| a.icon.cmp(&b.icon))
}

fn display_order(a: &GameRecord, b: &GameRecord) -> Ordering {
    a.name
        .to_lowercase()
        .cmp(&b.name.to_lowercase())
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.id.cmp(&b.id))
}

/// Deduplicates by identity key and sorts for display.
///
/// The result does not depend on the order of `records`.
pub fn merge(records: impl IntoIterator<Item = GameRecord>) -> Vec<GameRecord> {
    let mut by_key: HashMap<IdentityKey, GameRecord> = HashMap::new();
    for record in records {
        match by_key.entry(record.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if preference(&record, slot.get()) == Ordering::Less {
                    debug!(
                        "{} from {} replaces {}",
                        record.id,
                        record.source,
                        slot.get().source
                    );
                    slot.insert(record);
                }
            }
        }
    }

    let mut games: Vec<GameRecord> = by_key.into_values().collect();
    games.sort_by(display_order);
    games
}

/// Owner of the current catalog snapshot and the recency list.
pub struct CatalogStore {
    sender: watch::Sender<Arc<Catalog>>,
    recent: Mutex<RecentList>,
    recent_path: PathBuf,
}

impl CatalogStore {
    pub fn new(recent: RecentList, recent_path: PathBuf) -> Self {
        let initial = Catalog {
            games: Vec::new(),
            recent: recent.entries().to_vec(),
        };
        let (sender, _) = watch::channel(Arc::new(initial));
        Self {
            sender,
            recent: Mutex::new(recent),
            recent_path,
        }
    }

    pub fn snapshot(&self) -> Arc<Catalog> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Catalog>> {
        self.sender.subscribe()
    }

    /// Replaces the game list with the merge of `records`.
    pub async fn publish(&self, records: Vec<GameRecord>) {
        let games = merge(records);
        let recent = self.recent.lock().await;
        info!("Publishing catalog with {} games", games.len());
        self.sender.send_replace(Arc::new(Catalog {
            games,
            recent: recent.entries().to_vec(),
        }));
    }

    /// Promotes `key` in the recency list, persists it and publishes the change.
    ///
    /// The new snapshot is published even if persisting fails; the error is returned.
    pub async fn record_launch(&self, key: &IdentityKey) -> Result<()> {
        let mut recent = self.recent.lock().await;
        recent.promote(key.clone());
        let saved = recent.save(&self.recent_path).await;
        if let Err(e) = &saved {
            warn!("Recent list not persisted: {}", e);
        }

        let games = self.snapshot().games.clone();
        self.sender.send_replace(Arc::new(Catalog {
            games,
            recent: recent.entries().to_vec(),
        }));
        saved
    }

    /// Drops `key` from the recency list, persisting and publishing when it was there.
    ///
    /// Returns whether anything was removed.
    pub async fn forget(&self, key: &IdentityKey) -> Result<bool> {
        let mut recent = self.recent.lock().await;
        if !recent.remove(key) {
            debug!("{} is not in the recent list", key);
            return Ok(false);
        }
        info!("Forgetting {}", key);

        let saved = recent.save(&self.recent_path).await;
        if let Err(e) = &saved {
            warn!("Recent list not persisted: {}", e);
        }
        let games = self.snapshot().games.clone();
        self.sender.send_replace(Arc::new(Catalog {
            games,
            recent: recent.entries().to_vec(),
        }));
        saved.map(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::scanner::testing::record;
    use crate::library::SourceTag;

    fn foo_from_steam_and_custom() -> Vec<GameRecord> {
        vec![
            record(SourceTag::Steam, IdentityKey::steam("123"), "Foo"),
            record(SourceTag::Custom, IdentityKey::steam("123"), "foo.x86_64"),
            record(SourceTag::Lutris, IdentityKey::lutris("bar"), "bar"),
            record(SourceTag::Flatpak, IdentityKey::flatpak("org.a.Alpha"), "Alpha"),
        ]
    }

    #[test]
    fn same_key_keeps_highest_priority_source_in_any_order() {
        let forward = merge(foo_from_steam_and_custom());
        let mut reversed_input = foo_from_steam_and_custom();
        reversed_input.reverse();
        let reversed = merge(reversed_input);

        assert_eq!(forward, reversed);
        let foo: Vec<_> = forward
            .iter()
            .filter(|g| g.id == IdentityKey::steam("123"))
            .collect();
        assert_eq!(foo.len(), 1);
        assert_eq!(foo[0].name, "Foo");
        assert_eq!(foo[0].source, SourceTag::Steam);
    }

    #[test]
    fn games_sort_case_insensitively() {
        let names: Vec<_> = merge(foo_from_steam_and_custom())
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "bar", "Foo"]);
    }

    fn store(name: &str, cap: usize) -> (CatalogStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "controllerlaunch-catalog-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("recent.toml");
        (CatalogStore::new(RecentList::new(cap), path.clone()), dir)
    }

    #[tokio::test]
    async fn launches_promote_persist_and_publish() {
        let (store, dir) = store("launch", 2);
        let mut updates = store.subscribe();
        store.publish(foo_from_steam_and_custom()).await;
        assert!(updates.has_changed().unwrap());
        updates.borrow_and_update();

        store.record_launch(&IdentityKey::steam("123")).await.unwrap();
        store.record_launch(&IdentityKey::lutris("bar")).await.unwrap();
        store.record_launch(&IdentityKey::flatpak("org.a.Alpha")).await.unwrap();
        store.record_launch(&IdentityKey::lutris("bar")).await.unwrap();
        assert!(updates.has_changed().unwrap());

        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.recent,
            vec![IdentityKey::lutris("bar"), IdentityKey::flatpak("org.a.Alpha")]
        );
        assert_eq!(snapshot.games.len(), 3);

        let persisted = RecentList::load(&dir.join("recent.toml"), 2).await;
        assert_eq!(persisted.entries(), snapshot.recent.as_slice());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn forget_persists_and_publishes() {
        let (store, dir) = store("forget", 20);
        store.publish(foo_from_steam_and_custom()).await;
        store.record_launch(&IdentityKey::steam("123")).await.unwrap();
        store.record_launch(&IdentityKey::lutris("bar")).await.unwrap();

        let mut updates = store.subscribe();
        updates.borrow_and_update();
        assert!(store.forget(&IdentityKey::steam("123")).await.unwrap());
        assert!(updates.has_changed().unwrap());
        assert_eq!(store.snapshot().recent, vec![IdentityKey::lutris("bar")]);
        assert_eq!(store.snapshot().games.len(), 3);

        let persisted = RecentList::load(&dir.join("recent.toml"), 20).await;
        assert_eq!(persisted.entries(), &[IdentityKey::lutris("bar")]);

        updates.borrow_and_update();
        assert!(!store.forget(&IdentityKey::steam("123")).await.unwrap());
        assert!(!updates.has_changed().unwrap());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn rescans_keep_the_recency_list() {
        let (store, dir) = store("rescan", 20);
        store.publish(foo_from_steam_and_custom()).await;
        store.record_launch(&IdentityKey::steam("123")).await.unwrap();

        store.publish(Vec::new()).await;
        let snapshot = store.snapshot();
        assert!(snapshot.games.is_empty());
        assert_eq!(snapshot.recent, vec![IdentityKey::steam("123")]);
        assert_eq!(snapshot.recent_games().count(), 0);

        let _ = std::fs::remove_dir_all(dir);
    }
}
