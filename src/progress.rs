use std::collections::HashMap;
use std::sync::mpsc::Sender;

use crate::models::{CollectionItem, EngineEvent};

/// Authoritative in-memory map of `folder_id -> CollectionItem`.
///
/// Subscribers receive immutable snapshots as [`EngineEvent`]s; the engine
/// alone mutates the map, so the UI never owns the data.
pub struct CollectionMap {
    items: HashMap<i64, CollectionItem>,
    events: Option<Sender<EngineEvent>>,
}

impl CollectionMap {
    pub fn new(events: Option<Sender<EngineEvent>>) -> Self {
        Self {
            items: HashMap::new(),
            events,
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub fn get(&self, folder_id: i64) -> Option<CollectionItem> {
        self.items.get(&folder_id).cloned()
    }

    pub fn insert(&mut self, item: CollectionItem) {
        self.items.insert(item.folder_id, item.clone());
        self.emit(EngineEvent::CollectionAdded(item));
    }

    /// Mutates the item for `folder_id` in place and emits an update event.
    /// Unknown folders are logged and skipped; every mutation site runs after
    /// the folder was registered.
    pub fn with(&mut self, folder_id: i64, f: impl FnOnce(&mut CollectionItem)) {
        match self.items.get_mut(&folder_id) {
            Some(item) => {
                f(item);
                let snapshot = item.clone();
                self.emit(EngineEvent::CollectionUpdated(snapshot));
            }
            None => log::warn!("no collection item for folder {folder_id}"),
        }
    }

    pub fn remove(&mut self, folder_id: i64) {
        if self.items.remove(&folder_id).is_some() {
            self.emit(EngineEvent::FolderRemoved { folder_id });
        }
    }

    /// Replaces the map wholesale from a database read, emitting one add
    /// event per item.
    pub fn replace_all(&mut self, items: Vec<CollectionItem>) {
        self.items.clear();
        for item in items {
            self.insert(item);
        }
    }

    pub fn contains(&self, folder_id: i64) -> bool {
        self.items.contains_key(&folder_id)
    }
}
