//! Hub registry: `hub_id -> (terminal_id -> hub)`.
//!
//! The terminal table for a hub id is created on first registration. The lock covers one
//! lookup or update and is never held while a hub runs.

use super::Hub;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Table = HashMap<u8, HashMap<u8, Arc<dyn Hub>>>;

/// At most one live hub per `(hub_id, terminal_id)`.
#[derive(Default)]
pub struct HubRegistry {
    hubs: Mutex<Table>,
}

fn same_hub(a: &Arc<dyn Hub>, b: &Arc<dyn Hub>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl HubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        match self.hubs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `hub` under its own ids, replacing (and returning) any previous hub there.
    pub fn register(&self, hub: Arc<dyn Hub>) -> Option<Arc<dyn Hub>> {
        let (hub_id, terminal_id) = (hub.id(), hub.terminal_id());
        let previous = self
            .table()
            .entry(hub_id)
            .or_default()
            .insert(terminal_id, hub);
        if previous.is_some() {
            log::debug!("hub {}/{} replaced", hub_id, terminal_id);
        }
        previous
    }

    /// Remove whatever is registered at the key. Removing an absent entry does nothing.
    pub fn unregister(&self, hub_id: u8, terminal_id: u8) -> Option<Arc<dyn Hub>> {
        let mut table = self.table();
        let terminals = table.get_mut(&hub_id)?;
        let removed = terminals.remove(&terminal_id);
        if terminals.is_empty() {
            table.remove(&hub_id);
        }
        removed
    }

    /// Remove `hub` only if that exact instance is still registered at its key.
    pub fn unregister_exact(&self, hub: &Arc<dyn Hub>) -> bool {
        let (hub_id, terminal_id) = (hub.id(), hub.terminal_id());
        let mut table = self.table();
        let Some(terminals) = table.get_mut(&hub_id) else {
            return false;
        };
        match terminals.get(&terminal_id) {
            Some(current) if same_hub(current, hub) => {
                terminals.remove(&terminal_id);
                if terminals.is_empty() {
                    table.remove(&hub_id);
                }
                true
            }
            _ => false,
        }
    }

    pub fn resolve(&self, hub_id: u8, terminal_id: u8) -> Option<Arc<dyn Hub>> {
        self.table()
            .get(&hub_id)
            .and_then(|terminals| terminals.get(&terminal_id))
            .cloned()
    }

    /// Number of registered hubs across all ids.
    pub fn len(&self) -> usize {
        self.table().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.table().clear();
    }
}
