//! Keyed connection bookkeeping for bulk fire/disconnect.
//!
//! Hosts that compose a pacer with pub/sub often need to tear down every
//! callback belonging to one logical owner (a scene, a screen, a plugin) in
//! one call. [`KeyedConnections`] maps an application-defined key to a set
//! of fire-able, disconnect-capable handles. It is a plain owned value —
//! construct one per composing component and pass it through constructors;
//! there is no process-wide instance.

use std::collections::HashMap;

/// Identifier of a single connection, unique within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

struct Binding<T> {
    id: ConnectionId,
    callback: Box<dyn FnMut(&T) + Send>,
}

/// Keyed registry of fire-able callbacks.
///
/// # Example
///
/// ```ignore
/// let mut registry = KeyedConnections::new();
/// registry.connect("hud", |damage: &u32| println!("hit for {damage}"));
/// registry.fire("hud", &12);
/// registry.disconnect_key("hud");
/// ```
pub struct KeyedConnections<T> {
    next_id: u64,
    slots: HashMap<String, Vec<Binding<T>>>,
}

impl<T> Default for KeyedConnections<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> KeyedConnections<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 0,
            slots: HashMap::new(),
        }
    }

    /// Register `callback` under `key` and return its connection id.
    pub fn connect(
        &mut self,
        key: impl Into<String>,
        callback: impl FnMut(&T) + Send + 'static,
    ) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.slots.entry(key.into()).or_default().push(Binding {
            id,
            callback: Box::new(callback),
        });
        id
    }

    /// Invoke every callback registered under `key` with `payload`.
    ///
    /// Returns the number of callbacks fired (zero for an unknown key).
    pub fn fire(&mut self, key: &str, payload: &T) -> usize {
        let Some(bindings) = self.slots.get_mut(key) else {
            return 0;
        };
        for binding in bindings.iter_mut() {
            (binding.callback)(payload);
        }
        bindings.len()
    }

    /// Remove a single connection by id. Returns whether it existed.
    pub fn disconnect(&mut self, id: ConnectionId) -> bool {
        let mut removed = false;
        self.slots.retain(|_, bindings| {
            let before = bindings.len();
            bindings.retain(|binding| binding.id != id);
            removed |= bindings.len() != before;
            !bindings.is_empty()
        });
        removed
    }

    /// Remove every connection under `key`. Returns how many were dropped.
    pub fn disconnect_key(&mut self, key: &str) -> usize {
        self.slots.remove(key).map_or(0, |bindings| bindings.len())
    }

    /// Remove every connection in the registry. Returns how many were dropped.
    pub fn disconnect_all(&mut self) -> usize {
        let count = self.connection_count();
        self.slots.clear();
        count
    }

    /// Total live connections across all keys.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.slots.values().map(Vec::len).sum()
    }

    /// Number of keys with at least one live connection.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.slots.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
