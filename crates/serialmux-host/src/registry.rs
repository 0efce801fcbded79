use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Identifier of an open session as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(u8);

impl SessionId {
    /// Number of distinct ids, and so the most sessions open at once.
    pub const CAPACITY: usize = u8::MAX as usize + 1;

    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<SessionId> for i64 {
    fn from(id: SessionId) -> Self {
        i64::from(id.0)
    }
}

impl TryFrom<i64> for SessionId {
    type Error = RegistryError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        u8::try_from(raw)
            .map(SessionId)
            .map_err(|_| RegistryError::OutOfRange(raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Every id is taken.
    #[error("all {} session ids are in use", SessionId::CAPACITY)]
    Exhausted,

    /// The value can never name a session.
    #[error("{0} is not a valid session id")]
    OutOfRange(i64),
}

/// Open sessions keyed by id.
///
/// Ids are handed out lowest-free-first so clients see a deterministic reuse order.
#[derive(Debug)]
pub struct SessionRegistry<S> {
    entries: BTreeMap<SessionId, S>,
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// The smallest id not currently in use.
    pub fn next_free(&self) -> Option<SessionId> {
        (0..=u8::MAX)
            .map(SessionId)
            .find(|id| !self.entries.contains_key(id))
    }

    /// Build an entry for the lowest free id and register it.
    ///
    /// `ctor` only runs when an id is available; if it fails nothing is registered.
    pub fn allocate_with<F, E>(&mut self, ctor: F) -> Result<SessionId, E>
    where
        F: FnOnce(SessionId) -> Result<S, E>,
        E: From<RegistryError>,
    {
        let id = self.next_free().ok_or(RegistryError::Exhausted)?;
        let entry = ctor(id)?;
        self.entries.insert(id, entry);
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&S> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<S> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &S)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    /// Remove every entry, lowest id first.
    pub fn drain(&mut self) -> impl Iterator<Item = (SessionId, S)> {
        std::mem::take(&mut self.entries).into_iter()
    }
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocate(registry: &mut SessionRegistry<&'static str>, name: &'static str) -> SessionId {
        registry
            .allocate_with(|_| Ok::<_, RegistryError>(name))
            .unwrap()
    }

    #[test]
    fn allocates_from_zero_upward() {
        let mut registry = SessionRegistry::new();
        assert_eq!(allocate(&mut registry, "a"), SessionId::new(0));
        assert_eq!(allocate(&mut registry, "b"), SessionId::new(1));
        assert_eq!(allocate(&mut registry, "c"), SessionId::new(2));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn reuses_lowest_freed_id_first() {
        let mut registry = SessionRegistry::new();
        for name in ["a", "b", "c", "d"] {
            allocate(&mut registry, name);
        }

        registry.remove(SessionId::new(2));
        registry.remove(SessionId::new(0));

        assert_eq!(allocate(&mut registry, "e"), SessionId::new(0));
        assert_eq!(allocate(&mut registry, "f"), SessionId::new(2));
        assert_eq!(allocate(&mut registry, "g"), SessionId::new(4));
        assert_eq!(
            registry.iter().map(|(id, _)| id.get()).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn lowest_free_holds_for_arbitrary_sequences() {
        let mut registry = SessionRegistry::new();
        let mut open = std::collections::BTreeSet::new();
        // Deterministic mix of opens and closes.
        for step in 0u32..400 {
            if step % 3 == 2 && !open.is_empty() {
                let victim = *open.iter().nth((step as usize * 7) % open.len()).unwrap();
                registry.remove(SessionId::new(victim));
                open.remove(&victim);
            } else {
                let expected = (0u8..=u8::MAX).find(|id| !open.contains(id)).unwrap();
                let id = allocate(&mut registry, "x");
                assert_eq!(id.get(), expected);
                open.insert(expected);
            }
        }
    }

    #[test]
    fn exhaustion_reported_without_running_ctor() {
        let mut registry = SessionRegistry::new();
        for _ in 0..SessionId::CAPACITY {
            allocate(&mut registry, "x");
        }

        let mut ran = false;
        let result = registry.allocate_with(|_| {
            ran = true;
            Ok::<_, RegistryError>("overflow")
        });
        assert_eq!(result, Err(RegistryError::Exhausted));
        assert!(!ran);
        assert_eq!(registry.len(), SessionId::CAPACITY);
    }

    #[test]
    fn failed_ctor_registers_nothing() {
        #[derive(Debug, PartialEq)]
        enum OpenError {
            Registry(RegistryError),
            Device,
        }
        impl From<RegistryError> for OpenError {
            fn from(err: RegistryError) -> Self {
                OpenError::Registry(err)
            }
        }

        let mut registry: SessionRegistry<&str> = SessionRegistry::new();
        let result = registry.allocate_with(|_| Err(OpenError::Device));
        assert_eq!(result, Err(OpenError::Device));
        assert!(registry.is_empty());
        assert_eq!(registry.next_free(), Some(SessionId::new(0)));
    }

    #[test]
    fn drain_empties_in_id_order() {
        let mut registry = SessionRegistry::new();
        for name in ["a", "b", "c"] {
            allocate(&mut registry, name);
        }
        registry.remove(SessionId::new(1));

        let drained: Vec<_> = registry.drain().collect();
        assert_eq!(
            drained,
            vec![(SessionId::new(0), "a"), (SessionId::new(2), "c")]
        );
        assert!(registry.is_empty());
        assert_eq!(allocate(&mut registry, "d"), SessionId::new(0));
    }

    #[test]
    fn raw_ids_outside_u8_are_rejected() {
        assert_eq!(SessionId::try_from(7), Ok(SessionId::new(7)));
        assert_eq!(SessionId::try_from(-1), Err(RegistryError::OutOfRange(-1)));
        assert_eq!(SessionId::try_from(256), Err(RegistryError::OutOfRange(256)));
    }
}
