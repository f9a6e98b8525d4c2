use crate::resource::{ObjectId, ObjectIdRef};

use std::collections::{HashMap, HashSet};

/// A set of object ids, grouped by namespace so that lookups can borrow their keys
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IdSet(HashMap<String, HashSet<String>>);

impl IdSet {
    pub fn new() -> IdSet {
        IdSet(HashMap::new())
    }

    /// Returns true if the id was not in the set already
    pub fn insert(&mut self, id: ObjectId) -> bool {
        let ObjectId { namespace, name } = id;
        self.0.entry(namespace).or_default().insert(name)
    }

    pub fn contains<'a>(&self, id: impl Into<ObjectIdRef<'a>>) -> bool {
        let id = id.into();
        self.0
            .get(id.namespace)
            .map(|by_name| by_name.contains(id.name))
            .unwrap_or(false)
    }

    /// Returns true if the id was in the set
    pub fn remove<'a>(&mut self, id: impl Into<ObjectIdRef<'a>>) -> bool {
        let id = id.into();
        let removed = match self.0.get_mut(id.namespace) {
            Some(by_name) => by_name.remove(id.name),
            None => false,
        };
        if removed && self.0.get(id.namespace).map_or(false, HashSet::is_empty) {
            self.0.remove(id.namespace);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectIdRef> {
        self.0.iter().flat_map(|(namespace, by_name)| {
            by_name.iter().map(move |name| ObjectIdRef { namespace, name })
        })
    }

    /// Returns the ids in this set that are not in `other`
    pub fn difference(&self, other: &IdSet) -> Vec<ObjectId> {
        self.iter()
            .filter(|id| !other.contains(*id))
            .map(|id| id.to_owned())
            .collect()
    }
}

impl std::iter::FromIterator<ObjectId> for IdSet {
    fn from_iter<I: IntoIterator<Item = ObjectId>>(iter: I) -> IdSet {
        let mut set = IdSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inserts_and_removes_ids() {
        let mut set = IdSet::new();
        assert!(set.insert(ObjectId::new("default", "web-1")));
        assert!(!set.insert(ObjectId::new("default", "web-1")));
        assert!(set.insert(ObjectId::new("kube-system", "dns")));
        assert_eq!(2, set.len());
        assert!(set.contains(("default", "web-1")));
        assert!(!set.contains(("default", "web-2")));

        assert!(set.remove(("default", "web-1")));
        assert!(!set.remove(("default", "web-1")));
        assert_eq!(1, set.len());
        assert_eq!(vec![ObjectIdRef::new("kube-system", "dns")], set.iter().collect::<Vec<_>>());
    }

    #[test]
    fn difference_returns_ids_missing_from_the_other_set() {
        let known: IdSet = vec![ObjectId::new("a", "1"), ObjectId::new("a", "2")]
            .into_iter()
            .collect();
        let listed: IdSet = vec![ObjectId::new("a", "2"), ObjectId::new("b", "3")]
            .into_iter()
            .collect();
        assert_eq!(vec![ObjectId::new("a", "1")], known.difference(&listed));
        assert!(IdSet::new().is_empty());
    }
}
