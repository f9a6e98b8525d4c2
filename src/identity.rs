//! Derived identifiers for cluster entities.
//!
//! Every row that represents something in the cluster is keyed by an `EntityId`, which is the SHA-1
//! digest of the entity's natural key. Because the id is a pure function of the key, the same pod
//! maps to the same row across restarts and across independent reconciliation passes, and dependent
//! tables can carry the id as a foreign key without looking anything up first.
//!
//! Composite keys are joined with `/` before hashing. Kubernetes never allows a `/` inside a
//! namespace, pod, or container name, so `("a", "b/c")` and `("a/b", "c")` can never both occur.
use openssl::sha::Sha1;

use std::fmt::{self, Debug, Display};

pub const ID_LEN: usize = 20;

const KEY_SEPARATOR: &[u8] = b"/";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId([u8; ID_LEN]);

impl EntityId {
    /// Hashes the given key components in order, separated by `/`
    pub fn of(parts: &[&str]) -> EntityId {
        let mut hasher = Sha1::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                hasher.update(KEY_SEPARATOR);
            }
            hasher.update(part.as_bytes());
        }
        EntityId(hasher.finish())
    }

    /// The id of the cluster itself. There's only ever one cluster per database, so this is the
    /// hash of the empty key.
    pub fn cluster() -> EntityId {
        EntityId::of(&[])
    }

    pub fn node(node_name: &str) -> EntityId {
        EntityId::of(&[node_name])
    }

    /// Id for any namespaced object, like a pod or a persistent volume claim
    pub fn object(namespace: &str, name: &str) -> EntityId {
        EntityId::of(&[namespace, name])
    }

    pub fn container(namespace: &str, pod_name: &str, container_name: &str) -> EntityId {
        EntityId::of(&[namespace, pod_name, container_name])
    }

    /// Labels are keyed case insensitively on both name and value
    pub fn label(name: &str, value: &str) -> EntityId {
        let key = format!("{}:{}", name, value).to_lowercase();
        EntityId::of(&[key.as_str()])
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<EntityId> {
        if bytes.len() != ID_LEN {
            return None;
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Some(EntityId(id))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EntityId({})", self)
    }
}
