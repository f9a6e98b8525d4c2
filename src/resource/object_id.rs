//! All Kubernetes resources have an id, which is the combination of the
//! `namespace` and `name` fields from the `metadata`. This is also the natural
//! key that the derived `EntityId` of each row is computed from.
//!
//! Both of the structs defined here are just holders of a namespace and name.
//! `ObjectId` represents an _owned_ object id, which `ObjectIdRef` represents
//! one that _borrows_ its fields (typically from a json `Value`).
//!
//! ### Note on optional namespaces
//!
//! Namespaces are optional on many Kuberentes resources. Both representations
//! of object ids represent missing namespaces as empty strings. The `namespace()`
//! function will return an `Option<&str>` to help with cases where you need to determine
//! if a namespace is present or not.
use crate::identity::EntityId;

use std::fmt::{self, Display};

/// An owned Object Id
#[derive(Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct ObjectId {
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    /// create a new `ObjectId` from owned Strings
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> ObjectId {
        ObjectId {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses a watch key of the form `namespace/name`, or just `name` for non-namespaced objects
    pub fn from_key(key: &str) -> ObjectId {
        match key.find('/') {
            Some(idx) => ObjectId::new(&key[..idx], &key[(idx + 1)..]),
            None => ObjectId::new("", key),
        }
    }

    /// return an `ObjectIdRef` that borrows its fields from this id
    pub fn as_id_ref(&self) -> ObjectIdRef {
        ObjectIdRef {
            namespace: &self.namespace,
            name: &self.name,
        }
    }

    /// Returns an option containing a non-empty namespace. Will return None
    /// if the namespace is an empty string.
    pub fn namespace(&self) -> Option<&str> {
        self.as_id_ref().namespace()
    }

    /// returns the name
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn entity_id(&self) -> EntityId {
        self.as_id_ref().entity_id()
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.as_id_ref().fmt(f)
    }
}

/// An id that borrows its fields
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ObjectIdRef<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
}

impl<'a> ObjectIdRef<'a> {
    /// Returns a new id with the given namespace and name fields
    pub fn new(namespace: &'a str, name: &'a str) -> ObjectIdRef<'a> {
        ObjectIdRef { namespace, name }
    }

    /// Create an owned `ObjectId` by copying the borrowed fields to
    /// newly allocated ones
    pub fn to_owned(&self) -> ObjectId {
        ObjectId {
            namespace: self.namespace.to_owned(),
            name: self.name.to_owned(),
        }
    }

    /// Returns an option containing a non-empty namespace. Will return None
    /// if the namespace is an empty string.
    pub fn namespace(&self) -> Option<&'a str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(self.namespace)
        }
    }

    /// returns the name field
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// The derived row id for the object with this namespace and name
    pub fn entity_id(&self) -> EntityId {
        EntityId::object(self.namespace, self.name)
    }
}

impl<'a> Display for ObjectIdRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl<'a> PartialEq<ObjectIdRef<'a>> for ObjectId {
    fn eq(&self, other: &ObjectIdRef<'a>) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl<'a> PartialEq<ObjectId> for ObjectIdRef<'a> {
    fn eq(&self, other: &ObjectId) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl<'a> From<&'a ObjectId> for ObjectIdRef<'a> {
    fn from(id: &'a ObjectId) -> ObjectIdRef<'a> {
        id.as_id_ref()
    }
}

impl<'a> From<(&'a str, &'a str)> for ObjectIdRef<'a> {
    fn from((namespace, name): (&'a str, &'a str)) -> ObjectIdRef<'a> {
        ObjectIdRef { namespace, name }
    }
}

impl<'a, 'b> From<&'b ObjectIdRef<'a>> for ObjectIdRef<'a> {
    fn from(other: &'b ObjectIdRef<'a>) -> ObjectIdRef<'a> {
        *other
    }
}
