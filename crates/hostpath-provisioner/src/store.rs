use std::collections::HashMap;
use std::fmt;

use kube::{Resource, ResourceExt};
use tokio::sync::RwLock;

/// Identifies a cached object, and the work queued for it.
#[derive(Hash, Eq, PartialEq, Clone, Debug, PartialOrd, Ord)]
pub struct ObjectKey {
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    /// Key for a namespaced object.
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        ObjectKey {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Key for a cluster-scoped object.
    pub fn cluster(name: &str) -> Self {
        ObjectKey {
            namespace: None,
            name: name.to_string(),
        }
    }

    /// The object's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The object's namespace, if it is namespaced.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl<R: Resource> From<&R> for ObjectKey {
    fn from(object: &R) -> ObjectKey {
        ObjectKey {
            namespace: object.namespace(),
            name: object.name(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Local cache of one kind of object, kept current by a watch.
///
/// Only the watch task writes to the store; workers read the latest state
/// from it instead of trusting the event that queued them.
pub struct Store<K> {
    objects: RwLock<HashMap<ObjectKey, K>>,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Store {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Resource + Clone> Store<K> {
    /// Initialize empty store.
    pub fn new() -> Self {
        Store::default()
    }

    /// Insert or replace an object, returning its key.
    pub async fn insert(&self, object: K) -> ObjectKey {
        let key = ObjectKey::from(&object);
        self.objects.write().await.insert(key.clone(), object);
        key
    }

    /// Delete a cached object.
    pub async fn delete(&self, key: &ObjectKey) -> Option<K> {
        self.objects.write().await.remove(key)
    }

    /// Fetch a copy of an object.
    pub async fn get(&self, key: &ObjectKey) -> Option<K> {
        self.objects.read().await.get(key).cloned()
    }

    /// Replaces the whole cache with a fresh listing and returns the keys of
    /// objects that disappeared.
    pub async fn replace_all(&self, objects: Vec<K>) -> Vec<ObjectKey> {
        let fresh: HashMap<ObjectKey, K> = objects
            .into_iter()
            .map(|object| (ObjectKey::from(&object), object))
            .collect();
        let mut cached = self.objects.write().await;
        let mut removed: Vec<ObjectKey> = cached
            .keys()
            .filter(|key| !fresh.contains_key(key))
            .cloned()
            .collect();
        removed.sort();
        *cached = fresh;
        removed
    }

    /// Number of cached objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}
