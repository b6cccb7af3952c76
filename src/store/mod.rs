//! Observable, path-addressable state store.
//!
//! The store holds an immutable [`Node`] tree. Writes build a new tree
//! (shallow-cloning only the maps along the written path), commit it, and then
//! synchronously notify subscribers outside the lock, so a subscriber may read
//! the store it is subscribed to.
//!
//! Subscriptions match by path prefix in both directions:
//! - a subscriber on `stages.meet` fires when `stages.meet.status` is written,
//!   receiving the new/old value of `stages.meet` itself;
//! - a subscriber on `stages.meet.status` fires when `stages.meet` or
//!   `stages` is written, but only if its own resolved value changed.
//!
//! A `"*"` subscriber fires on every commit with the whole tree.

pub mod node;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use crate::errors::StoreError;
pub use node::Node;

/// Path that subscribes to every mutation.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// What a subscriber sees for one notification.
#[derive(Debug, Clone)]
pub struct Change {
    /// The subscribed path (`"*"` for wildcard subscribers).
    pub path: String,
    pub new: Option<Arc<Node>>,
    pub old: Option<Arc<Node>>,
}

impl Change {
    pub fn new_json(&self) -> Option<Value> {
        self.new.as_ref().map(|n| n.to_json())
    }

    pub fn old_json(&self) -> Option<Value> {
        self.old.as_ref().map(|n| n.to_json())
    }
}

pub type Callback = Arc<dyn Fn(&Change) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
enum Topic {
    All,
    Path(String),
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    topic: Topic,
    callback: Callback,
}

struct Inner {
    root: Arc<Node>,
    initial: Arc<Node>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

/// Cheaply cloneable handle to one shared state tree.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Store")
            .field("root", &inner.root)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl Store {
    /// Create a store whose initial (and default reset) state is `initial`.
    pub fn new(initial: Value) -> Self {
        let root = Node::from_json(initial);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                root: root.clone(),
                initial: root,
                subscribers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Callbacks never run under this lock, so poisoning can only come
        // from a panic inside the store itself; the tree is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The whole committed tree.
    pub fn snapshot(&self) -> Arc<Node> {
        self.lock().root.clone()
    }

    pub fn get(&self, path: &str) -> Option<Arc<Node>> {
        let root = self.snapshot();
        node::resolve(&root, path)
    }

    pub fn get_json(&self, path: &str) -> Option<Value> {
        self.get(path).map(|n| n.to_json())
    }

    /// Deserialize the value at `path`. Absent or mismatched values yield `None`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        let value = self.get_json(path)?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                debug!(path, error = %err, "Store value did not match requested type");
                None
            }
        }
    }

    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        self.commit(vec![(path.to_string(), Node::from_json(value.into()))])
    }

    /// Apply several path writes as one commit. Each subscriber is notified at
    /// most once, and wildcard subscribers exactly once.
    pub fn patch<I, K>(&self, entries: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let writes = entries
            .into_iter()
            .map(|(path, value)| (path.into(), Node::from_json(value)))
            .collect();
        self.commit(writes)
    }

    /// Apply a JSON object whose keys are dot-paths, as one commit.
    pub fn patch_object(&self, patch: Value) -> Result<(), StoreError> {
        match patch {
            Value::Object(object) => self.patch(object),
            other => Err(StoreError::PatchNotObject(other.to_string())),
        }
    }

    fn commit(&self, writes: Vec<(String, Arc<Node>)>) -> Result<(), StoreError> {
        if writes.iter().any(|(path, _)| path.is_empty()) {
            return Err(StoreError::EmptyPath);
        }
        if writes.is_empty() {
            return Ok(());
        }

        let (old, new, subscribers) = {
            let mut inner = self.lock();
            let old = inner.root.clone();
            let mut root = old.clone();
            for (path, value) in &writes {
                root = node::with_path(Some(&root), &node::segments(path), value.clone())?;
            }
            inner.root = root.clone();
            (old, root, inner.subscribers.clone())
        };

        let written: Vec<&str> = writes.iter().map(|(path, _)| path.as_str()).collect();
        notify(&subscribers, &old, &new, Some(written.as_slice()));
        Ok(())
    }

    /// Replace the whole tree and notify every subscriber.
    ///
    /// `None` restores the state the store was created with.
    pub fn reset(&self, new_state: Option<Value>) {
        let (old, new, subscribers) = {
            let mut inner = self.lock();
            let new = match new_state {
                Some(state) => Node::from_json(state),
                None => inner.initial.clone(),
            };
            let old = std::mem::replace(&mut inner.root, new.clone());
            (old, new, inner.subscribers.clone())
        };
        notify(&subscribers, &old, &new, None);
    }

    /// Register `callback` for `path`, or for every mutation with `"*"`.
    pub fn subscribe<F>(&self, path: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Change) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        let topic = if path == WILDCARD {
            Topic::All
        } else {
            Topic::Path(path.to_string())
        };
        inner.subscribers.push(Subscriber {
            id,
            topic,
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// `ancestor` equals `path` or is a dot-prefix of it.
fn is_prefix(ancestor: &str, path: &str) -> bool {
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'.')
}

/// `written` is `None` for a reset, which notifies everyone.
fn notify(subscribers: &[Subscriber], old: &Arc<Node>, new: &Arc<Node>, written: Option<&[&str]>) {
    for subscriber in subscribers {
        let change = match &subscriber.topic {
            Topic::All => Change {
                path: WILDCARD.to_string(),
                new: Some(new.clone()),
                old: Some(old.clone()),
            },
            Topic::Path(path) => {
                let new_value = node::resolve(new, path);
                let old_value = node::resolve(old, path);
                let fires = match written {
                    None => true,
                    Some(written) => written.iter().any(|w| {
                        if is_prefix(path, w) {
                            true
                        } else if is_prefix(w, path) {
                            !node::same(&old_value, &new_value)
                        } else {
                            false
                        }
                    }),
                };
                if !fires {
                    continue;
                }
                Change {
                    path: path.clone(),
                    new: new_value,
                    old: old_value,
                }
            }
        };
        invoke(subscriber, &change);
    }
}

fn invoke(subscriber: &Subscriber, change: &Change) {
    let callback = subscriber.callback.clone();
    match std::panic::catch_unwind(AssertUnwindSafe(|| callback(change))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(path = %change.path, "Store subscriber failed: {:#}", err);
        }
        Err(_) => {
            error!(path = %change.path, "Store subscriber panicked");
        }
    }
}
