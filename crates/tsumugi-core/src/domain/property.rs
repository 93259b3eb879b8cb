//! Typed property store threaded through task execution.
//!
//! Keys are identity-compared: every key minted by [`PropertyKey::new`] or
//! [`PropertyKey::named`] is distinct, even when two keys carry the same value
//! type. Two unrelated tasks can publish same-shaped data under their own keys
//! without colliding.
//!
//! Design:
//! - `PropertyKey<T>` is a phantom-typed handle: the process-unique `u64` is
//!   what the map hashes, `T` only exists at compile time to make `get` and
//!   `insert` type-safe. Same pattern as strongly-typed ids.
//! - Stored values are type-erased behind `Arc`, so context snapshots clone
//!   cheaply (`Arc` bumps, no deep copies).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Identity-compared key for a property of type `T`.
///
/// # Example
/// ```ignore
/// let out: PropertyKey<String> = PropertyKey::named("out");
/// scoped.set(&out, "test".to_string());
/// assert_eq!(scoped.get(&out).map(String::as_str), Some("test"));
/// ```
///
/// Keys are `Copy`; share one key value between the writing and the reading
/// task. Minting a second key of the same type does NOT alias the first.
pub struct PropertyKey<T> {
    id: u64,
    name: Option<&'static str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PropertyKey<T> {
    /// Mint a fresh anonymous key.
    pub fn new() -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name: None,
            _marker: PhantomData,
        }
    }

    /// Mint a fresh key with a diagnostic name (shown in logs and `Debug`).
    ///
    /// The name is purely informational; identity still comes from the minted
    /// id, so two `named("out")` keys are different keys.
    pub fn named(name: &'static str) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name: Some(name),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        self.name
    }
}

impl<T> Default for PropertyKey<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Manual impls: derive would put bounds on `T`, which the phantom does not need.
impl<T> Clone for PropertyKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PropertyKey<T> {}

impl<T> PartialEq for PropertyKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for PropertyKey<T> {}

impl<T> Hash for PropertyKey<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for PropertyKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyKey({})", self)
    }
}

impl<T> fmt::Display for PropertyKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(name) => write!(f, "{name}#{}", self.id),
            None => write!(f, "#{}", self.id),
        }
    }
}

/// A stored property value, type-erased.
///
/// The typed view lives on [`PropertyKey`]; a `Property` only keeps the erased
/// payload plus the key's diagnostic name.
#[derive(Clone)]
pub struct Property {
    name: Option<&'static str>,
    value: Arc<dyn Any + Send + Sync>,
}

impl Property {
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Property({})", self.name.unwrap_or("_"))
    }
}

/// Key -> value mapping with type-checked access.
///
/// Cloning a `PropertySet` produces an independent snapshot: inserts into the
/// clone never show up in the original. This is what makes the scoped
/// per-task context safe to hand out.
#[derive(Clone, Default)]
pub struct PropertySet {
    values: HashMap<u64, Property>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Type-checked lookup. Returns `None` when the key was never written.
    ///
    /// A present entry always downcasts: the only way to write under `key.id`
    /// is `insert` with the same phantom type.
    pub fn get<T: Send + Sync + 'static>(&self, key: &PropertyKey<T>) -> Option<&T> {
        self.values
            .get(&key.id)
            .and_then(|property| property.value.downcast_ref::<T>())
    }

    /// Insert or replace the value for `key`.
    pub fn insert<T: Send + Sync + 'static>(&mut self, key: &PropertyKey<T>, value: T) {
        self.values.insert(
            key.id,
            Property {
                name: key.name,
                value: Arc::new(value),
            },
        );
    }

    pub fn contains<T>(&self, key: &PropertyKey<T>) -> bool {
        self.values.contains_key(&key.id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for PropertySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self
            .values
            .iter()
            .map(|(id, property)| match property.name {
                Some(name) => format!("{name}#{id}"),
                None => format!("#{id}"),
            })
            .collect();
        names.sort();
        f.debug_tuple("PropertySet").field(&names).finish()
    }
}
