//! The per-request context threaded through every interceptor.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::{Fault, InterceptorChain};

/// Mutable context carried through a chain.
///
/// Holds two property stores: a string-keyed map of JSON values for loosely
/// typed metadata, and a bag keyed by Rust type for strongly typed
/// collaborators (e.g. an `Arc<dyn FaultListener>`). The chain engine only
/// ever writes the recorded [`Fault`]; everything else belongs to the caller
/// and its interceptors.
pub struct Message {
    id: Uuid,
    properties: HashMap<String, serde_json::Value>,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    fault: Option<Fault>,
    chain: Option<Arc<dyn InterceptorChain>>,
}

impl Message {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            properties: HashMap::new(),
            extensions: HashMap::new(),
            fault: None,
            chain: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    // --- string-keyed properties ---

    /// Insert or overwrite a property.
    pub fn set_property(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.properties.insert(key.into(), value);
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    /// Convenience accessor that returns a `String`. Falls back to `default`
    /// when the key is absent or not a JSON string.
    pub fn property_str(&self, key: &str, default: &str) -> String {
        self.properties
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn remove_property(&mut self, key: &str) -> Option<serde_json::Value> {
        self.properties.remove(key)
    }

    pub fn properties(&self) -> &HashMap<String, serde_json::Value> {
        &self.properties
    }

    // --- typed property bag ---

    /// Store a value keyed by its type, returning the previous one.
    pub fn put<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.extensions
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast::<T>().ok())
            .map(|prev| *prev)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.extensions
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.extensions.contains_key(&TypeId::of::<T>())
    }

    // --- fault ---

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn set_fault(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    pub fn take_fault(&mut self) -> Option<Fault> {
        self.fault.take()
    }

    // --- owning chain ---

    /// The chain currently processing this message, if the caller attached one.
    pub fn chain(&self) -> Option<Arc<dyn InterceptorChain>> {
        self.chain.clone()
    }

    pub fn set_chain(&mut self, chain: Arc<dyn InterceptorChain>) {
        self.chain = Some(chain);
    }

    pub fn clear_chain(&mut self) -> Option<Arc<dyn InterceptorChain>> {
        self.chain.take()
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("properties", &self.properties)
            .field("extensions", &self.extensions.len())
            .field("fault", &self.fault)
            .field("chain", &self.chain.as_ref().map(|c| c.state()))
            .finish()
    }
}
