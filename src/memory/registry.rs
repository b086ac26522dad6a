//! Allocator factories.
//!
//! Allocators for different hardware blocks are interchangeable behind
//! [`PhysMemAllocator`]. The registry lets an application pick one by name
//! (from a config file, a command line) without naming its concrete type.

use super::{AllocatorConfig, DeviceAllocator, EmulatedDriver, IpuDriver, PhysMemAllocator};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// A function producing an allocator from a configuration.
pub type AllocatorFactory =
    Arc<dyn Fn(&AllocatorConfig) -> Arc<dyn PhysMemAllocator> + Send + Sync>;

/// Name of the built-in IPU factory.
pub const IPU_FACTORY: &str = "ipu";

/// Name of the built-in emulated factory.
pub const EMULATED_FACTORY: &str = "emulated";

/// Named allocator factories.
pub struct AllocatorRegistry {
    factories: RwLock<HashMap<String, AllocatorFactory>>,
}

impl AllocatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry holding the `"ipu"` and `"emulated"` factories.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(IPU_FACTORY, |config| {
            Arc::new(DeviceAllocator::new(IpuDriver, config.clone()))
        });
        registry.register(EMULATED_FACTORY, |config| {
            Arc::new(DeviceAllocator::new(EmulatedDriver::new(), config.clone()))
        });
        registry
    }

    /// Register a factory, replacing any previous one with the same name.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&AllocatorConfig) -> Arc<dyn PhysMemAllocator> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(name = %name, "registering allocator factory");
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(factory));
    }

    /// Remove a factory. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered factory names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Create an allocator with the factory registered under `name`.
    ///
    /// The factory runs outside the registry lock.
    pub fn create(&self, name: &str, config: &AllocatorConfig) -> Result<Arc<dyn PhysMemAllocator>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownAllocator(name.to_string()))?;
        Ok(factory(config))
    }
}

impl Default for AllocatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for AllocatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorRegistry")
            .field("factories", &self.names())
            .finish()
    }
}

/// An allocator on the default IPU device node.
///
/// Check [`is_ready`](PhysMemAllocator::is_ready) before use.
pub fn ipu_allocator() -> Arc<dyn PhysMemAllocator> {
    Arc::new(DeviceAllocator::ipu())
}

/// An allocator on emulated, memfd-backed device memory.
pub fn emulated_allocator() -> Arc<dyn PhysMemAllocator> {
    Arc::new(DeviceAllocator::emulated())
}
