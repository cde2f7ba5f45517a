//! Extension registry
//!
//! Supplies shared fixtures to test units under every execution strategy.

mod registry;

pub use registry::{
    Capabilities, Construction, Extension, ExtensionError, ExtensionRegistry, RegistryScope,
};
