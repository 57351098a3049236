pub mod constraint;
pub mod installer;
pub mod manager;
pub mod manifest;
pub mod migrate;
pub mod preference;
pub mod resolve;
pub mod runtime;

pub use manager::PluginManager;
