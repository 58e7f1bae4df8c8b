pub mod form;
pub mod manifest;

pub use form::{Component, FormNode};
pub use manifest::PluginManifest;
