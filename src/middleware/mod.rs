pub mod builtin;
pub mod factory;
pub mod pipeline;

pub use factory::{PluginConstructor, PluginFactory};
pub use pipeline::{Plugin, PluginChain};
