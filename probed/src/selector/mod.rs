//! Component C: selector compiler (spec.md §4.C).

pub mod actions;
pub mod compiler;
pub mod state;

pub use actions::CompiledAction;
pub use compiler::{CompiledSelector, CompiledSelectorState, SelectorCompiler, SelectorInnerMaps};
