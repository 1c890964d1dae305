//! Tree building: turns a parsed mapping and a table into a [`Document`].

pub mod document;
pub mod engine;
pub mod snapshot;
pub mod tree;

pub use document::Document;
pub use engine::{Engine, Scope};
pub use snapshot::snapshot;
pub use tree::{BuildOptions, Tree};
