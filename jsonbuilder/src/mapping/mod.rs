//! Mapping descriptions: the format file and the node tree parsed from it.

pub mod format;
pub mod node;

pub use format::Format;
pub use node::{parse_mapping, Compiled, Node, NodeKind};
