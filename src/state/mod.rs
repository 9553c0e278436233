//! C1 — State Store: the single durable document, its lock, its
//! transition table, and the patch types used to mutate it.

pub mod document;
pub mod lock;
pub mod patch;
pub mod store;
pub mod transitions;

pub use document::StateDocument;
pub use patch::{ExecutionPatch, StoryPatch};
pub use store::StateStore;
