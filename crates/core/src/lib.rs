//! Pure workflow logic for the easel generation orchestrator.
//!
//! No I/O and no async: the node graph model, the template/parameter
//! injector that rewrites a graph before submission, and the extractor
//! that turns backend output records into media locators.

pub mod error;
pub mod graph;
pub mod inject;
pub mod outputs;
pub mod types;
