//! Job pipeline on top of the ComfyUI client.
//!
//! Ties the pieces together for one job: template lookup
//! ([`templates`]), reference image resolution ([`reference`]),
//! parameter injection, submission and monitoring ([`runner`]).

pub mod config;
pub mod error;
pub mod reference;
pub mod runner;
pub mod templates;
