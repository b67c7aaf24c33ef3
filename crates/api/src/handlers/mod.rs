//! Request handlers.
//!
//! Handlers delegate to the shared [`JobRunner`](easel_pipeline::runner::JobRunner)
//! and map failures via [`AppError`](crate::error::AppError).

pub mod generate;
pub mod workflows;
