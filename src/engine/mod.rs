//! Core engine: the scan → value → purchase pipeline.

pub mod cache;
pub mod events;
pub mod executor;
pub mod scanner;
pub mod shutdown;
