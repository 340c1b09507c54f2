//! SNIPER: marketplace listing sniper.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod auth;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod strategy;
pub mod types;
