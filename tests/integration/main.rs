//! Integration tests: the engine wired against an in-memory marketplace.

mod mock_marketplace;
mod pipeline;
