//! Network-backed implementations of the store and feed traits.

pub mod realtime;
pub mod rest;

pub use realtime::RealtimeFeed;
pub use rest::RestStore;
