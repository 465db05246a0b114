//! Stop directories that live in process.

pub mod static_provider;

pub use static_provider::StaticStopDirectory;
