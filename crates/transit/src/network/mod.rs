//! Network and IO abstractions.

pub mod traits;

pub use traits::{IdentityProvider, RouteStore, StopDirectory, StoreFuture, UserStore};
