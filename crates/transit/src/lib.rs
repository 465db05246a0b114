//! # trotro-transit
//!
//! Data model and itinerary construction for Accra trotro routes.
//!
//! ## Features
//!
//! - **Row types**: routes, junction rows and stops as the store returns them
//! - **Itinerary builder**: ordered, matched itineraries from unordered rows
//! - **Bundled stops**: a static directory for when the network is down
//! - **Pluggable stores**: implement the traits in [`network`] to reach a backend
//!
//! ## Example
//!
//! ```
//! use trotro_transit::prelude::*;
//!
//! let rows = vec![RouteRow {
//!     id: RouteIdentifier::new("1"),
//!     name: "Accra - Madina".into(),
//!     total_distance: Some(12.0),
//!     total_fare: Some(6.5),
//!     links: vec![
//!         RouteStopLink {
//!             stop_order: 2,
//!             fare_to_next: None,
//!             distance_to_next: None,
//!             stop: Stop::new("4", "Madina Station", 5.68, -0.17),
//!         },
//!         RouteStopLink {
//!             stop_order: 1,
//!             fare_to_next: Some(6.5),
//!             distance_to_next: Some(12.0),
//!             stop: Stop::new("8", "Accra", 5.5557, -0.1974),
//!         },
//!     ],
//! }];
//!
//! let query = EndpointQuery::new("Accra Central", "Madina");
//! let itineraries = build_matching(&rows, &query);
//! assert_eq!(itineraries.len(), 1);
//! assert_eq!(itineraries[0].origin().unwrap().name, "Accra");
//! ```

pub mod builder;
pub mod identifiers;
pub mod models;
pub mod network;
pub mod provider;

// Re-exports for convenience
pub mod prelude {
    pub use crate::builder::{build, build_matching, EndpointQuery};
    pub use crate::identifiers::*;
    pub use crate::models::*;
    pub use crate::network::traits::*;
    pub use crate::provider::StaticStopDirectory;
}

pub use prelude::*;
