//! Itinerary construction from raw route rows.
//!
//! The store returns each route with its junction rows in no particular
//! order. Building an itinerary means sorting those rows by `stop_order`,
//! deciding whether the route serves the requested endpoints, and projecting
//! the survivors into [`Itinerary`] values. Everything here is pure.

use tracing::warn;

use crate::models::{
    Itinerary, ItineraryStop, Result, RouteRow, RouteStopLink, Stop, TransitError,
};

/// A requested `(start, destination)` pair, normalized for matching.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointQuery {
    start: String,
    destination: String,
}

impl EndpointQuery {
    pub fn new(start: &str, destination: &str) -> Self {
        Self {
            start: normalize(start),
            destination: normalize(destination),
        }
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether a route running from `origin` to `terminus` serves this query.
    ///
    /// Containment is checked both ways on each end so "Accra Central" finds a
    /// route starting at "Accra" and "Madina" finds one ending at "Madina
    /// Station". Unrelated routes sharing a substring also match.
    pub fn matches(&self, origin: &str, terminus: &str) -> bool {
        loosely_matches(origin, &self.start) && loosely_matches(terminus, &self.destination)
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Bidirectional case-insensitive substring containment.
///
/// `query` must already be normalized.
pub fn loosely_matches(stop_name: &str, query: &str) -> bool {
    let name = normalize(stop_name);
    name.contains(query) || query.contains(name.as_str())
}

/// Junction rows of `route` in ride order.
///
/// The sort is stable, so rows sharing a `stop_order` keep the order the
/// store returned them in.
pub fn ordered_links(route: &RouteRow) -> Vec<&RouteStopLink> {
    let mut links: Vec<&RouteStopLink> = route.links.iter().collect();
    links.sort_by_key(|link| link.stop_order);
    links
}

/// Every usable route as an itinerary, in input order.
pub fn build(rows: &[RouteRow]) -> Vec<Itinerary> {
    rows.iter()
        .filter_map(|route| {
            let links = ordered_links(route);
            (!links.is_empty()).then(|| project(route, &links))
        })
        .collect()
}

/// Itineraries for the routes that serve `query`, in input order.
pub fn build_matching(rows: &[RouteRow], query: &EndpointQuery) -> Vec<Itinerary> {
    rows.iter()
        .filter_map(|route| {
            let links = ordered_links(route);
            let (first, last) = (links.first()?, links.last()?);

            query
                .matches(&first.stop.name, &last.stop.name)
                .then(|| project(route, &links))
        })
        .collect()
}

fn project(route: &RouteRow, links: &[&RouteStopLink]) -> Itinerary {
    Itinerary {
        id: route.id.clone(),
        name: route.name.clone(),
        total_distance: route.total_distance,
        total_fare: route.total_fare,
        stops: links
            .iter()
            .map(|link| ItineraryStop {
                name: link.stop.name.clone(),
                lat: usable(parse_coordinate(&link.stop, "latitude", &link.stop.latitude)),
                lng: usable(parse_coordinate(&link.stop, "longitude", &link.stop.longitude)),
                fare_to_next: link.fare_to_next,
                distance_to_next: link.distance_to_next,
            })
            .collect(),
    }
}

fn usable(parsed: Result<f64>) -> Option<f64> {
    parsed
        .map_err(|e| warn!(error = %e, "dropping stop coordinate"))
        .ok()
}

/// Parse one coordinate column. Non-finite values count as unparsable.
pub fn parse_coordinate(stop: &Stop, axis: &'static str, raw: &str) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| TransitError::InvalidCoordinate {
            stop: stop.id.clone(),
            axis,
            value: raw.to_owned(),
        })
}
