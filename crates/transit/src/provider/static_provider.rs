//! Bundled stop directory used when the remote one is unreachable.
//!
//! The list is small and compiled in; lookups are a linear scan.

use crate::models::Stop;
use crate::network::traits::{StopDirectory, StoreFuture};

const BUNDLED_STOPS: &[(i64, &str, f64, f64)] = &[
    (1, "Abladjei", 5.6502, -0.1846),
    (2, "Atomic Junction", 5.6601, -0.1753),
    (3, "Circle", 5.5500, -0.2001),
    (4, "Madina", 5.6800, -0.1700),
    (5, "37 Station", 5.6000, -0.1900),
    (6, "Kaneshie", 5.5700, -0.2300),
    (7, "Tema Station", 5.6699, -0.0161),
    (8, "Accra Central", 5.5557, -0.1974),
    (9, "Legon", 5.6500, -0.1865),
    (10, "Osu", 5.5550, -0.1750),
];

/// In-memory stop directory. Lookups never fail.
#[derive(Clone, Debug)]
pub struct StaticStopDirectory {
    stops: Vec<Stop>,
}

impl StaticStopDirectory {
    /// The stops shipped with the application.
    pub fn bundled() -> Self {
        Self::from_stops(
            BUNDLED_STOPS
                .iter()
                .map(|&(id, name, lat, lng)| Stop::new(id, name, lat, lng))
                .collect(),
        )
    }

    pub fn from_stops(stops: Vec<Stop>) -> Self {
        Self { stops }
    }

    pub fn all(&self) -> &[Stop] {
        &self.stops
    }

    /// Case-insensitive substring match on the stop name, in list order.
    pub fn search(&self, query: &str, limit: usize) -> Vec<Stop> {
        let needle = query.to_lowercase();
        self.stops
            .iter()
            .filter(|stop| stop.name.to_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect()
    }
}

impl Default for StaticStopDirectory {
    fn default() -> Self {
        Self::bundled()
    }
}

impl StopDirectory for StaticStopDirectory {
    fn search_stops<'a>(&'a self, query: &'a str, limit: usize) -> StoreFuture<'a, Vec<Stop>> {
        Box::pin(async move { Ok(self.search(query, limit)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_directory() {
        let directory = StaticStopDirectory::bundled();
        assert_eq!(directory.all().len(), 10);
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let directory = StaticStopDirectory::bundled();
        let found = directory.search("mad", 5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Madina");

        let found = directory.search("STATION", 5);
        let names: Vec<_> = found.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["37 Station", "Tema Station"]);
    }

    #[test]
    fn test_search_respects_limit() {
        let directory = StaticStopDirectory::bundled();
        assert_eq!(directory.search("a", 5).len(), 5);
        assert!(directory.search("kumasi", 5).is_empty());
    }
}
