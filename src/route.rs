//! Record-Route / Route header accumulation.
//!
//! Grounded on `original_source/WiPhone/tinySIP.h`'s `RouteSet` class and
//! spec §4.2. The teacher's `headers/route.rs` and `headers/record_route.rs`
//! model a single header's value; this models the accumulated *set* across
//! an entire message the way the original engine does, including its
//! direction-dependent iteration order.

/// An ordered collection of Record-Route URIs, with a reverse-iteration
/// flag recording whether the set was learned from a response (client/UAC
/// origin, iterate in reverse) or a request (server/UAS origin, iterate
/// forward).
///
/// Per spec §4.2: rr-params are intentionally not preserved (documented
/// limitation, carried over from the original).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet {
    entries: Vec<String>,
    reverse_iteration: bool,
}

impl std::fmt::Display for RouteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use itertools::Itertools;
        write!(f, "{}", self.iter().format(", "))
    }
}

impl RouteSet {
    /// Creates an empty route set in forward (server) order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the set to empty and sets the iteration direction.
    pub fn clear(&mut self, reverse: bool) {
        self.entries.clear();
        self.reverse_iteration = reverse;
    }

    /// Appends a Route URI. `_rr_params` is accepted for call-site symmetry
    /// with the original `add(rrAddrSpec, rrParams)` but discarded.
    pub fn add(&mut self, uri: &str, _rr_params: Option<&str>) {
        self.entries.push(uri.to_string());
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the set has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether this set iterates in reverse (learned from a response).
    pub fn is_reverse(&self) -> bool {
        self.reverse_iteration
    }

    /// Indexed access: index `i` maps to entry `i` in server (forward) mode,
    /// or `len - 1 - i` in client (reverse) mode.
    pub fn get(&self, i: usize) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = if self.reverse_iteration {
            self.entries.len().checked_sub(1 + i)?
        } else {
            i
        };
        self.entries.get(idx).map(String::as_str)
    }

    /// Iterates entries in the effective (direction-corrected) order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        (0..self.entries.len()).filter_map(move |i| self.get(i))
    }

    /// Deep-clones `other`'s entries and direction into `self`.
    pub fn copy_from(&mut self, other: &RouteSet) {
        self.entries = other.entries.clone();
        self.reverse_iteration = other.reverse_iteration;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_order_matches_insertion() {
        let mut rs = RouteSet::new();
        rs.clear(false);
        rs.add("sip:p1.example.com;lr", None);
        rs.add("sip:p2.example.com;lr", None);
        assert_eq!(rs.get(0), Some("sip:p1.example.com;lr"));
        assert_eq!(rs.get(1), Some("sip:p2.example.com;lr"));
        assert_eq!(rs.iter().collect::<Vec<_>>(), vec!["sip:p1.example.com;lr", "sip:p2.example.com;lr"]);
    }

    #[test]
    fn reverse_order_is_reverse_of_insertion() {
        let mut rs = RouteSet::new();
        rs.clear(true);
        rs.add("sip:p1.example.com;lr", None);
        rs.add("sip:p2.example.com;lr", None);
        assert_eq!(rs.get(0), Some("sip:p2.example.com;lr"));
        assert_eq!(rs.get(1), Some("sip:p1.example.com;lr"));
        assert_eq!(rs.iter().collect::<Vec<_>>(), vec!["sip:p2.example.com;lr", "sip:p1.example.com;lr"]);
    }

    #[test]
    fn copy_is_deep_and_preserves_direction() {
        let mut rs = RouteSet::new();
        rs.clear(true);
        rs.add("sip:p1.example.com", None);

        let mut copy = RouteSet::new();
        copy.copy_from(&rs);
        rs.add("sip:p2.example.com", None);

        assert_eq!(copy.len(), 1);
        assert!(copy.is_reverse());
    }
}
