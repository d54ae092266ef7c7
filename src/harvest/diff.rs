//! Snapshot differencing used to skip entries that must not be pulled.

use std::collections::HashSet;

use crate::model::Listing;

/// Returns every entry of `primary` not present in `reference`, in
/// `primary`'s order.
///
/// Matching is exact: no case folding and no trailing-separator
/// normalization, so `"IMG.jpg"` and `"img.jpg"` are distinct entries.
pub fn diff(primary: &Listing, reference: &Listing) -> Listing {
    let exclude: HashSet<&str> = reference.iter().map(String::as_str).collect();
    primary
        .iter()
        .filter(|entry| !exclude.contains(entry.as_str()))
        .cloned()
        .collect()
}
