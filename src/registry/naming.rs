//! Display-name de-duplication for stored datasets.

use std::collections::HashSet;

/// Picks a display name not in `taken`, numbering repeats Finder-style:
/// `report.csv`, `report (1).csv`, `report (2).csv`, …
pub fn unique_display_name(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let (stem, ext) = match base.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < base.len() => base.split_at(dot),
        _ => (base, ""),
    };
    (1u64..)
        .map(|n| format!("{stem} ({n}){ext}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}
