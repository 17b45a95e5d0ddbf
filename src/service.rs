//! Port to service name heuristic.
//!
//! This is a static table, not a fingerprinter: nothing is read from the wire.
//! Extend [`KNOWN_SERVICES`] to recognise more ports.

/// Name returned for ports missing from the table.
pub const UNKNOWN: &str = "unknown";

/// Well-known ports and their canonical service names.
pub const KNOWN_SERVICES: &[(u16, &str)] = &[
    (22, "ssh"),
    (80, "http"),
    (443, "https"),
    (3306, "mysql"),
    (5432, "postgresql"),
];

/// Canonical service name for `port`, or [`UNKNOWN`].
pub fn classify(port: u16) -> &'static str {
    KNOWN_SERVICES
        .iter()
        .find(|&&(known, _)| known == port)
        .map_or(UNKNOWN, |&(_, name)| name)
}

/// Same as [`classify`] for a textual port label such as `"443"`.
pub fn classify_label(label: &str) -> &'static str {
    label.trim().parse().map_or(UNKNOWN, classify)
}
