//! # Algebra Primitives
//!
//! Hardcoded constants shared by the selection, criterion and cache modules.
//!
//! These values are compiled into the binary and are immutable at runtime.

/// Marker for a recursive back-reference in a packed selection.
///
/// `{ id, branches: * }` selects `id` on every level of `branches`.
pub const WILDCARD: &str = "*";

/// Maximum nesting depth accepted by the packed selection text parser.
///
/// Parsing is recursive; this bounds stack usage for hostile input.
pub const MAX_PACKED_DEPTH: usize = 64;

/// Maximum length of a packed selection text.
pub const MAX_PACKED_TEXT_LENGTH: usize = 65536;

/// Maximum number of index fields in a single index-combination lookup.
///
/// The index-combination cache enumerates every non-empty subset of the
/// requested fields, so the work grows as `2^n`.
pub const MAX_INDEX_COMBINATION_FIELDS: usize = 12;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_is_star() {
        assert_eq!(WILDCARD, "*");
    }

    #[test]
    fn index_combination_limit_fits_mask() {
        // subsets are enumerated with a u32 bitmask
        assert!(MAX_INDEX_COMBINATION_FIELDS < 32);
    }
}
