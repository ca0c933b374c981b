//! Filter predicates over trimmed cell values.
//!
//! Cells are fixed-width and whitespace padded on disk, so every predicate
//! trims both sides before comparing. Predicates are plain functions; the
//! algebra accepts any `Fn(&str) -> bool` closure built from them.

/// Trimmed textual equality.
pub fn equals(cell: &str, param: &str) -> bool {
    cell.trim() == param.trim()
}

/// Numeric `<` over trimmed values. A side that does not parse as a number
/// never matches.
pub fn less_than(cell: &str, param: &str) -> bool {
    match (cell.trim().parse::<f64>(), param.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a < b,
        _ => false,
    }
}

/// Trimmed membership in `params`.
pub fn any_of(cell: &str, params: &[&str]) -> bool {
    params.iter().any(|p| equals(cell, p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equals_trims_both_sides() {
        assert!(equals("Buzz            ", "Buzz"));
        assert!(equals("  18", "18 "));
        assert!(!equals("Buzz", "Buz"));
    }

    #[test]
    fn less_than_is_numeric() {
        assert!(less_than(" 9 ", "18"));
        assert!(!less_than("18", "9"));
        // lexicographic order would say otherwise
        assert!(less_than("2", "10"));
        assert!(!less_than("Buzz", "10"));
        assert!(!less_than("10", "Buzz"));
    }

    #[test]
    fn any_of_matches_any_trimmed_element() {
        assert!(any_of("FB ", &["Twitter", "FB"]));
        assert!(!any_of("G+", &["Twitter", "FB"]));
        assert!(!any_of("G+", &[]));
    }
}
