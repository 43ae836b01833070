//! SQL identifier quoting and validation.

use regex::Regex;
use std::sync::OnceLock;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

/// Compiled identifier pattern, built on first use.
fn identifier_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(IDENTIFIER_PATTERN) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(error = %e, "Identifier pattern failed to compile");
            None
        }
    })
    .as_ref()
}

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them.
///
/// ```
/// use ormctx_core::quote_ident;
///
/// assert_eq!(quote_ident("orders"), "\"orders\"");
/// assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Check that a table, column or sequence name is a plain identifier.
///
/// ```
/// use ormctx_core::is_valid_identifier;
///
/// assert!(is_valid_identifier("product_type"));
/// assert!(!is_valid_identifier("1st"));
/// assert!(!is_valid_identifier("drop table;"));
/// ```
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("select"), "\"select\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_valid_identifiers() {
        for ok in ["id", "_x", "ORDERS", "order_id2"] {
            assert!(is_valid_identifier(ok), "{ok}");
        }
        for bad in ["", "9lives", "a-b", "a b", "x\"", "t;--"] {
            assert!(!is_valid_identifier(bad), "{bad}");
        }
    }
}
