//! SQL identifier quoting.
//!
//! Only for places where values cannot be bound as parameters, such as
//! savepoint names.

/// Quote `s` as an identifier, doubling embedded double quotes.
pub fn quote_identifier(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("runners"), r#""runners""#);
        assert_eq!(quote_identifier("gribble/autosave/1/2"), r#""gribble/autosave/1/2""#);
        assert_eq!(quote_identifier(r#"a"b"#), r#""a""b""#);
        assert_eq!(
            quote_identifier(r#"x"; DROP TABLE runners; --"#),
            r#""x""; DROP TABLE runners; --""#
        );
    }
}
