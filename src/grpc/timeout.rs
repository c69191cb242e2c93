//! `grpc-timeout` header values.

/// Parse a `grpc-timeout` value such as `10S` or `250m` into milliseconds.
///
/// The value is at most eight ASCII digits followed by one unit of `H`, `M`,
/// `S`, `m`, `u` or `n`. Anything else yields `None`, meaning no deadline.
pub fn parse_timeout(value: &str) -> Option<i64> {
    let value = value.trim();
    let unit = value.chars().last()?;
    let digits = &value[..value.len() - unit.len_utf8()];
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: i64 = digits.parse().ok()?;
    let millis = match unit {
        'H' => amount * 3_600_000,
        'M' => amount * 60_000,
        'S' => amount * 1_000,
        'm' => amount,
        'u' => amount / 1_000,
        'n' => amount / 1_000_000,
        _ => return None,
    };
    Some(millis)
}

/// Format a deadline in milliseconds for an outbound request.
pub fn format_timeout(millis: i64) -> String {
    format!("{}m", millis.clamp(0, 99_999_999))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_timeout("1H"), Some(3_600_000));
        assert_eq!(parse_timeout("2M"), Some(120_000));
        assert_eq!(parse_timeout("3S"), Some(3_000));
        assert_eq!(parse_timeout("250m"), Some(250));
        assert_eq!(parse_timeout("5000u"), Some(5));
        assert_eq!(parse_timeout("7000000n"), Some(7));
    }

    #[test]
    fn malformed_values_mean_no_deadline() {
        assert_eq!(parse_timeout(""), None);
        assert_eq!(parse_timeout("S"), None);
        assert_eq!(parse_timeout("10"), None);
        assert_eq!(parse_timeout("10s"), None);
        assert_eq!(parse_timeout("123456789S"), None);
        assert_eq!(parse_timeout("-1S"), None);
    }

    #[test]
    fn formats_in_millis() {
        assert_eq!(format_timeout(1500), "1500m");
        assert_eq!(parse_timeout(&format_timeout(1500)), Some(1500));
    }
}
