use tokio::time::Duration;

/// Parses a duration string in the format "250ms", "0.1s", "10m", "5h", "3d".
///
/// Supported units:
/// - `ms` for milliseconds
/// - `s` for seconds
/// - `m` for minutes
/// - `h` for hours
/// - `d` for days
///
/// Fractional values are accepted ("0.1s" is 100 milliseconds), negative ones are not.
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let (value_str, multiplier) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 0.001)
    } else {
        // Safe: `s` is non-empty after the check above.
        let unit_char = s.chars().last().unwrap_or_default();
        let multiplier = match unit_char {
            's' => 1.0,
            'm' => 60.0,
            'h' => 60.0 * 60.0,
            'd' => 24.0 * 60.0 * 60.0,
            _ => {
                return Err(format!(
                    "Unknown duration unit: '{}'. Use 'ms', 's', 'm', 'h', or 'd'.",
                    unit_char
                ))
            }
        };
        (&s[..s.len() - unit_char.len_utf8()], multiplier)
    };

    let value: f64 = match value_str.trim().parse() {
        Ok(v) if f64::is_finite(v) && v >= 0.0 => v,
        _ => {
            return Err(format!(
                "Invalid numeric value in duration: '{}'",
                value_str
            ))
        }
    };

    Duration::try_from_secs_f64(value * multiplier)
        .map_err(|e| format!("Duration '{}' is out of range: {}", s, e))
}

/// Parses a comma-separated header string with support for escaped commas.
///
/// Use `\,` to include a literal comma in a header value.
/// Example: "Connection:keep-alive,Keep-Alive:timeout=5\,max=200"
pub fn parse_headers_with_escapes(headers_str: &str) -> Vec<String> {
    let mut headers = Vec::new();
    let mut current_header = String::new();
    let mut chars = headers_str.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if chars.peek() == Some(&',') {
                    current_header.push(',');
                    chars.next();
                } else {
                    current_header.push('\\');
                }
            }
            ',' => {
                if !current_header.trim().is_empty() {
                    headers.push(current_header.clone());
                }
                current_header.clear();
            }
            _ => {
                current_header.push(ch);
            }
        }
    }

    if !current_header.trim().is_empty() {
        headers.push(current_header);
    }

    headers
}

/// Parses an environment flag: "true"/"1"/"yes" (any case) are true, everything else false.
pub fn parse_bool_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    mod duration {
        use super::*;

        #[test]
        fn parse_milliseconds() {
            assert_eq!(
                parse_duration_string("250ms").unwrap(),
                Duration::from_millis(250)
            );
        }

        #[test]
        fn parse_fractional_seconds() {
            assert_eq!(
                parse_duration_string("0.1s").unwrap(),
                Duration::from_millis(100)
            );
        }

        #[test]
        fn parse_seconds() {
            assert_eq!(
                parse_duration_string("10s").unwrap(),
                Duration::from_secs(10)
            );
        }

        #[test]
        fn parse_minutes() {
            assert_eq!(
                parse_duration_string("10m").unwrap(),
                Duration::from_secs(600)
            );
        }

        #[test]
        fn parse_hours_and_days() {
            assert_eq!(
                parse_duration_string("5h").unwrap(),
                Duration::from_secs(18000)
            );
            assert_eq!(
                parse_duration_string("3d").unwrap(),
                Duration::from_secs(259200)
            );
        }

        #[test]
        fn parse_zero() {
            assert_eq!(parse_duration_string("0s").unwrap(), Duration::ZERO);
            assert_eq!(parse_duration_string("0ms").unwrap(), Duration::ZERO);
        }

        #[test]
        fn trims_whitespace() {
            assert_eq!(
                parse_duration_string("  10m  ").unwrap(),
                Duration::from_secs(600)
            );
        }

        #[test]
        fn empty_string_errors() {
            let err = parse_duration_string("   ").unwrap_err();
            assert!(err.contains("empty"), "error was: {}", err);
        }

        #[test]
        fn unknown_suffix_errors() {
            let err = parse_duration_string("10x").unwrap_err();
            assert!(err.contains("Unknown duration unit"), "error was: {}", err);
        }

        #[test]
        fn no_suffix_errors() {
            let err = parse_duration_string("10").unwrap_err();
            assert!(err.contains("Unknown duration unit"), "error was: {}", err);
        }

        #[test]
        fn no_number_errors() {
            let err = parse_duration_string("m").unwrap_err();
            assert!(err.contains("Invalid numeric"), "error was: {}", err);
        }

        #[test]
        fn negative_number_errors() {
            let err = parse_duration_string("-5m").unwrap_err();
            assert!(err.contains("Invalid numeric"), "error was: {}", err);
        }

        #[test]
        fn not_a_number_errors() {
            let err = parse_duration_string("NaNs").unwrap_err();
            assert!(err.contains("Invalid numeric"), "error was: {}", err);
        }
    }

    #[test]
    fn test_parse_headers_with_escaped_comma() {
        let headers_str = "Connection:keep-alive,Keep-Alive:timeout=5\\,max=200";
        let result = parse_headers_with_escapes(headers_str);

        assert_eq!(result.len(), 2);
        assert_eq!(result[0], "Connection:keep-alive");
        assert_eq!(result[1], "Keep-Alive:timeout=5,max=200");
    }

    #[test]
    fn test_parse_headers_trailing_comma_and_blanks() {
        let result = parse_headers_with_escapes("A:1,  ,B:2,");
        assert_eq!(result, vec!["A:1", "B:2"]);
    }

    #[test]
    fn test_parse_bool_flag() {
        assert!(parse_bool_flag("true"));
        assert!(parse_bool_flag("TRUE"));
        assert!(parse_bool_flag("1"));
        assert!(!parse_bool_flag("false"));
        assert!(!parse_bool_flag(""));
    }
}
