use crate::{Result, SumiError};
use regex::Regex;

/// Returns the first match of `pattern` in `text`
///
/// When the pattern has a capture group, the first group is returned
/// instead of the whole match.
///
/// # Errors
///
/// [`SumiError::Regex`] if the pattern is invalid or nothing matches.
pub fn regex_first(pattern: &str, text: &str) -> Result<String> {
    let regex = Regex::new(pattern).map_err(|e| SumiError::Regex {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;

    let captures = regex.captures(text).ok_or_else(|| SumiError::Regex {
        pattern: pattern.to_string(),
        message: format!("no match in {:?}", text),
    })?;

    let found = captures.get(1).or_else(|| captures.get(0));
    Ok(found.map(|m| m.as_str().trim().to_string()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match() {
        assert_eq!(regex_first(r"\d+", "Showing 1-20 of 345").unwrap(), "1");
        assert_eq!(regex_first(r"of (\d+)", "Showing 1-20 of 345").unwrap(), "345");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(regex_first(r"\d+", "none"), Err(SumiError::Regex { .. })));
        assert!(matches!(regex_first(r"(", "x"), Err(SumiError::Regex { .. })));
    }
}
