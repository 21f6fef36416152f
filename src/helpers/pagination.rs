//! Pagination helpers

use crate::helpers::regex::regex_first;
use crate::helpers::xpath::extract_xpath;
use crate::{Result, SumiError};
use serde_json::Value;
use url::Url;

/// Sets the page query parameter on a URL, replacing any previous value
///
/// ```
/// use sumi_pipeline::helpers::pagination::paginated_url;
///
/// assert_eq!(
///     paginated_url("https://example.com/search?q=test&page=1", 3, "page").unwrap(),
///     "https://example.com/search?q=test&page=3"
/// );
/// ```
pub fn paginated_url(url: &str, page: i64, param: &str) -> Result<String> {
    let mut parsed = Url::parse(url)?;
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair(param, &page.to_string());
    Ok(parsed.to_string())
}

/// Reads an integer either directly from config or via XPath from the page
fn config_int(html: &str, value: &Value) -> Result<i64> {
    if let Some(number) = value.as_i64() {
        return Ok(number);
    }
    let expr = value
        .as_str()
        .ok_or_else(|| SumiError::MetaData(format!("Not a number or XPath: {}", value)))?;
    let extracted = extract_xpath(html, expr)?.unwrap_or_default();
    let digits = regex_first(r"\d+", &extracted)?;
    digits
        .parse::<i64>()
        .map_err(|e| SumiError::MetaData(format!("{}: {}", digits, e)))
}

/// Determines the next page number from a pagination config
///
/// The config uses either `total` and `per_page`, or `total_pages`. Each
/// value is an integer or an XPath expression evaluated against the page.
///
/// # Returns
///
/// * `Ok(Some(n))` - There is a page `n = current + 1`
/// * `Ok(None)` - The current page is the last one
pub fn next_page(html: &str, current: i64, config: &Value) -> Result<Option<i64>> {
    if let (Some(total), Some(per_page)) = (config.get("total"), config.get("per_page")) {
        let total = config_int(html, total)?;
        let per_page = config_int(html, per_page)?;
        if current * per_page < total {
            return Ok(Some(current + 1));
        }
    }
    if let Some(total_pages) = config.get("total_pages") {
        if current < config_int(html, total_pages)? {
            return Ok(Some(current + 1));
        }
    }
    Ok(None)
}
