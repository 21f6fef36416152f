use url::Url;

/// Extracts the domain from a URL
///
/// This function retrieves the host portion of a URL and normalizes it with
/// [`normalize_domain`]. URLs without a host (`mailto:`, `data:`) return None.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use sumi_pipeline::url::extract_domain;
///
/// let url = Url::parse("https://EXAMPLE.COM/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str()
        .map(normalize_domain)
        .filter(|host| !host.is_empty())
}

/// Lowercases a host name and trims surrounding dots and whitespace
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_matches('.').to_lowercase()
}

/// Checks if a host belongs to a domain
///
/// The host matches when it is the domain itself or any subdomain of it.
/// Both sides are normalized first, so `Example.COM.` matches `example.com`.
///
/// # Arguments
///
/// * `domain` - The configured domain, e.g. `example.com`
/// * `host` - The host of the URL being checked
///
/// # Examples
///
/// ```
/// use sumi_pipeline::url::domain_matches;
///
/// assert!(domain_matches("example.com", "example.com"));
/// assert!(domain_matches("example.com", "api.v2.example.com"));
/// assert!(!domain_matches("example.com", "badexample.com"));
/// ```
pub fn domain_matches(domain: &str, host: &str) -> bool {
    let domain = normalize_domain(domain);
    let host = normalize_domain(host);
    if domain.is_empty() || host.is_empty() {
        return false;
    }
    host == domain || host.ends_with(&format!(".{}", domain))
}
