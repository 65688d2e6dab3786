use url::Url;

/// Parse user input into an http(s) URL. A bare host (`example.com/x`) is
/// given an `https://` scheme.
pub fn parse_web_url(input: &str) -> Option<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let url = Url::parse(&candidate).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()?;
    Some(url)
}

/// Lowercase hostname without scheme, port, path or trailing dot.
pub fn normalize_host(input: &str) -> Option<String> {
    let url = parse_web_url(input)?;
    let host = url.host_str()?.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Hostname of an already well-formed URL. Unlike [`parse_web_url`] this does
/// not invent a scheme: navigation targets must be absolute.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// True when `host` is `site` or one of its subdomains.
pub fn host_matches(host: &str, site: &str) -> bool {
    host == site
        || (host.len() > site.len()
            && host.ends_with(site)
            && host.as_bytes()[host.len() - site.len() - 1] == b'.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_scheme_port_path() {
        assert_eq!(
            normalize_host("https://Example.COM:8443/path?q=1").as_deref(),
            Some("example.com")
        );
        assert_eq!(normalize_host("example.com.").as_deref(), Some("example.com"));
        assert_eq!(normalize_host("news.example.com/a/b").as_deref(), Some("news.example.com"));
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert_eq!(normalize_host(""), None);
        assert_eq!(normalize_host("ftp://example.com"), None);
        assert_eq!(normalize_host("https://"), None);
    }

    #[test]
    fn test_host_of_requires_scheme() {
        assert_eq!(host_of("https://a.example.com/x").as_deref(), Some("a.example.com"));
        assert_eq!(host_of("example.com"), None);
        assert_eq!(host_of("javascript:alert(1)"), None);
    }

    #[test]
    fn test_host_matches_subdomains_only_on_label_boundary() {
        assert!(host_matches("example.com", "example.com"));
        assert!(host_matches("www.example.com", "example.com"));
        assert!(!host_matches("badexample.com", "example.com"));
        assert!(!host_matches("example.com", "www.example.com"));
    }
}
