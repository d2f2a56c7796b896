//! URL splitting and percent-encoding

use crate::{Error, Result, HTTPS_PORT, HTTP_PORT};
use ::url::form_urlencoded;

/// Components of `scheme://host[:port]/path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Always starts with `/`
    pub path: String,
}

/// Split a URL into host, port, path and whether it is secure
///
/// The scheme is optional (`http`, `https`, `ws`, `wss`, case-insensitive);
/// without one the URL is treated as insecure. The port defaults from the
/// scheme. Nothing is percent-decoded.
pub fn parse_url(url: &str) -> Result<ParsedUrl> {
    let (secure, rest) = match url.split_once("://") {
        Some((scheme, rest)) => {
            let secure = if scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss") {
                true
            } else if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("ws") {
                false
            } else {
                return Err(Error::Url(format!("unsupported scheme '{}'", scheme)));
            };
            (secure, rest)
        }
        None => (false, url),
    };

    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, path),
        None => (rest, ""),
    };

    if authority.is_empty() {
        return Err(Error::Url(format!("missing host in '{}'", url)));
    }

    let (host, port) = split_authority(authority)?;
    if host.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::Url(format!("invalid host '{}'", host)));
    }
    let port = port.unwrap_or(if secure { HTTPS_PORT } else { HTTP_PORT });

    Ok(ParsedUrl {
        secure,
        host: host.to_string(),
        port,
        path: format!("/{}", path),
    })
}

fn split_authority(authority: &str) -> Result<(&str, Option<u16>)> {
    // Bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| Error::Url(format!("unterminated IPv6 literal '{}'", authority)))?;
        let port = match after.strip_prefix(':') {
            Some(port) => Some(parse_port(port)?),
            None if after.is_empty() => None,
            None => return Err(Error::Url(format!("invalid authority '{}'", authority))),
        };
        return Ok((host, port));
    }

    match authority.split_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host, Some(parse_port(port)?))),
        Some(_) => Err(Error::Url(format!("missing host in '{}'", authority))),
        None => Ok((authority, None)),
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::Url(format!("invalid port '{}'", port)))
}

/// Percent-encode for query strings and form bodies
///
/// Alphanumerics and `*-._` pass through, space becomes `+`, every other
/// byte becomes `%XX` with uppercase hex.
pub fn encode_url(src: &str) -> String {
    form_urlencoded::byte_serialize(src.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let url = parse_url("https://example.com:8443/api/v1?x=1").unwrap();
        assert!(url.secure);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 8443);
        assert_eq!(url.path, "/api/v1?x=1");
    }

    #[test]
    fn test_default_ports_and_paths() {
        let url = parse_url("http://example.com").unwrap();
        assert_eq!((url.port, url.path.as_str(), url.secure), (80, "/", false));

        let url = parse_url("WSS://chat.local/socket").unwrap();
        assert_eq!((url.port, url.path.as_str(), url.secure), (443, "/socket", true));

        let url = parse_url("ws://chat.local:9000").unwrap();
        assert_eq!((url.port, url.secure), (9000, false));
    }

    #[test]
    fn test_schemeless_is_insecure() {
        let url = parse_url("localhost:8080/health").unwrap();
        assert!(!url.secure);
        assert_eq!(url.host, "localhost");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/health");
    }

    #[test]
    fn test_ipv6_literal() {
        let url = parse_url("http://[::1]:8080/").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 8080);
    }

    #[test]
    fn test_invalid_urls() {
        assert!(parse_url("ftp://example.com").is_err());
        assert!(parse_url("http://").is_err());
        assert!(parse_url("http://host:notaport/").is_err());
        assert!(parse_url("http://:80/").is_err());
        assert!(parse_url("not a url").is_err());
        assert!(parse_url("socks5://proxy:1080").is_err());
    }

    #[test]
    fn test_encode_url() {
        assert_eq!(encode_url("a b"), "a+b");
        assert_eq!(encode_url("safe-*._AZ09"), "safe-*._AZ09");
        assert_eq!(encode_url("a/b?c=d&e"), "a%2Fb%3Fc%3Dd%26e");
        assert_eq!(encode_url("é"), "%C3%A9");
        assert_eq!(encode_url("~+\n"), "%7E%2B%0A");
        assert_eq!(encode_url(""), "");
    }
}
