//! Scans tunnel child process output for published URLs.
//!
//! Tunnel binaries typically print the public URL to stdout or stderr
//! once the connection is registered; the exact wording varies by
//! provider, so this matches on the URL shape rather than surrounding
//! text.

use super::TunnelUrls;

/// Scan a single line of output for an `https://` URL and derive the
/// matching `wss://` URL from it. Returns `None` if the line has no URL.
#[must_use]
pub fn scan_for_url(line: &str) -> Option<TunnelUrls> {
    let start = line.find("https://")?;
    let candidate = &line[start..];
    let end = candidate
        .find(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .unwrap_or(candidate.len());
    let http_url = candidate[..end].trim_end_matches(['.', ',', ')']).to_string();
    if http_url.len() <= "https://".len() {
        return None;
    }
    let ws_url = format!("wss://{}", &http_url["https://".len()..]);
    Some(TunnelUrls { http_url, ws_url })
}

/// True if `line` is the tunnel binary's readiness marker for `named`
/// mode — the pre-configured hostname is already known, so named mode
/// doesn't scrape a URL out of the line; it just waits for this
/// confirmation that the connection registered (§4.2).
#[must_use]
pub fn line_signals_named_registration(line: &str) -> bool {
    line.to_ascii_lowercase().contains("registered tunnel connection")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_url() {
        let urls = scan_for_url("your url is https://random-words.trycloudflare.com").unwrap();
        assert_eq!(urls.http_url, "https://random-words.trycloudflare.com");
        assert_eq!(urls.ws_url, "wss://random-words.trycloudflare.com");
    }

    #[test]
    fn trims_trailing_punctuation() {
        let urls = scan_for_url("connected (https://example.trycloudflare.com).").unwrap();
        assert_eq!(urls.http_url, "https://example.trycloudflare.com");
    }

    #[test]
    fn returns_none_without_url() {
        assert!(scan_for_url("starting tunnel...").is_none());
    }

    #[test]
    fn recognizes_the_named_registration_marker_case_insensitively() {
        assert!(line_signals_named_registration("INF Registered tunnel connection"));
        assert!(!line_signals_named_registration("your url is https://random.trycloudflare.com"));
    }
}
