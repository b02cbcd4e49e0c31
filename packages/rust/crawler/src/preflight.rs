//! Cheap checks that run before a full fetch.
//!
//! Host checks (scheme, private addresses, denylist) need no network. The
//! probe is a single HEAD request that catches login/SSO redirects, paywall
//! statuses, unsupported content types and oversized PDFs before any body
//! is downloaded.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::{Client, StatusCode, header};
use tracing::{debug, instrument};
use url::Url;

use corpus_shared::{AcquisitionError, ExtractionError};

use crate::gate::GateConfig;

/// Redirect targets that mean "you need an account to read this".
static LOGIN_REDIRECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|[/.])(?:login|log-in|signin|sign-in|sso|auth|oauth|subscribe|subscription|paywall|register)(?:[/.?#_-]|$)|^https?://(?:accounts|login|auth|sso)\.",
    )
    .expect("valid regex")
});

/// How a document will be turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Html,
    Pdf,
    /// Plain text or Markdown, used as-is.
    Text,
}

/// What the HEAD probe learned.
#[derive(Debug, Clone)]
pub struct Probe {
    pub kind: DocumentKind,
    /// URL after redirects.
    pub final_url: Url,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    /// The server refused HEAD; everything above is inferred from the URL.
    pub head_unsupported: bool,
}

// ---------------------------------------------------------------------------
// Host checks
// ---------------------------------------------------------------------------

/// Validate scheme, address and denylist. Returns the lowercased host.
pub fn check_host(url: &Url, config: &GateConfig) -> Result<String, AcquisitionError> {
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AcquisitionError::InvalidUrl(format!("{url}: no host")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(AcquisitionError::BlockedHost { host });
    }
    if !config.allow_private_hosts && is_ssrf_target(url) {
        return Err(AcquisitionError::BlockedHost { host });
    }
    if let Some(domain) = denylisted(&host, &config.domain_denylist) {
        return Err(AcquisitionError::Denylisted {
            domain: domain.to_string(),
        });
    }
    Ok(host)
}

/// The denylist entry matching `host` or one of its parent domains.
pub fn denylisted<'a>(host: &str, denylist: &'a BTreeSet<String>) -> Option<&'a str> {
    denylist
        .iter()
        .find(|d| host == d.as_str() || host.ends_with(&format!(".{d}")))
        .map(String::as_str)
}

/// Check if a URL targets a local or private network resource.
pub(crate) fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}

// ---------------------------------------------------------------------------
// HEAD probe
// ---------------------------------------------------------------------------

/// Issue a HEAD request and vet the response.
#[instrument(skip_all, fields(url = %url))]
pub async fn probe(client: &Client, url: &Url, config: &GateConfig) -> Result<Probe, AcquisitionError> {
    let timeout = config.per_call_timeout;
    let response = tokio::time::timeout(timeout, client.head(url.as_str()).send())
        .await
        .map_err(|_| AcquisitionError::Timeout { elapsed: timeout })?
        .map_err(|e| map_request_error(e, timeout))?;

    let status = response.status();
    let final_url = response.url().clone();

    if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
        debug!(status = status.as_u16(), "HEAD unsupported, inferring from URL");
        return Ok(Probe {
            kind: kind_from_path(url),
            final_url,
            content_type: None,
            content_length: None,
            head_unsupported: true,
        });
    }

    check_redirect(url, &final_url)?;
    check_status(status)?;

    let content_type = header_str(response.headers(), header::CONTENT_TYPE);
    let content_length = header_str(response.headers(), header::CONTENT_LENGTH)
        .and_then(|v| v.parse::<u64>().ok());
    let kind = classify(content_type.as_deref(), &final_url)?;

    if kind == DocumentKind::Pdf {
        check_pdf_size(content_length, config.pdf_size_cap_bytes)?;
    }

    debug!(?kind, ?content_length, "preflight passed");
    Ok(Probe {
        kind,
        final_url,
        content_type,
        content_length,
        head_unsupported: false,
    })
}

/// Fail when a redirect chain ended on a login, SSO or subscription page.
pub(crate) fn check_redirect(original: &Url, final_url: &Url) -> Result<(), AcquisitionError> {
    if original == final_url {
        return Ok(());
    }
    let target = format!(
        "{}://{}{}",
        final_url.scheme(),
        final_url.host_str().unwrap_or_default(),
        final_url.path()
    );
    if LOGIN_REDIRECT_RE.is_match(&target) {
        return Err(AcquisitionError::PaywallDetected {
            signal: format!("redirected to {final_url}"),
        });
    }
    Ok(())
}

/// Map a response status to an acquisition outcome.
pub(crate) fn check_status(status: StatusCode) -> Result<(), AcquisitionError> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        401 | 402 | 407 => Err(AcquisitionError::PaywallDetected {
            signal: format!("HTTP {}", status.as_u16()),
        }),
        code => Err(AcquisitionError::Http { status: code }),
    }
}

/// Decide how to handle a document from its content type, falling back to
/// the URL path when the type is missing or generic.
pub(crate) fn classify(content_type: Option<&str>, url: &Url) -> Result<DocumentKind, AcquisitionError> {
    let Some(raw) = content_type else {
        return Ok(kind_from_path(url));
    };
    let mime = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "" => Ok(kind_from_path(url)),
        "text/html" | "application/xhtml+xml" | "application/xml" | "text/xml" => {
            Ok(DocumentKind::Html)
        }
        "application/pdf" | "application/x-pdf" => Ok(DocumentKind::Pdf),
        "text/plain" | "text/markdown" | "text/x-markdown" => Ok(DocumentKind::Text),
        "application/octet-stream" | "binary/octet-stream"
            if kind_from_path(url) == DocumentKind::Pdf =>
        {
            Ok(DocumentKind::Pdf)
        }
        _ => Err(AcquisitionError::BlockedContentType { content_type: mime }),
    }
}

pub(crate) fn check_pdf_size(content_length: Option<u64>, cap: u64) -> Result<(), AcquisitionError> {
    match content_length {
        Some(size) if size > cap => Err(ExtractionError::PdfTooLarge { size, cap }.into()),
        _ => Ok(()),
    }
}

pub(crate) fn map_request_error(e: reqwest::Error, timeout: Duration) -> AcquisitionError {
    if e.is_timeout() {
        AcquisitionError::Timeout { elapsed: timeout }
    } else {
        AcquisitionError::Network(e.to_string())
    }
}

pub(crate) fn header_str(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn kind_from_path(url: &Url) -> DocumentKind {
    if url.path().to_ascii_lowercase().ends_with(".pdf") {
        DocumentKind::Pdf
    } else {
        DocumentKind::Html
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> GateConfig {
        GateConfig {
            allow_private_hosts: true,
            ..GateConfig::default()
        }
    }

    fn client() -> Client {
        crate::gate::build_client(&config()).unwrap()
    }

    #[test]
    fn ssrf_blocks_file_and_private_hosts() {
        for u in [
            "file:///etc/passwd",
            "http://127.0.0.1/admin",
            "http://10.0.0.5/",
            "http://169.254.169.254/latest/meta-data",
            "http://localhost:8080/",
            "http://printer.local/",
            "http://[::1]/",
            "http://[fd00::1]/",
        ] {
            assert!(is_ssrf_target(&Url::parse(u).unwrap()), "{u}");
        }
        assert!(!is_ssrf_target(&Url::parse("https://example.com/").unwrap()));
        assert!(!is_ssrf_target(&Url::parse("http://8.8.8.8/").unwrap()));
    }

    #[test]
    fn check_host_applies_denylist_to_subdomains() {
        let cfg = GateConfig::default();
        let err = check_host(&Url::parse("https://www.pinterest.com/pin/1").unwrap(), &cfg)
            .unwrap_err();
        assert_eq!(err.kind(), "denylisted-domain");

        // Suffix match only on label boundaries.
        assert_eq!(
            check_host(&Url::parse("https://notpinterest.com/").unwrap(), &cfg).unwrap(),
            "notpinterest.com"
        );

        let err = check_host(&Url::parse("http://127.0.0.1/").unwrap(), &cfg).unwrap_err();
        assert_eq!(err.kind(), "blocked-host");
        assert!(check_host(&Url::parse("http://127.0.0.1/").unwrap(), &config()).is_ok());
    }

    #[test]
    fn classify_content_types() {
        let page = Url::parse("https://a.example/page").unwrap();
        let pdf = Url::parse("https://a.example/report.PDF").unwrap();

        assert_eq!(classify(Some("text/html; charset=utf-8"), &page).unwrap(), DocumentKind::Html);
        assert_eq!(classify(Some("application/pdf"), &page).unwrap(), DocumentKind::Pdf);
        assert_eq!(classify(Some("text/plain"), &page).unwrap(), DocumentKind::Text);
        assert_eq!(classify(None, &pdf).unwrap(), DocumentKind::Pdf);
        assert_eq!(
            classify(Some("application/octet-stream"), &pdf).unwrap(),
            DocumentKind::Pdf
        );

        let err = classify(Some("image/png"), &page).unwrap_err();
        assert_eq!(err.to_string(), "blocked-content-type: image/png");
        assert!(classify(Some("application/octet-stream"), &page).is_err());
    }

    #[test]
    fn login_redirects_are_paywalls() {
        let original = Url::parse("https://news.example/story/1").unwrap();
        for target in [
            "https://news.example/login?next=/story/1",
            "https://accounts.example.com/o/oauth2",
            "https://news.example/subscribe",
            "https://sso.example.org/start",
        ] {
            let err = check_redirect(&original, &Url::parse(target).unwrap()).unwrap_err();
            assert_eq!(err.kind(), "paywall-detected", "{target}");
        }
        assert!(check_redirect(&original, &Url::parse("https://news.example/story/1/").unwrap()).is_ok());
        assert!(
            check_redirect(&original, &Url::parse("https://news.example/authors-on-energy").unwrap())
                .is_ok()
        );
    }

    #[test]
    fn status_mapping() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert_eq!(check_status(StatusCode::PAYMENT_REQUIRED).unwrap_err().kind(), "paywall-detected");
        assert_eq!(
            check_status(StatusCode::NOT_FOUND).unwrap_err(),
            AcquisitionError::Http { status: 404 }
        );
    }

    #[tokio::test]
    async fn probe_reads_type_and_length() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/paper.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .insert_header("content-length", "1024"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/paper.pdf", server.uri())).unwrap();
        let probe = probe(&client(), &url, &config()).await.unwrap();
        assert_eq!(probe.kind, DocumentKind::Pdf);
        assert!(!probe.head_unsupported);
    }

    #[tokio::test]
    async fn probe_rejects_oversized_pdf() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .insert_header("content-length", "999999999"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/huge.pdf", server.uri())).unwrap();
        let err = probe(&client(), &url, &config()).await.unwrap_err();
        assert_eq!(err.kind(), "pdf-too-large");
    }

    #[tokio::test]
    async fn probe_tolerates_head_not_allowed() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/doc.pdf", server.uri())).unwrap();
        let probe = probe(&client(), &url, &config()).await.unwrap();
        assert!(probe.head_unsupported);
        assert_eq!(probe.kind, DocumentKind::Pdf);
    }

    #[tokio::test]
    async fn probe_detects_login_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/article"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "/login?return=/article"),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "text/html"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/article", server.uri())).unwrap();
        let err = probe(&client(), &url, &config()).await.unwrap_err();
        assert_eq!(err.kind(), "paywall-detected");
    }

    #[tokio::test]
    async fn probe_blocks_images() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "image/jpeg"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/photo", server.uri())).unwrap();
        let err = probe(&client(), &url, &config()).await.unwrap_err();
        assert_eq!(err.kind(), "blocked-content-type");
    }
}
