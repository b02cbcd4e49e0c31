//! Full document fetch and text extraction.

use std::collections::BTreeMap;

use reqwest::{Client, Response, header};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use url::Url;

use corpus_markdown::{convert, count_words, normalize_pdf_text};
use corpus_shared::{AcquisitionError, ExtractionError};

use crate::extract::{detect_paywall, extract_page};
use crate::gate::GateConfig;
use crate::preflight::{
    DocumentKind, Probe, check_pdf_size, check_redirect, check_status, classify, header_str,
    map_request_error,
};

/// Upper bound on HTML and text bodies.
pub const MAX_PAGE_BYTES: u64 = 10 * 1024 * 1024;

const PDF_MAGIC: &[u8] = b"%PDF";

/// A fetched and extracted document.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub kind: DocumentKind,
    /// Page HTML, or PDF text before normalization.
    pub raw: String,
    /// Text handed to the quality filter and cleaner.
    pub extracted: String,
    pub metadata: BTreeMap<String, Value>,
}

/// GET the document the probe vetted and extract its text.
#[instrument(skip_all, fields(url = %url))]
pub async fn fetch_document(
    client: &Client,
    url: &Url,
    probe: &Probe,
    config: &GateConfig,
) -> Result<FetchedDocument, AcquisitionError> {
    let timeout = config.per_call_timeout;
    let (bytes, final_url, status, content_type, kind) =
        tokio::time::timeout(timeout, download(client, url, probe, config))
            .await
            .map_err(|_| AcquisitionError::Timeout { elapsed: timeout })??;

    let mut metadata = BTreeMap::new();
    metadata.insert("content_sha256".into(), Value::from(compute_hash(&bytes)));
    metadata.insert("final_url".into(), Value::from(final_url.as_str()));
    metadata.insert("http_status".into(), Value::from(status));
    metadata.insert("byte_length".into(), Value::from(bytes.len()));
    if let Some(ct) = &content_type {
        metadata.insert("content_type".into(), Value::from(ct.as_str()));
    }

    let doc = match kind {
        DocumentKind::Pdf => extract_pdf(bytes, config, metadata).await?,
        DocumentKind::Html => extract_html(&bytes, metadata)?,
        DocumentKind::Text => extract_text(&bytes, metadata)?,
    };

    debug!(
        kind = ?doc.kind,
        raw_len = doc.raw.len(),
        extracted_len = doc.extracted.len(),
        "document extracted"
    );
    Ok(doc)
}

async fn download(
    client: &Client,
    url: &Url,
    probe: &Probe,
    config: &GateConfig,
) -> Result<(Vec<u8>, Url, u16, Option<String>, DocumentKind), AcquisitionError> {
    let response = client
        .get(probe.final_url.as_str())
        .send()
        .await
        .map_err(|e| map_request_error(e, config.per_call_timeout))?;

    let final_url = response.url().clone();
    check_redirect(url, &final_url)?;
    check_status(response.status())?;
    let status = response.status().as_u16();

    let content_type = header_str(response.headers(), header::CONTENT_TYPE);
    let mut kind = match content_type.as_deref() {
        Some(ct) => classify(Some(ct), &final_url)?,
        None => probe.kind,
    };

    let cap = match kind {
        DocumentKind::Pdf => {
            let declared = header_str(response.headers(), header::CONTENT_LENGTH)
                .and_then(|v| v.parse::<u64>().ok());
            check_pdf_size(declared, config.pdf_size_cap_bytes)?;
            config.pdf_size_cap_bytes
        }
        _ => MAX_PAGE_BYTES.max(config.pdf_size_cap_bytes),
    };

    let bytes = read_capped(response, cap, kind == DocumentKind::Pdf, config).await?;

    // Servers routinely mislabel PDFs.
    if kind != DocumentKind::Pdf && bytes.starts_with(PDF_MAGIC) {
        debug!("body is a PDF despite its content type");
        check_pdf_size(Some(bytes.len() as u64), config.pdf_size_cap_bytes)?;
        kind = DocumentKind::Pdf;
    }

    Ok((bytes, final_url, status, content_type, kind))
}

/// Stream the body, stopping as soon as it exceeds `cap`.
async fn read_capped(
    mut response: Response,
    cap: u64,
    is_pdf: bool,
    config: &GateConfig,
) -> Result<Vec<u8>, AcquisitionError> {
    let mut bytes: Vec<u8> = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| map_request_error(e, config.per_call_timeout))?
    {
        bytes.extend_from_slice(&chunk);
        let size = bytes.len() as u64;
        if size > cap {
            return Err(if is_pdf {
                ExtractionError::PdfTooLarge { size, cap }.into()
            } else {
                ExtractionError::Conversion(format!("body exceeds {cap} bytes")).into()
            });
        }
    }
    Ok(bytes)
}

async fn extract_pdf(
    bytes: Vec<u8>,
    config: &GateConfig,
    mut metadata: BTreeMap<String, Value>,
) -> Result<FetchedDocument, AcquisitionError> {
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(ExtractionError::PdfInvalid("missing %PDF header".into()).into());
    }
    metadata.insert("pdf_bytes".into(), Value::from(bytes.len()));

    // pdf-extract is CPU-bound and panics on some malformed files.
    let handle = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes));
    let raw = tokio::time::timeout(config.per_call_timeout, handle)
        .await
        .map_err(|_| AcquisitionError::Timeout {
            elapsed: config.per_call_timeout,
        })?
        .map_err(|e| {
            warn!(error = %e, "pdf extraction task failed");
            ExtractionError::PdfInvalid("extractor crashed".into())
        })?
        .map_err(|e| ExtractionError::PdfInvalid(e.to_string()))?;

    let extracted = normalize_pdf_text(&raw);
    let word_count = count_words(&extracted);
    if word_count == 0 {
        return Err(ExtractionError::Empty.into());
    }
    metadata.insert("word_count".into(), Value::from(word_count));

    Ok(FetchedDocument {
        kind: DocumentKind::Pdf,
        raw,
        extracted,
        metadata,
    })
}

fn extract_html(
    bytes: &[u8],
    mut metadata: BTreeMap<String, Value>,
) -> Result<FetchedDocument, AcquisitionError> {
    let html = String::from_utf8_lossy(bytes).into_owned();
    let page = extract_page(&html);
    let converted = convert(&page.content_html)
        .map_err(|e| ExtractionError::Conversion(e.to_string()))?;

    if let Some(signal) = detect_paywall(&html, converted.word_count) {
        return Err(AcquisitionError::PaywallDetected { signal });
    }
    if converted.word_count == 0 {
        return Err(ExtractionError::Empty.into());
    }

    let title = page.title.or(converted.title);
    for (key, value) in [
        ("title", title),
        ("author", page.author),
        ("published_date", page.published_date),
        ("description", page.description),
        ("site_name", page.site_name),
        ("language", page.language),
    ] {
        if let Some(v) = value {
            metadata.insert(key.into(), Value::from(v));
        }
    }
    metadata.insert("content_selector".into(), Value::from(page.content_selector));
    metadata.insert("word_count".into(), Value::from(converted.word_count));

    Ok(FetchedDocument {
        kind: DocumentKind::Html,
        raw: html,
        extracted: converted.text,
        metadata,
    })
}

fn extract_text(
    bytes: &[u8],
    mut metadata: BTreeMap<String, Value>,
) -> Result<FetchedDocument, AcquisitionError> {
    let raw = String::from_utf8_lossy(bytes).into_owned();
    let extracted = raw
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    let word_count = count_words(&extracted);
    if word_count == 0 {
        return Err(ExtractionError::Empty.into());
    }
    metadata.insert("word_count".into(), Value::from(word_count));

    Ok(FetchedDocument {
        kind: DocumentKind::Text,
        raw,
        extracted: format!("{extracted}\n"),
        metadata,
    })
}

/// SHA-256 hex digest of the fetched bytes.
pub(crate) fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::probe;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> GateConfig {
        GateConfig {
            allow_private_hosts: true,
            ..GateConfig::default()
        }
    }

    async fn fetch(server: &MockServer, p: &str) -> Result<FetchedDocument, AcquisitionError> {
        let cfg = config();
        let client = crate::gate::build_client(&cfg).unwrap();
        let url = Url::parse(&format!("{}{p}", server.uri())).unwrap();
        let probe = probe(&client, &url, &cfg).await?;
        fetch_document(&client, &url, &probe, &cfg).await
    }

    fn article(words: usize) -> String {
        let body = (0..words)
            .map(|i| format!("turbine{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            r#"<html><head><title>Wind Report</title><meta name="author" content="A. Writer"></head>
            <body><nav><a href="/">Home</a></nav><article><h1>Wind Report</h1><p>{body}</p></article></body></html>"#
        )
    }

    #[test]
    fn compute_hash_is_sha256_hex() {
        assert_eq!(
            compute_hash(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn html_is_extracted_with_metadata() {
        let server = MockServer::start().await;
        let html = article(120);
        Mock::given(path("/wind"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(html.clone(), "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let doc = fetch(&server, "/wind").await.unwrap();
        assert_eq!(doc.kind, DocumentKind::Html);
        assert_eq!(doc.raw, html);
        assert!(doc.extracted.contains("turbine119"));
        assert!(!doc.extracted.contains("Home"));
        assert_eq!(doc.metadata["title"], "Wind Report");
        assert_eq!(doc.metadata["author"], "A. Writer");
        assert_eq!(doc.metadata["http_status"], 200);
        assert_eq!(doc.metadata["content_sha256"], compute_hash(html.as_bytes()));
    }

    #[tokio::test]
    async fn plain_text_passes_through() {
        let server = MockServer::start().await;
        Mock::given(path("/notes.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("Line one of notes.   \nLine two.\n\n", "text/plain"),
            )
            .mount(&server)
            .await;

        let doc = fetch(&server, "/notes.txt").await.unwrap();
        assert_eq!(doc.kind, DocumentKind::Text);
        assert_eq!(doc.extracted, "Line one of notes.\nLine two.\n");
    }

    #[tokio::test]
    async fn thin_paywalled_page_fails() {
        let server = MockServer::start().await;
        Mock::given(path("/locked"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(
                        "<html><body><article><p>The first paragraph.</p>\
                         <p>Subscribe to continue reading.</p></article></body></html>",
                        "text/html",
                    ),
            )
            .mount(&server)
            .await;

        let err = fetch(&server, "/locked").await.unwrap_err();
        assert_eq!(err.kind(), "paywall-detected");
    }

    #[tokio::test]
    async fn empty_page_fails_extraction() {
        let server = MockServer::start().await;
        Mock::given(path("/blank"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html><body><script>app()</script></body></html>", "text/html"),
            )
            .mount(&server)
            .await;

        let err = fetch(&server, "/blank").await.unwrap_err();
        assert_eq!(err.kind(), "extraction-empty");
    }

    #[tokio::test]
    async fn fake_pdf_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(path("/paper.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(b"<html>not a pdf</html>".to_vec(), "application/pdf"),
            )
            .mount(&server)
            .await;

        let err = fetch(&server, "/paper.pdf").await.unwrap_err();
        assert_eq!(err.kind(), "pdf-invalid");
    }

    #[tokio::test]
    async fn pdf_body_over_cap_is_rejected() {
        let server = MockServer::start().await;
        let mut body = b"%PDF-1.7\n".to_vec();
        body.extend(std::iter::repeat_n(b'0', 4096));
        Mock::given(method("GET"))
            .and(path("/big.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body, "application/pdf"),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let cfg = GateConfig {
            pdf_size_cap_bytes: 1024,
            ..config()
        };
        let client = crate::gate::build_client(&cfg).unwrap();
        let url = Url::parse(&format!("{}/big.pdf", server.uri())).unwrap();
        let probe = probe(&client, &url, &cfg).await.unwrap();
        let err = fetch_document(&client, &url, &probe, &cfg).await.unwrap_err();
        assert_eq!(err.kind(), "pdf-too-large");
    }

    #[tokio::test]
    async fn server_error_maps_to_http() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "text/html"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = fetch(&server, "/flaky").await.unwrap_err();
        assert_eq!(err, AcquisitionError::Http { status: 503 });
        assert!(err.counts_against_domain());
    }
}
