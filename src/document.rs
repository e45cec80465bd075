//! Document download and page-level text extraction.
//!
//! Documents are fetched by URL, streamed to scoped temporary storage, and handed to a
//! [`TextExtractor`] for page extraction. The temporary file is removed on every exit path,
//! including failures, via the RAII guard. Persistent download or extraction failures degrade
//! to a single synthetic page so the rest of the pipeline can still produce an answer set.

use crate::errors::QueryError;
use crate::resilience::{self, RetryPolicy, timeouts};
use anyhow::{Context, bail};
use futures_util::StreamExt;
use reqwest::Client;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Upper bound on document size in bytes.
const MAX_DOCUMENT_BYTES: u64 = 50 * 1024 * 1024;
/// Minimum total characters a usable extraction must yield.
const MIN_CONTENT_CHARS: usize = 10;
/// Placeholder page content substituted when acquisition fails for good.
pub const DOCUMENT_FALLBACK_TEXT: &str =
    "Document processing failed. Please try again with a different document or check the URL.";

/// One page of extracted document content.
#[derive(Debug, Clone)]
pub struct PageText {
    /// Extracted text for this page.
    pub content: String,
    /// Origin metadata; always carries `source` (the URL) and `page`.
    pub metadata: BTreeMap<String, String>,
}

impl PageText {
    fn new(content: String, source: &str, page: usize) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), source.to_string());
        metadata.insert("page".to_string(), page.to_string());
        Self { content, metadata }
    }
}

/// Black-box page-text extraction collaborator.
///
/// Implementations run inside `spawn_blocking`; they may do arbitrary CPU or subprocess work.
pub trait TextExtractor: Send + Sync {
    /// Extract per-page text from the file at `path`.
    fn extract(&self, path: &Path) -> anyhow::Result<Vec<String>>;
}

/// Extractor shelling out to `pdftotext`, splitting pages on form feed.
pub struct PopplerExtractor;

impl TextExtractor for PopplerExtractor {
    fn extract(&self, path: &Path) -> anyhow::Result<Vec<String>> {
        let output = Command::new("pdftotext")
            .arg(path)
            .arg("-")
            .output()
            .context("failed to run pdftotext (is poppler installed?)")?;

        if !output.status.success() {
            bail!(
                "pdftotext failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        let pages: Vec<String> = text
            .split('\u{c}')
            .filter(|page| !page.trim().is_empty())
            .map(str::to_string)
            .collect();

        if pages.is_empty() {
            bail!("pdftotext produced no text output");
        }
        Ok(pages)
    }
}

/// Downloads documents and turns them into page-level text records.
pub struct DocumentFetcher {
    pub(crate) http: Client,
    pub(crate) extractor: Arc<dyn TextExtractor>,
    pub(crate) retry: RetryPolicy,
    pub(crate) max_bytes: u64,
}

impl DocumentFetcher {
    /// Construct a fetcher around the given extractor.
    pub fn new(extractor: Arc<dyn TextExtractor>) -> Self {
        let http = Client::builder()
            .user_agent("docquery/0.3")
            .connect_timeout(timeouts::HTTP_CONNECT)
            .timeout(timeouts::DOCUMENT_DOWNLOAD)
            .build()
            .expect("Failed to construct reqwest::Client for downloads");
        Self {
            http,
            extractor,
            retry: RetryPolicy::new(3, 2.0),
            max_bytes: MAX_DOCUMENT_BYTES,
        }
    }

    /// Fetch the document at `url` and extract its pages.
    ///
    /// A malformed URL is rejected outright; transient download or extraction failures are
    /// retried with backoff, and persistent failure degrades to a single placeholder page
    /// rather than aborting the request.
    pub async fn acquire(&self, url: &str) -> Result<Vec<PageText>, QueryError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|error| QueryError::document("url_validation", error))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(QueryError::document(
                "url_validation",
                format!("unsupported URL scheme '{}'", parsed.scheme()),
            ));
        }

        resilience::with_fallback(
            "document_processing",
            || async {
                self.retry
                    .run("document_processing", QueryError::is_transient, || {
                        self.fetch_and_extract(url)
                    })
                    .await
            },
            || async {
                tracing::warn!(url, "Document acquisition exhausted retries; using fallback page");
                Ok(fallback_pages(url))
            },
        )
        .await
    }

    async fn fetch_and_extract(&self, url: &str) -> Result<Vec<PageText>, QueryError> {
        tracing::info!(url, "Starting document download");
        let temp_file = self.download_to_temp(url).await?;

        let pages = resilience::with_timeout(
            self.extract_pages(temp_file.path()),
            timeouts::DOCUMENT_PROCESSING,
            "pdf_processing",
        )
        .await?;

        let total_chars: usize = pages.iter().map(|page| page.chars().count()).sum();
        if pages.is_empty() || total_chars < MIN_CONTENT_CHARS {
            return Err(QueryError::document(
                "content_validation",
                format!("extracted content is too short ({total_chars} characters)"),
            ));
        }

        tracing::info!(
            url,
            pages = pages.len(),
            characters = total_chars,
            "Document processed"
        );

        Ok(pages
            .into_iter()
            .enumerate()
            .map(|(index, content)| PageText::new(content, url, index + 1))
            .collect())
    }

    async fn download_to_temp(&self, url: &str) -> Result<tempfile::NamedTempFile, QueryError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| QueryError::external_service("document_download", error))?;

        if !response.status().is_success() {
            return Err(QueryError::external_service(
                "document_download",
                format!("HTTP {}", response.status()),
            ));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.is_empty()
            && !content_type.contains("pdf")
            && !content_type.contains("application/octet-stream")
        {
            tracing::warn!(url, content_type = %content_type, "Unexpected content type for document");
        }

        if let Some(declared) = response.content_length()
            && declared > self.max_bytes
        {
            return Err(QueryError::document(
                "file_size",
                format!(
                    "document too large: {:.1}MB (max {}MB)",
                    declared as f64 / (1024.0 * 1024.0),
                    self.max_bytes / (1024 * 1024)
                ),
            ));
        }

        let temp_file = tempfile::NamedTempFile::new()
            .map_err(|error| QueryError::document("temp_storage", error))?;
        let reopened = temp_file
            .reopen()
            .map_err(|error| QueryError::document("temp_storage", error))?;
        let mut writer = tokio::fs::File::from_std(reopened);

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|error| QueryError::external_service("document_download", error))?;
            downloaded += chunk.len() as u64;
            if downloaded > self.max_bytes {
                return Err(QueryError::document(
                    "file_size",
                    format!(
                        "document exceeded the {} byte limit during download",
                        self.max_bytes
                    ),
                ));
            }
            writer
                .write_all(&chunk)
                .await
                .map_err(|error| QueryError::document("temp_storage", error))?;
        }
        writer
            .flush()
            .await
            .map_err(|error| QueryError::document("temp_storage", error))?;

        tracing::debug!(url, bytes = downloaded, "Download completed");
        Ok(temp_file)
    }

    async fn extract_pages(&self, path: &Path) -> Result<Vec<String>, QueryError> {
        let extractor = Arc::clone(&self.extractor);
        let path = path.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extractor.extract(&path))
            .await
            .map_err(|error| QueryError::document("pdf_processing", error))?;
        extracted.map_err(|error| QueryError::document("pdf_processing", error))
    }
}

fn fallback_pages(url: &str) -> Vec<PageText> {
    let mut page = PageText::new(DOCUMENT_FALLBACK_TEXT.to_string(), url, 1);
    page.metadata
        .insert("fallback".to_string(), "true".to_string());
    vec![page]
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};

    struct StubExtractor {
        pages: Vec<String>,
    }

    impl TextExtractor for StubExtractor {
        fn extract(&self, _path: &Path) -> anyhow::Result<Vec<String>> {
            Ok(self.pages.clone())
        }
    }

    struct FailingExtractor;

    impl TextExtractor for FailingExtractor {
        fn extract(&self, _path: &Path) -> anyhow::Result<Vec<String>> {
            bail!("malformed PDF")
        }
    }

    fn fetcher_with(extractor: Arc<dyn TextExtractor>) -> DocumentFetcher {
        DocumentFetcher {
            http: Client::builder()
                .user_agent("docquery-test")
                .build()
                .expect("client"),
            extractor,
            retry: RetryPolicy::new(1, 0.001),
            max_bytes: MAX_DOCUMENT_BYTES,
        }
    }

    #[tokio::test]
    async fn acquire_extracts_pages_with_source_metadata() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/policy.pdf");
                then.status(200)
                    .header("content-type", "application/pdf")
                    .body("%PDF-1.4 fake body");
            })
            .await;

        let fetcher = fetcher_with(Arc::new(StubExtractor {
            pages: vec!["First page text".into(), "Second page text".into()],
        }));
        let url = format!("{}/policy.pdf", server.base_url());
        let pages = fetcher.acquire(&url).await.expect("pages");

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].metadata.get("source"), Some(&url));
        assert_eq!(pages[0].metadata.get("page"), Some(&"1".to_string()));
        assert_eq!(pages[1].content, "Second page text");
    }

    #[tokio::test]
    async fn acquire_rejects_malformed_urls_without_fallback() {
        let fetcher = fetcher_with(Arc::new(StubExtractor { pages: vec![] }));
        let error = fetcher.acquire("not a url").await.unwrap_err();
        assert!(matches!(
            error,
            QueryError::DocumentProcessing { ref operation, .. } if operation == "url_validation"
        ));
    }

    #[tokio::test]
    async fn acquire_degrades_to_fallback_page_when_download_keeps_failing() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gone.pdf");
                then.status(500).body("upstream broken");
            })
            .await;

        let fetcher = fetcher_with(Arc::new(StubExtractor { pages: vec![] }));
        let url = format!("{}/gone.pdf", server.base_url());
        let pages = fetcher.acquire(&url).await.expect("fallback page");

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].content, DOCUMENT_FALLBACK_TEXT);
        assert_eq!(pages[0].metadata.get("fallback"), Some(&"true".to_string()));
    }

    #[tokio::test]
    async fn acquire_degrades_to_fallback_page_when_extraction_fails() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/broken.pdf");
                then.status(200).body("not really a pdf");
            })
            .await;

        let fetcher = fetcher_with(Arc::new(FailingExtractor));
        let url = format!("{}/broken.pdf", server.base_url());
        let pages = fetcher.acquire(&url).await.expect("fallback page");

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].content, DOCUMENT_FALLBACK_TEXT);
    }

    #[tokio::test]
    async fn acquire_rejects_documents_over_the_size_ceiling() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/huge.pdf");
                then.status(200).body("this body is longer than the tiny cap");
            })
            .await;

        let mut fetcher = fetcher_with(Arc::new(StubExtractor { pages: vec![] }));
        fetcher.max_bytes = 16;
        let url = format!("{}/huge.pdf", server.base_url());
        // Size rejection is not transient, so the fallback page is the observable outcome.
        let pages = fetcher.acquire(&url).await.expect("fallback page");
        assert_eq!(pages[0].content, DOCUMENT_FALLBACK_TEXT);
    }

    #[tokio::test]
    async fn short_extractions_fail_content_validation_and_fall_back() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tiny.pdf");
                then.status(200).body("x");
            })
            .await;

        let fetcher = fetcher_with(Arc::new(StubExtractor {
            pages: vec!["hi".into()],
        }));
        let url = format!("{}/tiny.pdf", server.base_url());
        let pages = fetcher.acquire(&url).await.expect("fallback page");
        assert_eq!(pages[0].content, DOCUMENT_FALLBACK_TEXT);
    }
}
