use std::time::Duration;

use skimmer_core::error::AppError;
use skimmer_core::models::ExtractedContent;
use skimmer_core::traits::Extractor;

use crate::cleaner::MarkdownCleaner;
use crate::fetcher::PageFetcher;
use crate::parser::PageParser;

/// Reference [`Extractor`]: fetch over HTTP, locate the main content with
/// scraper, convert it to Markdown with htmd.
#[derive(Clone)]
pub struct HttpExtractor {
    fetcher: PageFetcher,
    parser: PageParser,
    cleaner: MarkdownCleaner,
}

impl HttpExtractor {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            fetcher: PageFetcher::with_timeout(timeout)?,
            parser: PageParser::new()?,
            cleaner: MarkdownCleaner::new(),
        })
    }

    /// Disable SSRF protection on the underlying fetcher.
    pub fn allow_private_urls(mut self) -> Self {
        self.fetcher = self.fetcher.allow_private_urls();
        self
    }

    /// Everything after the network round-trip. Kept synchronous because the
    /// parsed document is not `Send`.
    fn build_content(&self, html: &str, base: &url::Url) -> Result<ExtractedContent, AppError> {
        let page = self.parser.parse(html, base);
        let content = self.cleaner.clean(&page.main_html)?;

        let mut errors = Vec::new();
        if page.title.is_none() {
            errors.push("no title found".to_string());
        }
        let success = !content.is_empty();
        if !success {
            errors.push(format!("no readable content at {base}"));
        }

        Ok(ExtractedContent {
            kind: page.kind,
            title: page.title,
            content,
            media: page.media,
            success,
            errors,
        })
    }
}

impl Extractor for HttpExtractor {
    async fn extract(&self, url: &str) -> Result<ExtractedContent, AppError> {
        let page = self.fetcher.fetch(url).await?;
        tracing::debug!(url, final_url = %page.url, bytes = page.body.len(), "Fetched page");
        self.build_content(&page.body, &page.url)
    }
}
