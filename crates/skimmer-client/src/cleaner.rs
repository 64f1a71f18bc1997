use std::sync::Arc;

use htmd::HtmlToMarkdown;
use skimmer_core::error::AppError;

/// HTML-to-Markdown converter using htmd.
///
/// Drops non-content elements (script, style, nav, etc.) so the stored
/// Markdown holds only the readable body.
#[derive(Clone)]
pub struct MarkdownCleaner {
    converter: Arc<HtmlToMarkdown>,
}

impl MarkdownCleaner {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg",
                "form",
            ])
            .build();

        Self {
            converter: Arc::new(converter),
        }
    }

    /// Convert an HTML fragment. Conversion failures are terminal for the job.
    pub fn clean(&self, html: &str) -> Result<String, AppError> {
        self.converter
            .convert(html)
            .map(|md| md.trim().to_string())
            .map_err(|e| AppError::ExtractionError {
                message: format!("HTML conversion failed: {e}"),
                retryable: false,
            })
    }
}

impl Default for MarkdownCleaner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_html_to_markdown() {
        let cleaner = MarkdownCleaner::new();
        let md = cleaner.clean("<h1>Hello</h1><p>World</p>").unwrap();
        assert!(md.contains("Hello"));
        assert!(md.contains("World"));
    }

    #[test]
    fn test_strips_script_and_nav() {
        let cleaner = MarkdownCleaner::new();
        let html = "<nav>Menu</nav><p>Content</p><script>alert('xss')</script>";
        let md = cleaner.clean(html).unwrap();
        assert!(md.contains("Content"));
        assert!(!md.contains("alert"));
        assert!(!md.contains("Menu"));
    }
}
