pub mod cleaner;
pub mod extractor;
pub mod fetcher;
pub mod parser;

pub use cleaner::MarkdownCleaner;
pub use extractor::HttpExtractor;
pub use fetcher::{FetchedPage, PageFetcher};
pub use parser::{PageParser, ParsedPage};
