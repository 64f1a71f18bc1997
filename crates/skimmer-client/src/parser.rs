use std::collections::HashSet;
use std::sync::Arc;

use scraper::{ElementRef, Html, Selector};
use skimmer_core::error::AppError;
use skimmer_core::models::MediaItem;
use url::Url;

/// Elements tried in order when looking for the main body.
const MAIN_CANDIDATES: &[&str] = &["article", "main", "[role=main]", "#content", "body"];

/// Media beyond this count is dropped.
const MAX_MEDIA: usize = 50;

/// What the parser pulled out of a page before Markdown conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    pub kind: String,
    pub title: Option<String>,
    /// Outer HTML of the main content element.
    pub main_html: String,
    pub media: Vec<MediaItem>,
}

struct Selectors {
    title: Selector,
    h1: Selector,
    og_title: Selector,
    og_type: Selector,
    og_image: Selector,
    img: Selector,
    video: Selector,
    main: Vec<Selector>,
}

/// Structural HTML parser built on scraper.
#[derive(Clone)]
pub struct PageParser {
    selectors: Arc<Selectors>,
}

fn selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css).map_err(|e| AppError::ConfigError(format!("bad selector '{css}': {e:?}")))
}

impl PageParser {
    pub fn new() -> Result<Self, AppError> {
        let selectors = Selectors {
            title: selector("head > title")?,
            h1: selector("h1")?,
            og_title: selector(r#"meta[property="og:title"]"#)?,
            og_type: selector(r#"meta[property="og:type"]"#)?,
            og_image: selector(r#"meta[property="og:image"]"#)?,
            img: selector("img[src]")?,
            video: selector("video[src], video > source[src]")?,
            main: MAIN_CANDIDATES
                .iter()
                .map(|css| selector(css))
                .collect::<Result<_, _>>()?,
        };
        Ok(Self {
            selectors: Arc::new(selectors),
        })
    }

    /// Parse `html` served from `base`. Relative media URLs are resolved
    /// against `base`; unresolvable ones are skipped.
    pub fn parse(&self, html: &str, base: &Url) -> ParsedPage {
        let doc = Html::parse_document(html);
        let s = &self.selectors;

        let title = meta_content(&doc, &s.og_title)
            .or_else(|| first_text(&doc, &s.title))
            .or_else(|| first_text(&doc, &s.h1));

        let kind = match meta_content(&doc, &s.og_type).as_deref() {
            Some("article") => "article",
            Some(t) if t.starts_with("video") => "video",
            Some("profile") => "profile",
            _ => "page",
        }
        .to_string();

        let main = s.main.iter().find_map(|sel| doc.select(sel).next());
        let main_html = main.map(|el| el.html()).unwrap_or_default();

        let mut media = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |kind: &str, src: &str, alt: Option<String>| {
            if media.len() >= MAX_MEDIA {
                return;
            }
            let Ok(url) = base.join(src.trim()) else {
                return;
            };
            if !matches!(url.scheme(), "http" | "https") {
                return;
            }
            let url = url.to_string();
            if seen.insert(url.clone()) {
                media.push(MediaItem {
                    kind: kind.to_string(),
                    url,
                    alt,
                });
            }
        };

        if let Some(og_image) = meta_content(&doc, &s.og_image) {
            push("image", &og_image, None);
        }
        let scope = main.unwrap_or_else(|| doc.root_element());
        for img in scope.select(&s.img) {
            if let Some(src) = img.value().attr("src") {
                let alt = img
                    .value()
                    .attr("alt")
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string);
                push("image", src, alt);
            }
        }
        for video in scope.select(&s.video) {
            if let Some(src) = video.value().attr("src") {
                push("video", src, None);
            }
        }

        ParsedPage {
            kind,
            title,
            main_html,
            media,
        }
    }
}

fn meta_content(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .find_map(|el| el.value().attr("content"))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

fn first_text(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel).next().map(collapse_text).filter(|t| !t.is_empty())
}

fn collapse_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
