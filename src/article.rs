//! Readable article extraction.
//!
//! The primary path runs the readability algorithm over the page. When it errors or finds
//! nothing, a fixed list of content selectors picks the subtree instead, and page chrome
//! (scripts, navigation, footers, asides, ad containers) is stripped from it. Both paths then
//! derive text, word count and image references the same way.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::LazyLock;

use anyhow::{anyhow, Context, Result};
use lol_html::{element, HtmlRewriter, Settings};
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::constants::reading_time_minutes;
use crate::url_utils::resolve;

static WORD_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\p{P}]+").unwrap());

/// Content selectors tried in order when readability fails.
const FALLBACK_SELECTORS: &[&str] = &[
    "article",
    r#"[role="main"]"#,
    r#"[class*="article"]"#,
    r#"[class*="post-content"]"#,
    r#"[class*="entry-content"]"#,
    r#"[class*="content"]"#,
    "main",
    "body",
];

/// Elements whose text never counts as article text.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Elements that separate words when their tags are stripped.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figcaption",
    "figure", "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav",
    "ol", "p", "pre", "section", "table", "td", "th", "tr", "ul",
];

/// An image referenced by the article markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// The reference exactly as written in `src`/`srcset`; may be relative.
    pub url: String,
    pub alt: Option<String>,
    /// Text of the enclosing `<figure>`'s `<figcaption>`.
    pub caption: Option<String>,
}

/// The readable part of a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Article {
    pub text: String,
    pub html: String,
    pub word_count: u32,
    pub images: Vec<ImageRef>,
    /// True when the selector fallback produced this article.
    pub used_fallback: bool,
}

impl Article {
    #[must_use]
    pub fn reading_time_minutes(&self) -> u32 {
        reading_time_minutes(self.word_count)
    }

    fn from_html(html: String, source_url: &str, used_fallback: bool) -> Self {
        let text = html_to_text(&html);
        Self {
            word_count: count_words(&text),
            images: extract_images(&html, source_url),
            text,
            html,
            used_fallback,
        }
    }
}

/// Isolates the main content of a page.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArticleExtractor;

impl ArticleExtractor {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Extract the article from `html` fetched from `source_url`. Never fails; the worst
    /// case is an empty article with no images.
    #[must_use]
    pub fn extract(&self, html: &str, source_url: &str) -> Article {
        extract_with_primary(html, source_url, readability_content)
    }
}

fn extract_with_primary<F>(html: &str, source_url: &str, primary: F) -> Article
where
    F: FnOnce(&str, &str) -> Result<String>,
{
    match primary(html, source_url) {
        Ok(content) => Article::from_html(content, source_url, false),
        Err(e) => {
            warn!(url = %source_url, error = %e, "Readability failed, using selector fallback");
            let content = fallback_content(html);
            Article::from_html(content, source_url, true)
        }
    }
}

/// Run readability. Empty output counts as failure.
fn readability_content(html: &str, source_url: &str) -> Result<String> {
    let url = Url::parse(source_url).context("Invalid source URL")?;
    let mut cursor = Cursor::new(html.as_bytes());
    let product = readability::extractor::extract(&mut cursor, &url)
        .map_err(|e| anyhow!("Readability extraction failed: {e}"))?;

    if html_to_text(&product.content).is_empty() {
        anyhow::bail!("Readability found no content");
    }
    Ok(product.content)
}

/// Outer HTML of the first fallback selector that matches, with chrome removed.
fn fallback_content(html: &str) -> String {
    let document = Html::parse_document(html);

    let chosen = FALLBACK_SELECTORS.iter().find_map(|css| {
        let selector = Selector::parse(css).ok()?;
        let element = document.select(&selector).next()?;
        Some((*css, element.html()))
    });

    let Some((css, subtree)) = chosen else {
        return String::new();
    };
    debug!(selector = css, "Fallback selector matched");

    match strip_chrome(&subtree) {
        Ok(cleaned) => cleaned,
        Err(e) => {
            warn!(error = %e, "Failed to strip page chrome, keeping subtree as-is");
            subtree
        }
    }
}

fn strip_chrome(html: &str) -> Result<String> {
    let mut output = Vec::with_capacity(html.len());

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("script", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("style", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("nav", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("footer", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("aside", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("div[class]", |el| {
                    if el.get_attribute("class").is_some_and(|c| is_ad_class(&c)) {
                        el.remove();
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );

    rewriter
        .write(html.as_bytes())
        .map_err(|e| anyhow!("HTML rewrite error: {e}"))?;
    rewriter
        .end()
        .map_err(|e| anyhow!("HTML rewrite finalization error: {e}"))?;

    String::from_utf8(output).context("Invalid UTF-8 in cleaned HTML")
}

/// Whether a `class` attribute marks an advertising container.
fn is_ad_class(class: &str) -> bool {
    class.split_whitespace().any(|token| {
        let token = token.to_ascii_lowercase();
        matches!(token.as_str(), "ad" | "ads" | "advert" | "advertisement")
            || token.starts_with("ad-")
            || token.starts_with("ad_")
            || token.starts_with("ads-")
    })
}

/// Plain text of an HTML fragment: hidden elements dropped, entities decoded, whitespace
/// collapsed.
pub(crate) fn html_to_text(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }

    let fragment = Html::parse_fragment(html);
    let mut raw = String::with_capacity(html.len() / 2);

    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Element(element) if BLOCK_ELEMENTS.contains(&element.name()) => raw.push(' '),
            Node::Text(text) => {
                let hidden = node.ancestors().any(|ancestor| {
                    ancestor
                        .value()
                        .as_element()
                        .is_some_and(|e| HIDDEN_ELEMENTS.contains(&e.name()))
                });
                if !hidden {
                    raw.push_str(text);
                }
            }
            _ => {}
        }
    }

    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Count words, splitting on whitespace and punctuation. Han, Hiragana and Katakana
/// characters each count as one word since those scripts do not separate words with spaces.
pub(crate) fn count_words(text: &str) -> u32 {
    let mut count = 0u32;

    for token in WORD_SEPARATORS.split(text).filter(|t| !t.is_empty()) {
        let mut in_word = false;
        for c in token.chars() {
            if is_cjk(c) {
                count += 1;
                in_word = false;
            } else if !in_word {
                count += 1;
                in_word = true;
            }
        }
    }

    count
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x309F       // Hiragana
        | 0x30A0..=0x30FF     // Katakana
        | 0x31F0..=0x31FF     // Katakana phonetic extensions
        | 0x3400..=0x4DBF     // CJK extension A
        | 0x4E00..=0x9FFF     // CJK unified ideographs
        | 0xF900..=0xFAFF     // CJK compatibility ideographs
        | 0xFF66..=0xFF9F     // Halfwidth katakana
        | 0x20000..=0x2A6DF   // CJK extension B
    )
}

/// Images referenced by `<img>` elements, deduplicated by resolved URL.
///
/// `data:` URIs are skipped. `srcset` candidates follow their parent `src` and share its alt
/// text.
pub(crate) fn extract_images(html: &str, base_url: &str) -> Vec<ImageRef> {
    if html.trim().is_empty() {
        return Vec::new();
    }
    let Ok(selector) = Selector::parse("img") else {
        return Vec::new();
    };

    let fragment = Html::parse_fragment(html);
    let mut seen = HashSet::new();
    let mut images = Vec::new();

    for img in fragment.select(&selector) {
        let element = img.value();
        let src = element.attr("src").map(str::trim).unwrap_or_default();
        if src.is_empty() || src.starts_with("data:") {
            continue;
        }
        let Some(absolute) = resolve(src, base_url) else {
            continue;
        };
        if !seen.insert(absolute) {
            continue;
        }

        let alt = element
            .attr("alt")
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(ToString::to_string);
        let caption = figure_caption(img);

        images.push(ImageRef {
            url: src.to_string(),
            alt: alt.clone(),
            caption: caption.clone(),
        });

        if let Some(srcset) = element.attr("srcset") {
            for candidate in srcset_urls(srcset) {
                if let Some(absolute) = resolve(candidate, base_url) {
                    if seen.insert(absolute) {
                        images.push(ImageRef {
                            url: candidate.to_string(),
                            alt: alt.clone(),
                            caption: caption.clone(),
                        });
                    }
                }
            }
        }
    }

    images
}

/// Caption of the `<figure>` wrapping `img`, whitespace collapsed.
fn figure_caption(img: ElementRef<'_>) -> Option<String> {
    let figure = img
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|ancestor| ancestor.value().name() == "figure")?;
    let selector = Selector::parse("figcaption").ok()?;
    let caption = figure.select(&selector).next()?;

    let text = caption.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// The URL part of each `srcset` candidate, `data:` URIs excluded.
pub(crate) fn srcset_urls(srcset: &str) -> impl Iterator<Item = &str> {
    srcset
        .split(',')
        .filter_map(|candidate| candidate.split_whitespace().next())
        .filter(|url| !url.starts_with("data:"))
}
