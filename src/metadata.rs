//! Page metadata extraction from HTML.
//!
//! Recovers title, description, author, dates, language, keywords, canonical URL and favicon
//! from meta tags, then collects the OpenGraph and Twitter Card blocks as separate fields and
//! finally uses JSON-LD to fill whatever the meta tags left empty.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::url_utils::{origin_of, resolve_against_origin};

/// Metadata recovered from a page. Every field is optional; absent data stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub published_date: Option<DateTime<Utc>>,
    pub modified_date: Option<DateTime<Utc>>,
    pub language: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Absolute favicon URL. Falls back to `/favicon.ico` on the page's origin without
    /// checking that it exists.
    pub favicon: Option<String>,
    pub canonical_url: Option<String>,
    pub site_name: Option<String>,

    // OpenGraph
    pub og_title: Option<String>,
    pub og_description: Option<String>,
    pub og_image: Option<String>,
    pub og_type: Option<String>,
    pub og_url: Option<String>,

    // Twitter Card
    pub twitter_card: Option<String>,
    pub twitter_title: Option<String>,
    pub twitter_description: Option<String>,
    pub twitter_image: Option<String>,

    /// The JSON-LD object the gap-filling pass used, kept verbatim.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

const AUTHOR_META: &[&str] = &[
    r#"meta[name="author"]"#,
    r#"meta[property="article:author"]"#,
    r#"meta[name="dc.creator"]"#,
];

const AUTHOR_TEXT: &[&str] = &[
    r#"a[rel="author"]"#,
    r#"[itemprop="author"] [itemprop="name"]"#,
    r#"[itemprop="author"]"#,
];

/// `(selector, attribute)` probes for the publication date, in order.
const PUBLISHED_PROBES: &[(&str, &str)] = &[
    (r#"meta[property="article:published_time"]"#, "content"),
    (r#"meta[name="pubdate"]"#, "content"),
    (r#"meta[name="publishdate"]"#, "content"),
    (r#"meta[name="dc.date"]"#, "content"),
    (r#"time[itemprop="datePublished"]"#, "datetime"),
    ("time[pubdate]", "datetime"),
];

const MODIFIED_PROBES: &[(&str, &str)] = &[
    (r#"meta[property="article:modified_time"]"#, "content"),
    (r#"meta[name="lastmod"]"#, "content"),
    (r#"time[itemprop="dateModified"]"#, "datetime"),
];

const FAVICON_LINKS: &[&str] = &[
    r#"link[rel="icon"]"#,
    r#"link[rel="shortcut icon"]"#,
    r#"link[rel="apple-touch-icon"]"#,
    r#"link[rel="apple-touch-icon-precomposed"]"#,
];

const ARTICLE_TYPES: &[&str] = &["Article", "NewsArticle", "BlogPosting", "WebPage"];

/// Extracts a [`MetadataRecord`] from fetched HTML.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataExtractor;

impl MetadataExtractor {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Extract metadata from `html` fetched from `source_url`.
    ///
    /// Parsing is lenient: malformed markup and broken JSON-LD never fail the call.
    #[must_use]
    pub fn extract(&self, html: &str, source_url: &str) -> MetadataRecord {
        let document = Html::parse_document(html);

        let mut record = MetadataRecord {
            title: first_attr(&document, r#"meta[property="og:title"]"#, "content")
                .or_else(|| first_text(&document, "title")),
            description: first_attr(&document, r#"meta[property="og:description"]"#, "content")
                .or_else(|| first_attr(&document, r#"meta[name="description"]"#, "content")),
            author: extract_author(&document),
            published_date: first_date(&document, PUBLISHED_PROBES),
            modified_date: first_date(&document, MODIFIED_PROBES),
            language: extract_language(&document),
            keywords: extract_keywords(&document),
            favicon: extract_favicon(&document, source_url),
            canonical_url: first_attr(&document, r#"link[rel="canonical"]"#, "href"),
            site_name: first_attr(&document, r#"meta[property="og:site_name"]"#, "content"),

            og_title: first_attr(&document, r#"meta[property="og:title"]"#, "content"),
            og_description: first_attr(&document, r#"meta[property="og:description"]"#, "content"),
            og_image: first_attr(&document, r#"meta[property="og:image"]"#, "content"),
            og_type: first_attr(&document, r#"meta[property="og:type"]"#, "content"),
            og_url: first_attr(&document, r#"meta[property="og:url"]"#, "content"),

            twitter_card: first_attr(&document, r#"meta[name="twitter:card"]"#, "content"),
            twitter_title: first_attr(&document, r#"meta[name="twitter:title"]"#, "content"),
            twitter_description: first_attr(
                &document,
                r#"meta[name="twitter:description"]"#,
                "content",
            ),
            twitter_image: first_attr(&document, r#"meta[name="twitter:image"]"#, "content"),

            extra: Map::new(),
        };

        if let Some(json_ld) = extract_json_ld(&document) {
            merge_json_ld(&mut record, &json_ld);
            record.extra = json_ld;
        }

        record
    }
}

fn select_first<'a>(document: &'a Html, css: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(css).ok()?;
    document.select(&selector).next()
}

/// Trimmed value of `attr` on the first element matching `css`, if non-empty.
fn first_attr(document: &Html, css: &str, attr: &str) -> Option<String> {
    let value = select_first(document, css)?.value().attr(attr)?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Whitespace-collapsed text of the first element matching `css`, if non-empty.
fn first_text(document: &Html, css: &str) -> Option<String> {
    let element = select_first(document, css)?;
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn extract_author(document: &Html) -> Option<String> {
    AUTHOR_META
        .iter()
        .find_map(|css| first_attr(document, css, "content"))
        .or_else(|| AUTHOR_TEXT.iter().find_map(|css| first_text(document, css)))
}

/// The first probe whose value parses as a date. Unparsable candidates are skipped.
fn first_date(document: &Html, probes: &[(&str, &str)]) -> Option<DateTime<Utc>> {
    probes
        .iter()
        .filter_map(|(css, attr)| first_attr(document, css, attr))
        .find_map(|candidate| parse_date(&candidate))
}

/// Parse the date formats commonly found in page metadata.
pub(crate) fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%d %H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.and_utc());
        }
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%B %d, %Y", "%b %d, %Y", "%d %B %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

fn extract_language(document: &Html) -> Option<String> {
    let lang = first_attr(document, "html", "lang")
        .or_else(|| first_attr(document, r#"meta[http-equiv="content-language"]"#, "content"))?;
    Some(lang.chars().take(10).collect())
}

fn extract_keywords(document: &Html) -> Vec<String> {
    first_attr(document, r#"meta[name="keywords"]"#, "content")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn extract_favicon(document: &Html, source_url: &str) -> Option<String> {
    if let Some(href) = FAVICON_LINKS
        .iter()
        .find_map(|css| first_attr(document, css, "href"))
    {
        return resolve_against_origin(&href, source_url);
    }

    let base = url::Url::parse(source_url).ok()?;
    origin_of(&base).map(|origin| format!("{origin}/favicon.ico"))
}

/// The JSON-LD object to fill gaps from: the first block that parses, narrowed to an
/// article-like entry when the block is an array or carries an `@graph`.
fn extract_json_ld(document: &Html) -> Option<Map<String, Value>> {
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#).ok()?;

    for script in document.select(&selector) {
        let raw = script.text().collect::<String>();
        let Ok(data) = serde_json::from_str::<Value>(raw.trim()) else {
            continue;
        };

        let chosen = match data {
            Value::Array(items) => prefer_article(&items).or_else(|| items.into_iter().next()),
            Value::Object(object) => {
                let from_graph = match object.get("@graph") {
                    Some(Value::Array(graph)) => prefer_article(graph),
                    _ => None,
                };
                from_graph.or(Some(Value::Object(object)))
            }
            _ => None,
        };

        if let Some(Value::Object(object)) = chosen {
            return Some(object);
        }
    }

    None
}

fn prefer_article(items: &[Value]) -> Option<Value> {
    items.iter().find(|item| is_article_type(item)).cloned()
}

fn is_article_type(item: &Value) -> bool {
    match item.get("@type") {
        Some(Value::String(kind)) => ARTICLE_TYPES.contains(&kind.as_str()),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .any(|kind| ARTICLE_TYPES.contains(&kind)),
        _ => false,
    }
}

fn merge_json_ld(record: &mut MetadataRecord, json_ld: &Map<String, Value>) {
    if record.author.is_none() {
        record.author = json_ld.get("author").and_then(json_ld_name);
    }

    if record.published_date.is_none() {
        record.published_date = json_ld
            .get("datePublished")
            .and_then(Value::as_str)
            .and_then(parse_date);
    }

    if record.description.is_none() {
        record.description = json_ld
            .get("description")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(ToString::to_string);
    }

    if record.site_name.is_none() {
        record.site_name = json_ld.get("publisher").and_then(json_ld_name);
    }
}

/// A name from a JSON-LD person/organization: a bare string, `{name}`, or `[{name}, ..]`.
fn json_ld_name(value: &Value) -> Option<String> {
    let name = match value {
        Value::String(name) => Some(name.as_str()),
        Value::Object(object) => object.get("name").and_then(Value::as_str),
        Value::Array(items) => items
            .first()
            .and_then(|first| first.get("name"))
            .and_then(Value::as_str),
        _ => None,
    }?;
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}
