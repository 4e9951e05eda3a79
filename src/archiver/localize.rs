//! Point `<img>` references in extracted article HTML at locally stored copies.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use html_escape::{decode_html_entities, encode_double_quoted_attribute};
use lol_html::{element, HtmlRewriter, Settings};

/// Public URL for a storage key.
#[must_use]
pub fn public_url(public_prefix: &str, key: &str) -> String {
    format!(
        "{}/{}",
        public_prefix.trim_end_matches('/'),
        key.trim_start_matches('/')
    )
}

/// Rewrite `src` and `srcset` on every `<img>` using `url_to_path`.
///
/// Map keys are decoded URLs; attribute text is entity-decoded before lookup. References
/// missing from the map keep their original text.
pub fn localize_images(
    html: &str,
    url_to_path: &HashMap<String, String>,
    public_prefix: &str,
) -> Result<String> {
    if url_to_path.is_empty() {
        return Ok(html.to_string());
    }

    let local = |raw: &str| {
        url_to_path
            .get(decode_html_entities(raw).as_ref())
            .map(|key| encode_double_quoted_attribute(&public_url(public_prefix, key)).into_owned())
    };

    let mut output = Vec::with_capacity(html.len());
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![element!("img", |el| {
                if let Some(src) = el.get_attribute("src") {
                    if let Some(path) = local(src.trim()) {
                        el.set_attribute("src", &path)?;
                    }
                }
                if let Some(srcset) = el.get_attribute("srcset") {
                    el.set_attribute("srcset", &rewrite_srcset(&srcset, &local))?;
                }
                Ok(())
            })],
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

    String::from_utf8(output).context("Invalid UTF-8 in localized HTML")
}

/// Swap the URL of each candidate found by `local`, keeping its descriptor.
fn rewrite_srcset(srcset: &str, local: &impl Fn(&str) -> Option<String>) -> String {
    srcset
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .map(|candidate| {
            let (url, descriptor) = candidate
                .split_once(char::is_whitespace)
                .map_or((candidate, ""), |(url, rest)| (url, rest.trim()));
            let url = local(url).unwrap_or_else(|| url.to_string());
            if descriptor.is_empty() {
                url
            } else {
                format!("{url} {descriptor}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
