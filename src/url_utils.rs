//! Absolute-URL resolution for page assets.

use url::Url;

/// Resolve `reference` against the page URL `base`.
///
/// Handles absolute, scheme-relative (`//cdn/x.png`), absolute-path (`/x.png`) and
/// relative-path (`x.png`, `../x.png`) references. Returns `None` for references that
/// cannot be resolved (empty, or a base that is not a valid URL) and for non-HTTP
/// results such as `javascript:` or `mailto:`.
#[must_use]
pub fn resolve(reference: &str, base: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }

    let resolved = match Url::parse(reference) {
        Ok(absolute) => absolute,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base).ok()?.join(reference).ok()?,
        Err(_) => return None,
    };

    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

/// Resolve `reference` against the origin (`scheme://host[:port]`) of `base`.
///
/// Unlike [`resolve`], a relative path is taken from the site root rather than the
/// page's directory. This is how favicon hrefs are interpreted.
#[must_use]
pub fn resolve_against_origin(reference: &str, base: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return Some(reference.to_string());
    }

    let base = Url::parse(base).ok()?;
    let origin = origin_of(&base)?;

    if let Some(rest) = reference.strip_prefix("//") {
        return Some(format!("{}://{rest}", base.scheme()));
    }
    if reference.starts_with('/') {
        return Some(format!("{origin}{reference}"));
    }
    Some(format!("{origin}/{reference}"))
}

/// `scheme://host[:port]` of a URL, without a trailing slash.
#[must_use]
pub fn origin_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

/// Host of a URL string, if it has one.
#[must_use]
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_lowercase)
}
