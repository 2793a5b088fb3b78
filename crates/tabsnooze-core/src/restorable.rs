// ABOUTME: Decides whether a URL can ever be reopened by the restoration surface.
// ABOUTME: Rejects empty, unparseable, and browser-internal/privileged scheme URLs.

use url::Url;

/// Schemes the browser refuses to open from an extension context.
const RESTRICTED_SCHEMES: &[&str] = &[
    "about",
    "blob",
    "chrome",
    "chrome-extension",
    "chrome-untrusted",
    "data",
    "devtools",
    "edge",
    "file",
    "javascript",
    "moz-extension",
    "view-source",
];

/// True if `raw` is a URL that could be reopened later.
pub fn is_restorable_url(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }
    let Ok(parsed) = Url::parse(trimmed) else {
        return false;
    };
    // Url::parse lowercases the scheme.
    !RESTRICTED_SCHEMES.contains(&parsed.scheme())
}
