//! Choosing a local file name for a downloaded artifact.

use plugin_mirror::ArtifactKey;
use reqwest::Url;

/// Extract the file name from a `Content-Disposition` header value.
///
/// `filename*` (RFC 5987, percent-encoded) is preferred over `filename`.
pub fn from_header(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in split_params(value) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let raw = raw.trim();

        match key.as_str() {
            "filename*" => {
                // charset'language'percent-encoded
                let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
                extended = percent_decode(encoded.trim_matches('"'));
            }
            "filename" => plain = Some(unquote(raw)),
            _ => {}
        }
    }

    extended.or(plain).and_then(|name| sanitize(&name))
}

/// The last path segment of `url`, when it looks like a file name.
pub fn from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let decoded = percent_decode(segment)?;
    if !decoded.contains('.') {
        return None;
    }
    sanitize(&decoded)
}

/// Name used when neither the response nor the URL provide one.
pub fn fallback(key: &ArtifactKey) -> String {
    sanitize(&format!("{}-{}.zip", key.plugin_id, key.version))
        .unwrap_or_else(|| "artifact.zip".to_owned())
}

/// Reduce a name to a single safe path component of `[A-Za-z0-9._-]`.
pub fn sanitize(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        None
    } else {
        Some(cleaned.to_owned())
    }
}

fn split_params(value: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ';' if !quoted => {
                params.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(&value[start..]);
    params
}

fn unquote(raw: &str) -> String {
    match raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\""),
        None => raw.to_owned(),
    }
}

fn percent_decode(input: &str) -> Option<String> {
    urlencoding::decode(input).ok().map(|decoded| decoded.into_owned())
}
