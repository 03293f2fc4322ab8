//! Line oriented HLS playlist tokenizer and the uri rewrite that routes every sub resource back
//! through the stream proxy.
//!
//! This is deliberately permissive: anything it doesn't understand is passed through untouched.
//! Only two places are ever rewritten, uri lines and the quoted `URI` attribute of tags that are
//! defined to carry an attribute list.

use std::ops::Range;

use tracing::{debug, warn};
use url::Url;

/// tags whose payload is an attribute list that may hold a `URI="..."`
const URI_BEARING_TAGS: &[&str] = &[
    "#EXT-X-KEY",
    "#EXT-X-SESSION-KEY",
    "#EXT-X-MAP",
    "#EXT-X-MEDIA",
    "#EXT-X-I-FRAME-STREAM-INF",
    "#EXT-X-PART",
    "#EXT-X-PRELOAD-HINT",
    "#EXT-X-RENDITION-REPORT",
    "#EXT-X-SESSION-DATA",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestLine<'a> {
    Blank,
    /// `#` but not `#EXT`
    Comment(&'a str),
    Tag { name: &'a str, value: Option<&'a str> },
    Uri(&'a str),
}

impl<'a> ManifestLine<'a> {
    pub fn parse(line: &'a str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Blank;
        }
        if trimmed.starts_with("#EXT") {
            return match trimmed.split_once(':') {
                Some((name, value)) => Self::Tag {
                    name,
                    value: Some(value),
                },
                None => Self::Tag {
                    name: trimmed,
                    value: None,
                },
            };
        }
        if trimmed.starts_with('#') {
            return Self::Comment(trimmed);
        }
        Self::Uri(trimmed)
    }

    pub fn carries_uri_attribute(&self) -> bool {
        matches!(self, Self::Tag { name, value: Some(_) } if URI_BEARING_TAGS.contains(name))
    }
}

/// byte ranges of one `NAME=value` pair inside an attribute list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSpan {
    pub name: Range<usize>,
    /// for quoted values this excludes the quotes
    pub value: Range<usize>,
    pub quoted: bool,
}

/// Splits an attribute list on commas that are outside quoted strings. Pairs without `=` are
/// skipped.
pub fn attribute_spans(list: &str) -> Vec<AttributeSpan> {
    let bytes = list.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let name_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b',' {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] == b',' {
            // bare token, no value
            i += 1;
            continue;
        }
        let name = name_start..i;
        i += 1; // '='

        let (value, quoted) = if i < bytes.len() && bytes[i] == b'"' {
            let value_start = i + 1;
            let mut end = value_start;
            while end < bytes.len() && bytes[end] != b'"' {
                end += 1;
            }
            // unterminated quote runs to the end of the line
            i = (end + 1).min(bytes.len());
            (value_start..end, true)
        } else {
            let value_start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            (value_start..i, false)
        };

        spans.push(AttributeSpan {
            name,
            value,
            quoted,
        });

        // skip to the next separator
        while i < bytes.len() && bytes[i] != b',' {
            i += 1;
        }
        i += 1;
    }

    spans
}

/// true for anything carrying its own scheme, `segment.ts` and `//cdn/x.ts` are relative
pub fn is_absolute_uri(uri: &str) -> bool {
    Url::parse(uri).is_ok()
}

/// `<gateway>?url=<target>&<header>=<value>...`, everything percent encoded
pub fn proxy_url<'a>(
    gateway_url: &str,
    target: &str,
    headers: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let separator = if gateway_url.contains('?') { '&' } else { '?' };
    let mut out = format!(
        "{}{}url={}",
        gateway_url,
        separator,
        urlencoding::encode(target)
    );
    for (name, value) in headers {
        out.push('&');
        out.push_str(&urlencoding::encode(name));
        out.push('=');
        out.push_str(&urlencoding::encode(value));
    }
    out
}

/// Everything needed to rewrite one fetched manifest.
#[derive(Debug, Clone)]
pub struct ManifestRewriteContext {
    base: Url,
    gateway_url: String,
    forwarded_headers: Vec<(String, String)>,
}

impl ManifestRewriteContext {
    /// `manifest_url` is where the manifest was fetched from, relative uris resolve against it
    pub fn new(
        manifest_url: &str,
        gateway_url: impl Into<String>,
        forwarded_headers: Vec<(String, String)>,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            base: Url::parse(manifest_url)?,
            gateway_url: gateway_url.into(),
            forwarded_headers,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `None` means leave the uri alone (already absolute, or can't be resolved)
    pub fn rewrite_uri(&self, uri: &str) -> Option<String> {
        if uri.is_empty() || is_absolute_uri(uri) {
            return None;
        }

        match self.base.join(uri) {
            Ok(resolved) => Some(proxy_url(
                &self.gateway_url,
                resolved.as_str(),
                self.forwarded_headers
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            )),
            Err(e) => {
                warn!("Failed to resolve {} against {}: {}", uri, self.base, e);
                None
            }
        }
    }

    fn rewrite_tag(&self, line: &str) -> Option<String> {
        // attribute offsets are relative to the text after the first ':'
        let colon = line.find(':')?;
        let list = &line[colon + 1..];

        let mut rewritten = line.to_string();
        let mut changed = false;
        // back to front so earlier ranges stay valid
        for span in attribute_spans(list).into_iter().rev() {
            if !span.quoted || list[span.name.clone()].trim() != "URI" {
                continue;
            }
            if let Some(new_uri) = self.rewrite_uri(&list[span.value.clone()]) {
                let start = colon + 1 + span.value.start;
                let end = colon + 1 + span.value.end;
                rewritten.replace_range(start..end, &new_uri);
                changed = true;
            }
        }

        changed.then_some(rewritten)
    }

    fn rewrite_line(&self, line: &str) -> Option<String> {
        match ManifestLine::parse(line) {
            ManifestLine::Uri(uri) => self.rewrite_uri(uri),
            tag if tag.carries_uri_attribute() => self.rewrite_tag(line),
            _ => None,
        }
    }

    /// Rewrites the whole playlist. Line order, line endings and every line that isn't a
    /// relative reference come out byte for byte.
    pub fn rewrite_manifest(&self, text: &str) -> String {
        let mut rewrites = 0usize;

        let lines: Vec<String> = text
            .split('\n')
            .map(|raw| {
                let (line, cr) = match raw.strip_suffix('\r') {
                    Some(stripped) => (stripped, "\r"),
                    None => (raw, ""),
                };
                match self.rewrite_line(line) {
                    Some(new_line) => {
                        rewrites += 1;
                        format!("{}{}", new_line, cr)
                    }
                    None => raw.to_string(),
                }
            })
            .collect();

        debug!(base = %self.base, rewrites, "rewrote manifest");
        lines.join("\n")
    }
}
