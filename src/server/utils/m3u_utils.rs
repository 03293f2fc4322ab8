//! M3U channel directory parsing (`#EXTINF` + url line pairs).

use once_cell::sync::Lazy;
use regex::Regex;

static CHANNEL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"channel-id="([^"]*)""#).expect("Static regex should compile"));
static TVG_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"tvg-id="([^"]*)""#).expect("Static regex should compile"));
static TVG_LOGO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"tvg-logo="([^"]*)""#).expect("Static regex should compile"));
static GROUP_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"group-title="([^"]*)""#).expect("Static regex should compile"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M3uEntry {
    pub channel_id: Option<String>,
    pub tvg_id: Option<String>,
    pub tvg_logo: Option<String>,
    pub group_title: Option<String>,
    pub name: String,
    pub url: String,
    /// from the `|Header=value&...` suffix of the url line
    pub headers: Vec<(String, String)>,
}

fn capture(re: &Regex, line: &str) -> Option<String> {
    re.captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `url|User-Agent=foo&Referer=bar` -> (url, headers). A suffix without `=` is taken as a bare
/// user agent.
pub fn split_url_line(line: &str) -> (String, Vec<(String, String)>) {
    let Some((url, suffix)) = line.split_once('|') else {
        return (line.trim().to_string(), Vec::new());
    };

    let decode = |s: &str| {
        urlencoding::decode(s)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| s.to_string())
    };

    let headers = if suffix.contains('=') {
        suffix
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), decode(v.trim())))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect()
    } else if suffix.trim().is_empty() {
        Vec::new()
    } else {
        vec![("User-Agent".to_string(), decode(suffix.trim()))]
    };

    (url.trim().to_string(), headers)
}

pub fn parse_m3u(content: &str) -> Vec<M3uEntry> {
    let mut entries = Vec::new();
    let mut pending: Option<M3uEntry> = None;

    for line in content.lines() {
        let line = line.trim();

        if let Some(info) = line.strip_prefix("#EXTINF:") {
            // display name is whatever follows the last comma
            let name = info
                .rfind(',')
                .map(|i| info[i + 1..].trim().to_string())
                .unwrap_or_default();

            pending = Some(M3uEntry {
                channel_id: capture(&CHANNEL_ID, info),
                tvg_id: capture(&TVG_ID, info),
                tvg_logo: capture(&TVG_LOGO, info),
                group_title: capture(&GROUP_TITLE, info),
                name,
                url: String::new(),
                headers: Vec::new(),
            });
        } else if !line.is_empty() && !line.starts_with('#') {
            // url line without a preceding #EXTINF is ignored
            if let Some(mut entry) = pending.take() {
                let (url, headers) = split_url_line(line);
                entry.url = url;
                entry.headers = headers;
                if !entry.name.is_empty() && !entry.url.is_empty() {
                    entries.push(entry);
                }
            }
        }
    }

    entries
}
