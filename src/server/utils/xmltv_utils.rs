//! XMLTV guide parsing. Streams through the document once with quick-xml and never builds a
//! tree, guides are routinely tens of megabytes.

use std::io::Read;

use chrono::{DateTime, FixedOffset};
use flate2::read::GzDecoder;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, info};

use crate::models::{EpgIndex, Programme};
use crate::server::error::GuideError;

/// Parses `YYYYMMDDHHmmss +HHMM` into an offset aware instant.
///
/// The offset is rewritten as `+HH:MM` and the whole thing is handed to the RFC 3339 parser, so
/// out of range fields (month 13, hour 25) are rejected there. Anything shorter than 20
/// characters is rejected outright.
pub fn parse_xmltv_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.len() < 20 || !raw.is_ascii() {
        return None;
    }

    let digits = &raw[..14];
    if !digits.bytes().all(|b| b.is_ascii_digit()) || raw.as_bytes()[14] != b' ' {
        return None;
    }

    let offset = &raw[15..20];
    let (sign, hhmm) = offset.split_at(1);
    if !matches!(sign, "+" | "-") || !hhmm.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let rfc3339 = format!(
        "{}-{}-{}T{}:{}:{}{}{}:{}",
        &digits[0..4],
        &digits[4..6],
        &digits[6..8],
        &digits[8..10],
        &digits[10..12],
        &digits[12..14],
        sign,
        &hhmm[0..2],
        &hhmm[2..4],
    );

    DateTime::parse_from_rfc3339(&rfc3339).ok()
}

/// inverse of [`parse_xmltv_timestamp`], keeps the original offset
pub fn format_xmltv_timestamp(at: &DateTime<FixedOffset>) -> String {
    at.format("%Y%m%d%H%M%S %z").to_string()
}

/// gzip magic check, guides are often served as .xml.gz
pub fn decode_guide_body(body: &[u8]) -> Result<String, GuideError> {
    if body.len() >= 2 && body[0] == 0x1f && body[1] == 0x8b {
        let mut decoder = GzDecoder::new(body);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|e| GuideError::Malformed(format!("failed to gunzip guide: {}", e)))?;
        return Ok(text);
    }
    Ok(String::from_utf8_lossy(body).into_owned())
}

/// programme being assembled, only exists while inside a valid `<programme>`
struct Draft {
    channel: String,
    start: DateTime<FixedOffset>,
    stop: DateTime<FixedOffset>,
    title: Option<String>,
    description: Option<String>,
    sub_title: Option<String>,
    rating: Option<String>,
    icon: Option<String>,
    categories: Vec<String>,
    date: Option<String>,
    episode: Option<String>,
    is_new: bool,
    cast: Vec<String>,
    country: Option<String>,
    video_quality: Option<String>,
    audio_format: Option<String>,
    subtitle_language: Option<String>,
    star_rating: Option<String>,
}

impl Draft {
    fn new(channel: String, start: DateTime<FixedOffset>, stop: DateTime<FixedOffset>) -> Self {
        Self {
            channel,
            start,
            stop,
            title: None,
            description: None,
            sub_title: None,
            rating: None,
            icon: None,
            categories: Vec::new(),
            date: None,
            episode: None,
            is_new: false,
            cast: Vec::new(),
            country: None,
            video_quality: None,
            audio_format: None,
            subtitle_language: None,
            star_rating: None,
        }
    }

    // first occurrence wins for the single valued fields
    fn assign(&mut self, parent: Option<&str>, element: &str, text: String) {
        fn first(slot: &mut Option<String>, text: String) {
            if slot.is_none() {
                *slot = Some(text);
            }
        }

        match (parent, element) {
            (Some("programme"), "title") => first(&mut self.title, text),
            (Some("programme"), "desc") => first(&mut self.description, text),
            (Some("programme"), "sub-title") => first(&mut self.sub_title, text),
            (Some("programme"), "category") => self.categories.push(text),
            (Some("programme"), "date") => first(&mut self.date, text),
            (Some("programme"), "episode-num") => first(&mut self.episode, text),
            (Some("programme"), "country") => first(&mut self.country, text),
            (Some("credits"), "actor") | (Some("credits"), "presenter") => self.cast.push(text),
            (Some("video"), "quality") => first(&mut self.video_quality, text),
            (Some("audio"), "stereo") => first(&mut self.audio_format, text),
            (Some("subtitles"), "language") => first(&mut self.subtitle_language, text),
            (Some("rating"), "value") => first(&mut self.rating, text),
            (Some("star-rating"), "value") => first(&mut self.star_rating, text),
            _ => {}
        }
    }

    fn finish(self) -> Programme {
        Programme {
            channel_key: self.channel,
            start: self.start,
            stop: self.stop,
            title: self.title,
            description: self.description,
            sub_title: self.sub_title,
            rating: self.rating,
            icon: self.icon,
            categories: (!self.categories.is_empty()).then_some(self.categories),
            date: self.date,
            episode: self.episode,
            is_new: self.is_new,
            cast: (!self.cast.is_empty()).then_some(self.cast),
            country: self.country,
            video_quality: self.video_quality,
            audio_format: self.audio_format,
            subtitle_language: self.subtitle_language,
            star_rating: self.star_rating,
        }
    }
}

enum ProgrammeState {
    Outside,
    /// inside a `<programme>` that will be dropped, children are consumed and ignored
    Skipping,
    Building(Box<Draft>),
}

/// Builds the full index from an XMLTV document.
///
/// A programme missing `channel`, `start` or `stop`, with an unparsable timestamp, or with
/// `start >= stop` is dropped and counted. Only a document level XML error fails the whole
/// parse.
pub fn parse_guide(xml: &str) -> Result<EpgIndex, GuideError> {
    let mut reader = Reader::from_str(xml);
    // no trim_text: entity references split text events and trimming would eat the spaces
    // around them, values get trimmed once complete instead

    let mut programmes: Vec<Programme> = Vec::new();
    let mut skipped = 0usize;
    let mut saw_element = false;
    // open elements across the whole document, quick-xml reports Eof with elements still open
    let mut depth = 0usize;

    let mut state = ProgrammeState::Outside;
    // element names below <programme>, innermost last
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        let position = reader.buffer_position();
        let event = reader.read_event().map_err(|e| {
            GuideError::Malformed(format!("XML error at byte {}: {}", position, e))
        })?;

        match event {
            Event::Start(ref e) => {
                saw_element = true;
                depth += 1;
                let name = element_name(e);
                match state {
                    ProgrammeState::Outside if name == "programme" => {
                        state = open_programme(e, &mut skipped);
                        path.clear();
                        path.push(name);
                    }
                    ProgrammeState::Outside => {}
                    ProgrammeState::Skipping | ProgrammeState::Building(_) => {
                        if let ProgrammeState::Building(ref mut draft) = state {
                            apply_marker(draft, path.last().map(String::as_str), &name, e);
                        }
                        path.push(name);
                    }
                }
                text.clear();
            }
            Event::Empty(ref e) => {
                saw_element = true;
                let name = element_name(e);
                match state {
                    ProgrammeState::Outside if name == "programme" => {
                        // self closing programme, complete with no descriptive fields
                        if let ProgrammeState::Building(draft) = open_programme(e, &mut skipped) {
                            programmes.push(draft.finish());
                        }
                    }
                    ProgrammeState::Building(ref mut draft) => {
                        apply_marker(draft, path.last().map(String::as_str), &name, e);
                    }
                    _ => {}
                }
            }
            Event::Text(ref e) => {
                if matches!(state, ProgrammeState::Building(_)) {
                    text.push_str(&decode_entities(&String::from_utf8_lossy(e)));
                }
            }
            Event::CData(ref e) => {
                if matches!(state, ProgrammeState::Building(_)) {
                    text.push_str(&String::from_utf8_lossy(e));
                }
            }
            Event::GeneralRef(ref e) => {
                if matches!(state, ProgrammeState::Building(_)) {
                    if let Some(resolved) = resolve_reference(&String::from_utf8_lossy(e)) {
                        text.push_str(&resolved);
                    }
                }
            }
            Event::End(ref e) => {
                depth = depth.saturating_sub(1);
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match state {
                    ProgrammeState::Outside => {}
                    _ if name == "programme" && path.len() == 1 => {
                        if let ProgrammeState::Building(draft) =
                            std::mem::replace(&mut state, ProgrammeState::Outside)
                        {
                            programmes.push(draft.finish());
                        }
                        path.clear();
                    }
                    ProgrammeState::Skipping => {
                        path.pop();
                    }
                    ProgrammeState::Building(ref mut draft) => {
                        path.pop();
                        let value = text.trim().to_string();
                        draft.assign(path.last().map(String::as_str), &name, value);
                    }
                }
                text.clear();
            }
            Event::Eof if depth > 0 => {
                return Err(GuideError::Malformed(format!(
                    "unexpected end of document with {} element(s) still open",
                    depth
                )));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_element {
        return Err(GuideError::Malformed(
            "document contains no XML elements".to_string(),
        ));
    }

    if skipped > 0 {
        debug!(skipped, "dropped malformed programmes");
    }

    let index = EpgIndex::from_programmes(programmes, skipped);
    info!(
        channels = index.channel_count(),
        programmes = index.programme_count(),
        skipped,
        "guide parsed"
    );
    Ok(index)
}

fn open_programme(e: &BytesStart, skipped: &mut usize) -> ProgrammeState {
    let channel = get_attribute(e, b"channel");
    let start = get_attribute(e, b"start").and_then(|s| parse_xmltv_timestamp(&s));
    let stop = get_attribute(e, b"stop").and_then(|s| parse_xmltv_timestamp(&s));

    match (channel, start, stop) {
        (Some(channel), Some(start), Some(stop)) if !channel.is_empty() && start < stop => {
            ProgrammeState::Building(Box::new(Draft::new(channel, start, stop)))
        }
        _ => {
            *skipped += 1;
            ProgrammeState::Skipping
        }
    }
}

/// fields that come from attributes or mere presence rather than text
fn apply_marker(draft: &mut Draft, parent: Option<&str>, name: &str, e: &BytesStart) {
    match (parent, name) {
        (Some("programme"), "new") => draft.is_new = true,
        (Some("programme"), "icon") => {
            if draft.icon.is_none() {
                draft.icon = get_attribute(e, b"src");
            }
        }
        _ => {}
    }
}

fn element_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn get_attribute(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .map(|attr| decode_entities(&String::from_utf8_lossy(attr.value.as_ref())))
}

/// `amp`, `#38`, `#x26` -> the character they stand for
fn resolve_reference(reference: &str) -> Option<String> {
    let resolved = match reference {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        numeric => {
            let digits = numeric.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse::<u32>().ok()?,
            };
            char::from_u32(code)?
        }
    };
    Some(resolved.to_string())
}

/// decodes `&...;` sequences left inside raw text or attribute values, unknown ones are kept
fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        match after.find(';') {
            Some(semi) if semi <= 10 => match resolve_reference(&after[..semi]) {
                Some(resolved) => {
                    out.push_str(&resolved);
                    rest = &after[semi + 1..];
                }
                None => {
                    out.push('&');
                    rest = after;
                }
            },
            _ => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
