use std::io::Write;
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use flate2::{Compression, write::GzEncoder};
use streamgate::server::error::GuideError;
use streamgate::server::services::epg_services::{GuideService, GuideServiceTrait};
use streamgate::server::services::fetch_services::ResilientFetcher;
use streamgate::server::services::transport_services::{MockHttpTransport, UpstreamResponse};
use streamgate::server::utils::xmltv_utils::{
    decode_guide_body, format_xmltv_timestamp, parse_guide, parse_xmltv_timestamp,
};

const GUIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv generator-info-name="test">
  <channel id="tvnz.1"><display-name>TVNZ 1</display-name></channel>
  <programme channel="tvnz.1" start="20240728060000 +1200" stop="20240728070000 +1200">
    <title lang="en">Breakfast</title>
    <desc>News &amp; weather</desc>
    <category>News</category>
    <category>Current Affairs</category>
    <new />
    <icon src="https://img.example/breakfast.png" />
    <credits><presenter>Jenny</presenter><actor>Matty</actor></credits>
    <video><quality>HDTV</quality></video>
    <audio><stereo>stereo</stereo></audio>
    <subtitles type="teletext"><language>English</language></subtitles>
    <rating system="NZ"><value>G</value></rating>
    <star-rating><value>4/5</value></star-rating>
    <country>NZ</country>
    <episode-num system="onscreen">S2024E210</episode-num>
    <sub-title>Sunday</sub-title>
    <date>20240728</date>
  </programme>
  <programme channel="tvnz.1" start="20240728000000 +1200" stop="20240728060000 +1200">
    <title>Overnight</title>
  </programme>
  <programme channel="three" start="20240728000000 +1200" stop="20240728003000 +1200">
    <title>Late Movie</title>
  </programme>
</tv>"#;

fn instant(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<chrono::FixedOffset> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
        .single()
        .expect("valid instant")
        .fixed_offset()
}

#[test]
fn parse_timestamps_with_their_offset() {
    let parsed = parse_xmltv_timestamp("20240728000000 +1200").expect("valid timestamp");

    assert_eq!(parsed.offset().local_minus_utc(), 12 * 3600);
    assert_eq!(parsed.with_timezone(&Utc), instant(2024, 7, 27, 12, 0));

    let negative = parse_xmltv_timestamp("20240101093000 -0530").expect("valid timestamp");
    assert_eq!(negative.with_timezone(&Utc), instant(2024, 1, 1, 15, 0));
}

#[test]
fn reject_short_or_broken_timestamps() {
    assert_eq!(parse_xmltv_timestamp("20240728000000"), None);
    assert_eq!(parse_xmltv_timestamp("20240728000000 +12"), None);
    assert_eq!(parse_xmltv_timestamp("2024072800000a +1200"), None);
    assert_eq!(parse_xmltv_timestamp("20241328000000 +1200"), None);
    assert_eq!(parse_xmltv_timestamp("20240728000000 1200X"), None);
}

#[test]
fn round_trip_timestamps() {
    for raw in [
        "20240728000000 +1200",
        "19991231235959 -0800",
        "20240229120000 +0000",
        "20241006020000 +1345",
    ] {
        let parsed = parse_xmltv_timestamp(raw).expect("valid timestamp");
        let reparsed =
            parse_xmltv_timestamp(&format_xmltv_timestamp(&parsed)).expect("formatted parses");

        assert_eq!(parsed.with_timezone(&Utc), reparsed.with_timezone(&Utc));
        assert_eq!(format_xmltv_timestamp(&parsed), raw);
    }
}

#[test]
fn drop_a_programme_missing_stop_and_keep_going() {
    let xml = r#"<tv>
      <programme channel="a" start="20240728000000 +1200"><title>Broken</title></programme>
      <programme channel="a" start="20240728010000 +1200" stop="20240728020000 +1200"><title>Fine</title></programme>
    </tv>"#;

    let index = parse_guide(xml).expect("document is well formed");

    assert_eq!(index.programme_count(), 1);
    assert_eq!(index.programmes("a")[0].title.as_deref(), Some("Fine"));
    assert_eq!(index.skipped(), 1);
}

#[test]
fn drop_programmes_with_bad_or_backwards_times() {
    let xml = r#"<tv>
      <programme channel="a" start="yesterday" stop="20240728020000 +1200" />
      <programme start="20240728010000 +1200" stop="20240728020000 +1200" />
      <programme channel="a" start="20240728030000 +1200" stop="20240728020000 +1200" />
      <programme channel="a" start="20240728030000 +1200" stop="20240728040000 +1200" />
    </tv>"#;

    let index = parse_guide(xml).expect("document is well formed");

    assert_eq!(index.programme_count(), 1);
    assert_eq!(index.skipped(), 3);
}

#[test]
fn extract_every_descriptive_field() {
    let index = parse_guide(GUIDE).expect("guide parses");
    let breakfast = index
        .programmes("tvnz.1")
        .iter()
        .find(|p| p.title.as_deref() == Some("Breakfast"))
        .expect("breakfast present");

    assert_eq!(breakfast.description.as_deref(), Some("News & weather"));
    assert_eq!(
        breakfast.categories,
        Some(vec!["News".to_string(), "Current Affairs".to_string()])
    );
    assert!(breakfast.is_new);
    assert_eq!(
        breakfast.icon.as_deref(),
        Some("https://img.example/breakfast.png")
    );
    assert_eq!(
        breakfast.cast,
        Some(vec!["Jenny".to_string(), "Matty".to_string()])
    );
    assert_eq!(breakfast.video_quality.as_deref(), Some("HDTV"));
    assert_eq!(breakfast.audio_format.as_deref(), Some("stereo"));
    assert_eq!(breakfast.subtitle_language.as_deref(), Some("English"));
    assert_eq!(breakfast.rating.as_deref(), Some("G"));
    assert_eq!(breakfast.star_rating.as_deref(), Some("4/5"));
    assert_eq!(breakfast.country.as_deref(), Some("NZ"));
    assert_eq!(breakfast.episode.as_deref(), Some("S2024E210"));
    assert_eq!(breakfast.sub_title.as_deref(), Some("Sunday"));
    assert_eq!(breakfast.date.as_deref(), Some("20240728"));
}

#[test]
fn mark_absent_fields_as_missing_rather_than_empty() {
    let index = parse_guide(GUIDE).expect("guide parses");
    let movie = &index.programmes("three")[0];

    assert_eq!(movie.title.as_deref(), Some("Late Movie"));
    assert_eq!(movie.description, None);
    assert_eq!(movie.categories, None);
    assert_eq!(movie.cast, None);
    assert_eq!(movie.icon, None);
    assert!(!movie.is_new);

    let xml = r#"<tv><programme channel="a" start="20240728010000 +1200" stop="20240728020000 +1200"><title></title></programme></tv>"#;
    let index = parse_guide(xml).expect("document is well formed");
    assert_eq!(index.programmes("a")[0].title.as_deref(), Some(""));
}

#[test]
fn sort_each_channel_by_start() {
    let index = parse_guide(GUIDE).expect("guide parses");

    let titles: Vec<_> = index
        .programmes("tvnz.1")
        .iter()
        .map(|p| p.title.as_deref().unwrap_or_default())
        .collect();
    assert_eq!(titles, vec!["Overnight", "Breakfast"]);
    assert_eq!(index.channel_count(), 2);
    assert_eq!(
        index.channel_keys().collect::<Vec<_>>(),
        vec!["three", "tvnz.1"]
    );
}

#[test]
fn parse_the_same_document_to_the_same_index() {
    assert_eq!(
        parse_guide(GUIDE).expect("guide parses"),
        parse_guide(GUIDE).expect("guide parses")
    );
}

#[test]
fn answer_now_next_and_range_lookups() {
    let index = parse_guide(GUIDE).expect("guide parses");
    // 06:30 NZST
    let now = instant(2024, 7, 27, 18, 30);

    assert_eq!(
        index
            .current_programme("tvnz.1", now)
            .and_then(|p| p.title.as_deref()),
        Some("Breakfast")
    );
    assert_eq!(index.next_programme("tvnz.1", now), None);

    let early = instant(2024, 7, 27, 12, 0);
    assert_eq!(
        index
            .next_programme("tvnz.1", early - chrono::Duration::minutes(1))
            .and_then(|p| p.title.as_deref()),
        Some("Overnight")
    );

    let window = index.programmes_in_range(
        "tvnz.1",
        instant(2024, 7, 27, 17, 0),
        instant(2024, 7, 27, 19, 0),
    );
    assert_eq!(window.len(), 2);
    assert!(index.programmes("nobody").is_empty());
}

#[test]
fn fail_on_malformed_documents() {
    assert!(matches!(
        parse_guide(r#"<tv><programme channel="a"></tv>"#),
        Err(GuideError::Malformed(_))
    ));
    assert!(matches!(
        parse_guide("definitely not xml"),
        Err(GuideError::Malformed(_))
    ));
}

#[test]
fn fail_on_a_truncated_document() {
    let truncated = r#"<?xml version="1.0"?><tv><programme channel="a" start="20240728000000 +1200" stop="20240728010000 +1200"><title>X</title></programme>"#;

    assert!(matches!(
        parse_guide(truncated),
        Err(GuideError::Malformed(_))
    ));

    let cut_mid_programme = &GUIDE[..GUIDE.find("<category>Current").expect("marker present")];
    assert!(matches!(
        parse_guide(cut_mid_programme),
        Err(GuideError::Malformed(_))
    ));
}

#[test]
fn decode_non_breaking_spaces() {
    let xml = r#"<tv><programme channel="a" start="20240728010000 +1200" stop="20240728020000 +1200"><title>Late&nbsp;Show</title></programme></tv>"#;

    let index = parse_guide(xml).expect("document is well formed");

    assert_eq!(
        index.programmes("a")[0].title.as_deref(),
        Some("Late\u{a0}Show")
    );
}

#[test]
fn gunzip_compressed_guides() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(GUIDE.as_bytes()).expect("gzip in memory");
    let gzipped = encoder.finish().expect("gzip in memory");

    assert_eq!(decode_guide_body(&gzipped).expect("gunzips"), GUIDE);
    assert_eq!(decode_guide_body(GUIDE.as_bytes()).expect("plain"), GUIDE);
}

fn guide_service(response: Result<UpstreamResponse, ()>) -> GuideService {
    let mut transport = MockHttpTransport::new();
    match response {
        Ok(upstream) => {
            let mut upstream = Some(upstream);
            transport
                .expect_send()
                .times(1)
                .returning(move |_, _, _| Ok(upstream.take().expect("called once")));
        }
        Err(()) => {
            transport.expect_send().returning(|_, _, _| {
                Ok(UpstreamResponse::from_bytes(
                    StatusCode::BAD_GATEWAY,
                    HeaderMap::new(),
                    "",
                ))
            });
        }
    }

    GuideService::new(
        ResilientFetcher::new(Arc::new(transport), vec!["https://relay.example/".to_string()]),
        "https://guide.example/epg.xml".to_string(),
        1_000,
    )
}

#[tokio::test]
async fn build_the_index_from_the_fetched_guide() {
    let service = guide_service(Ok(UpstreamResponse::from_bytes(
        StatusCode::OK,
        HeaderMap::new(),
        GUIDE,
    )));

    let index = service.fetch_guide().await.expect("guide loads");

    assert_eq!(index.programme_count(), 3);
}

#[tokio::test]
async fn report_an_unreachable_guide_as_unavailable() {
    let service = guide_service(Err(()));

    let err = service.fetch_guide().await.expect_err("every candidate fails");

    assert!(matches!(err, GuideError::Unavailable(_)));
}

#[tokio::test]
async fn report_an_unparsable_guide_as_malformed() {
    let service = guide_service(Ok(UpstreamResponse::from_bytes(
        StatusCode::OK,
        HeaderMap::new(),
        "<tv><programme></tv>",
    )));

    let err = service.fetch_guide().await.expect_err("bad xml");

    assert!(matches!(err, GuideError::Malformed(_)));
}
