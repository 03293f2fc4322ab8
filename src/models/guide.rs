use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// One scheduled airing. Optional descriptive fields are `None` when the feed had no such
/// element, which is not the same as `Some("")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Programme {
    pub channel_key: String,
    pub start: DateTime<FixedOffset>,
    pub stop: DateTime<FixedOffset>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub sub_title: Option<String>,
    pub rating: Option<String>,
    pub icon: Option<String>,
    pub categories: Option<Vec<String>>,
    pub date: Option<String>,
    pub episode: Option<String>,
    pub is_new: bool,
    pub cast: Option<Vec<String>>,
    pub country: Option<String>,
    pub video_quality: Option<String>,
    pub audio_format: Option<String>,
    pub subtitle_language: Option<String>,
    pub star_rating: Option<String>,
}

impl Programme {
    pub fn is_airing_at(&self, at: DateTime<FixedOffset>) -> bool {
        self.start <= at && at < self.stop
    }
}

/// Channel join key -> programmes ordered by start time.
///
/// Rebuilt from scratch on every guide refresh, never patched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpgIndex {
    channels: BTreeMap<String, Vec<Programme>>,
    /// programmes dropped for missing attributes or bad timestamps
    skipped: usize,
}

impl EpgIndex {
    /// sorts every channel by start, source order isn't trusted to be chronological
    pub fn from_programmes(programmes: Vec<Programme>, skipped: usize) -> Self {
        let mut channels: BTreeMap<String, Vec<Programme>> = BTreeMap::new();
        for programme in programmes {
            channels
                .entry(programme.channel_key.clone())
                .or_default()
                .push(programme);
        }

        for list in channels.values_mut() {
            list.sort_by_key(|p| p.start);
        }

        Self { channels, skipped }
    }

    pub fn programmes(&self, channel_key: &str) -> &[Programme] {
        self.channels
            .get(channel_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn channel_keys(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn programme_count(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn current_programme(
        &self,
        channel_key: &str,
        now: DateTime<FixedOffset>,
    ) -> Option<&Programme> {
        self.programmes(channel_key)
            .iter()
            .find(|p| p.is_airing_at(now))
    }

    pub fn next_programme(
        &self,
        channel_key: &str,
        now: DateTime<FixedOffset>,
    ) -> Option<&Programme> {
        self.programmes(channel_key).iter().find(|p| p.start > now)
    }

    /// everything overlapping `[from, to)`
    pub fn programmes_in_range(
        &self,
        channel_key: &str,
        from: DateTime<FixedOffset>,
        to: DateTime<FixedOffset>,
    ) -> Vec<&Programme> {
        self.programmes(channel_key)
            .iter()
            .filter(|p| p.stop > from && p.start < to)
            .collect()
    }
}
