//! Core domain model, normalization, identity hashing, and similarity scoring
//! for the Townbeat event pipeline.

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strsim::normalized_levenshtein;
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "townbeat-core";

/// Length of the truncated identity key, in hex characters.
pub const UNIQUE_KEY_LEN: usize = 16;

/// Title prefixes stripped during normalization. At most one is removed,
/// first match in list order.
const TITLE_PREFIXES: &[&str] = &[
    "live:",
    "tonight:",
    "presents:",
    "featuring:",
    "feat:",
    "this weekend:",
    "show:",
    "event:",
];

/// Title suffixes stripped during normalization. At most one is removed.
const TITLE_SUFFIXES: &[&str] = &["- live", "live!", "!!!", "!"];

/// Trailing venue-type words dropped when comparing venue names.
const VENUE_SUFFIX_WORDS: &[&str] = &[
    "bar", "lounge", "club", "venue", "theater", "theatre", "hall", "room", "stage", "the",
];

/// Tracking query parameters dropped by [`normalize_url`].
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "ref",
    "source",
];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("event title must not be empty")]
    EmptyTitle,
    #[error("venue name must not be empty")]
    EmptyVenueName,
    #[error("confidence {0} outside [0.0, 1.0]")]
    ConfidenceOutOfRange(f64),
    #[error("unknown event source '{0}'")]
    UnknownSource(String),
    #[error("unknown event category '{0}'")]
    UnknownCategory(String),
    #[error("unknown media type '{0}'")]
    UnknownMediaType(String),
}

/// Source platform an event was scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Instagram,
    Facebook,
    Eventbrite,
    Manual,
    WebAggregator,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Instagram => "instagram",
            EventSource::Facebook => "facebook",
            EventSource::Eventbrite => "eventbrite",
            EventSource::Manual => "manual",
            EventSource::WebAggregator => "web_aggregator",
        }
    }
}

impl std::str::FromStr for EventSource {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instagram" => Ok(EventSource::Instagram),
            "facebook" => Ok(EventSource::Facebook),
            "eventbrite" => Ok(EventSource::Eventbrite),
            "manual" => Ok(EventSource::Manual),
            "web_aggregator" => Ok(EventSource::WebAggregator),
            other => Err(ValidationError::UnknownSource(other.to_string())),
        }
    }
}

/// Newsletter category for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Music,
    FoodDrink,
    Art,
    Community,
    Outdoor,
    Market,
    Workshop,
    #[default]
    Other,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Music => "music",
            EventCategory::FoodDrink => "food_drink",
            EventCategory::Art => "art",
            EventCategory::Community => "community",
            EventCategory::Outdoor => "outdoor",
            EventCategory::Market => "market",
            EventCategory::Workshop => "workshop",
            EventCategory::Other => "other",
        }
    }

    /// Lenient parse for scraped input: common aliases map onto the enum,
    /// anything unrecognized falls back to `Other`.
    pub fn parse_lenient(s: &str) -> EventCategory {
        match s.trim().to_lowercase().as_str() {
            "music" => EventCategory::Music,
            "food_drink" | "food" | "drink" => EventCategory::FoodDrink,
            "art" => EventCategory::Art,
            "community" => EventCategory::Community,
            "outdoor" => EventCategory::Outdoor,
            "market" => EventCategory::Market,
            "workshop" => EventCategory::Workshop,
            _ => EventCategory::Other,
        }
    }
}

impl std::str::FromStr for EventCategory {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "music" => Ok(EventCategory::Music),
            "food_drink" => Ok(EventCategory::FoodDrink),
            "art" => Ok(EventCategory::Art),
            "community" => Ok(EventCategory::Community),
            "outdoor" => Ok(EventCategory::Outdoor),
            "market" => Ok(EventCategory::Market),
            "workshop" => Ok(EventCategory::Workshop),
            "other" => Ok(EventCategory::Other),
            other => Err(ValidationError::UnknownCategory(other.to_string())),
        }
    }
}

/// A physical or virtual event location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub name: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub instagram_handle: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    /// (latitude, longitude)
    #[serde(default)]
    pub coordinates: Option<(f64, f64)>,
}

fn default_state() -> String {
    "NY".to_string()
}

impl Venue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            city: None,
            state: default_state(),
            address: None,
            instagram_handle: None,
            website: None,
            coordinates: None,
        }
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.instagram_handle = Some(normalize_handle(&handle.into()));
        self
    }

    /// Handle with any leading "@" stripped, or None if absent/blank.
    pub fn normalized_handle(&self) -> Option<String> {
        self.instagram_handle
            .as_deref()
            .map(normalize_handle)
            .filter(|h| !h.is_empty())
    }
}

/// A single normalized event listing from any source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub title: String,
    pub venue: Venue,
    pub date: NaiveDate,
    pub source: EventSource,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub end_time: Option<NaiveTime>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub category: EventCategory,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub ticket_url: Option<String>,
    #[serde(default)]
    pub event_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub review_notes: Option<String>,
    #[serde(default)]
    pub scraped_at: Option<DateTime<Utc>>,
    /// Row id of the originating social post, once persisted.
    #[serde(default)]
    pub post_id: Option<i64>,
}

fn default_confidence() -> f64 {
    1.0
}

impl Event {
    pub fn new(title: impl Into<String>, venue: Venue, date: NaiveDate, source: EventSource) -> Self {
        Self {
            title: title.into().trim().to_string(),
            venue,
            date,
            source,
            start_time: None,
            end_time: None,
            description: None,
            short_description: None,
            category: EventCategory::Other,
            price: None,
            is_free: false,
            ticket_url: None,
            event_url: None,
            image_url: None,
            source_url: None,
            source_id: None,
            confidence: default_confidence(),
            needs_review: false,
            review_notes: None,
            scraped_at: None,
            post_id: None,
        }
    }

    /// Stable content-based identity key. Two proposals whose title, date,
    /// and venue name normalize identically share a key regardless of source.
    pub fn unique_key(&self) -> String {
        unique_key(&self.title, self.date, &self.venue.name)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if self.venue.name.trim().is_empty() {
            return Err(ValidationError::EmptyVenueName);
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(self.confidence));
        }
        Ok(())
    }
}

/// Instagram media type for a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Photo,
    Video,
    Carousel,
    Reel,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Video => "video",
            MediaType::Carousel => "carousel",
            MediaType::Reel => "reel",
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "photo" => Ok(MediaType::Photo),
            "video" => Ok(MediaType::Video),
            "carousel" => Ok(MediaType::Carousel),
            "reel" => Ok(MediaType::Reel),
            other => Err(ValidationError::UnknownMediaType(other.to_string())),
        }
    }
}

/// Whether a post was classified as describing an event. `None` means the
/// post has not been classified yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostClassification {
    Event,
    NotEvent,
    Ambiguous,
}

impl PostClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostClassification::Event => "event",
            PostClassification::NotEvent => "not_event",
            PostClassification::Ambiguous => "ambiguous",
        }
    }
}

impl std::str::FromStr for PostClassification {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(PostClassification::Event),
            "not_event" => Ok(PostClassification::NotEvent),
            "ambiguous" => Ok(PostClassification::Ambiguous),
            other => Err(ValidationError::UnknownCategory(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstagramProfile {
    pub instagram_id: String,
    pub handle: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub followers_count: Option<i64>,
    #[serde(default)]
    pub following_count: Option<i64>,
    #[serde(default)]
    pub post_count: Option<i64>,
    #[serde(default)]
    pub profile_pic_url: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub external_url: Option<String>,
}

impl InstagramProfile {
    pub fn new(instagram_id: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            instagram_id: instagram_id.into(),
            handle: normalize_handle(&handle.into()),
            full_name: None,
            bio: None,
            followers_count: None,
            following_count: None,
            post_count: None,
            profile_pic_url: None,
            is_verified: false,
            external_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstagramPost {
    pub instagram_post_id: String,
    #[serde(default)]
    pub shortcode: Option<String>,
    pub post_url: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub display_url: Option<String>,
    /// Carousel image URLs in display order; replaced wholesale on re-scrape.
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub comment_count: i64,
    pub posted_at: DateTime<Utc>,
    #[serde(default)]
    pub classification: Option<PostClassification>,
    #[serde(default)]
    pub classification_reason: Option<String>,
    #[serde(default = "default_true")]
    pub needs_image_analysis: bool,
}

fn default_true() -> bool {
    true
}

impl InstagramPost {
    pub fn image_count(&self) -> i64 {
        self.image_urls.len().max(1) as i64
    }
}

/// Strip any leading "@" and surrounding whitespace from a social handle.
pub fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').trim().to_string()
}

/// Normalize an event title for identity hashing and similarity comparison.
///
/// Lowercases and trims, strips at most one known prefix (first match in
/// list order) and at most one known suffix, removes punctuation, and
/// collapses whitespace runs. Idempotent.
pub fn normalize_title(title: &str) -> String {
    let mut title = title.to_lowercase().trim().to_string();

    for prefix in TITLE_PREFIXES {
        if let Some(rest) = title.strip_prefix(prefix) {
            title = rest.trim().to_string();
            break;
        }
    }

    for suffix in TITLE_SUFFIXES {
        if let Some(rest) = title.strip_suffix(suffix) {
            title = rest.trim().to_string();
            break;
        }
    }

    title
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize a venue name for similarity comparison: lowercase, drop one
/// trailing venue-type word and a leading "the".
pub fn normalize_venue(venue_name: &str) -> String {
    let venue = venue_name.to_lowercase();
    let mut words: Vec<&str> = venue.split_whitespace().collect();

    if let Some(last) = words.last() {
        if VENUE_SUFFIX_WORDS.contains(last) {
            words.pop();
        }
    }
    if words.first() == Some(&"the") {
        words.remove(0);
    }

    words.join(" ")
}

/// Compute the stable identity key for an event.
///
/// The key is a truncated hash over (normalized title, ISO date, lowercased
/// venue name). Callers must treat it as an opaque stable string; it is not
/// a security-sensitive digest.
pub fn unique_key(title: &str, date: NaiveDate, venue_name: &str) -> String {
    let key_string = format!(
        "{}|{}|{}",
        normalize_title(title),
        date.format("%Y-%m-%d"),
        venue_name.to_lowercase().trim()
    );
    let digest = Sha256::digest(key_string.as_bytes());
    hex::encode(digest)[..UNIQUE_KEY_LEN].to_string()
}

/// Normalized edit-distance ratio on the 0-100 scale used by the venue
/// resolver threshold.
pub fn fuzzy_ratio(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b) * 100.0
}

fn minutes_of_day(t: NaiveTime) -> i64 {
    i64::from(t.hour()) * 60 + i64::from(t.minute())
}

/// Weighted similarity between two events in [0.0, 1.0].
///
/// Date equality is a hard gate: events on different dates score exactly 0.
/// Otherwise title (0.5) and venue (0.35) contribute normalized edit ratios
/// and start-time closeness (0.15) is 1.0 within 30 minutes, decaying
/// linearly to 0.0 at 60 minutes apart. Missing start times score 0.
pub fn similarity(a: &Event, b: &Event) -> f64 {
    if a.date != b.date {
        return 0.0;
    }

    let title_score =
        normalized_levenshtein(&normalize_title(&a.title), &normalize_title(&b.title));
    let venue_score = normalized_levenshtein(
        &normalize_venue(&a.venue.name),
        &normalize_venue(&b.venue.name),
    );

    let time_score = match (a.start_time, b.start_time) {
        (Some(x), Some(y)) => {
            let diff = (minutes_of_day(x) - minutes_of_day(y)).abs() as f64;
            if diff <= 30.0 {
                1.0
            } else if diff >= 60.0 {
                0.0
            } else {
                1.0 - (diff - 30.0) / 30.0
            }
        }
        _ => 0.0,
    };

    title_score * 0.5 + venue_score * 0.35 + time_score * 0.15
}

/// Canonicalize a URL for the scraped-page ledger: lowercase scheme and
/// host, drop tracking parameters and fragments, sort the remaining query
/// pairs, and trim a trailing slash from non-root paths.
///
/// Returns the input unchanged when it does not parse as an absolute URL.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.to_lowercase().as_str()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let query = pairs
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }

    url.set_fragment(None);

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    url.to_string()
}
