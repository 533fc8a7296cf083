//! Command-line interface for the Townbeat event pipeline. Results go to
//! stdout as JSON; logs and errors go to stderr.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use townbeat_core::{normalize_url, Event, EventCategory, EventSource, Venue};
use townbeat_dedup::{deduplicate, DedupConfig};
use townbeat_storage::{EventStore, QueryFilter};

#[derive(Debug, Parser)]
#[command(name = "townbeat")]
#[command(about = "Townbeat event pipeline command-line interface")]
struct Cli {
    /// Path to the SQLite database.
    #[arg(long, global = true, default_value = "./townbeat.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Save a single event from JSON (inline or stdin).
    Save {
        /// Event JSON; read from stdin when omitted.
        #[arg(long)]
        json: Option<String>,
    },
    /// Save a JSON array of events from a file (or stdin).
    SaveBatch {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List stored events, optionally filtered.
    Query {
        /// Earliest event date (inclusive), YYYY-MM-DD.
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Latest event date (inclusive), YYYY-MM-DD.
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Source filter; repeatable.
        #[arg(long)]
        source: Vec<String>,
        /// Category filter; repeatable.
        #[arg(long)]
        category: Vec<String>,
    },
    /// Print aggregate statistics for the store.
    Stats,
    /// Deduplicate a JSON array of events without touching the store.
    DedupFile {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value_t = 0.75)]
        threshold: f64,
        /// Source whose record wins merges.
        #[arg(long, default_value = "facebook")]
        prefer: String,
    },
    /// Recompute stored identity keys with the current normalization.
    Rekey {
        #[arg(long)]
        dry_run: bool,
    },
    /// Record a web-aggregator page as processed.
    MarkScraped {
        #[arg(long)]
        source: String,
        #[arg(long)]
        url: String,
        #[arg(long, default_value_t = 0)]
        events_count: i64,
    },
}

/// Flat event shape accepted on the CLI surface, as emitted by the scrapers.
#[derive(Debug, Deserialize)]
struct EventInput {
    title: String,
    venue_name: String,
    #[serde(default)]
    venue_city: Option<String>,
    #[serde(default)]
    venue_address: Option<String>,
    #[serde(default)]
    venue_instagram_handle: Option<String>,
    event_date: NaiveDate,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    short_description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    is_free: bool,
    #[serde(default)]
    ticket_url: Option<String>,
    #[serde(default)]
    event_url: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default = "default_true")]
    needs_review: bool,
    #[serde(default)]
    review_notes: Option<String>,
}

fn default_confidence() -> f64 {
    0.8
}

fn default_true() -> bool {
    true
}

impl EventInput {
    fn into_event(self) -> Result<Event> {
        let source = match self.source.as_deref() {
            Some(s) => s
                .parse::<EventSource>()
                .with_context(|| format!("event '{}'", self.title))?,
            None => EventSource::WebAggregator,
        };

        let mut venue = Venue::new(self.venue_name);
        venue.city = self.venue_city;
        venue.address = self.venue_address;
        if let Some(handle) = self.venue_instagram_handle {
            venue = venue.with_handle(handle);
        }

        let mut event = Event::new(self.title, venue, self.event_date, source);
        event.start_time = self.start_time.as_deref().and_then(parse_time);
        event.end_time = self.end_time.as_deref().and_then(parse_time);
        event.description = self.description;
        event.short_description = self.short_description;
        event.category = self
            .category
            .as_deref()
            .map(EventCategory::parse_lenient)
            .unwrap_or_default();
        event.price = self.price;
        event.is_free = self.is_free;
        event.ticket_url = self.ticket_url;
        event.event_url = self.event_url;
        event.image_url = self.image_url;
        event.source_url = self.source_url;
        event.confidence = self.confidence;
        event.needs_review = self.needs_review;
        event.review_notes = self.review_notes;
        Ok(event)
    }
}

/// Parse scraped time strings like "19:30", "7:30 PM", or "7pm". Returns
/// None (with a warning) for anything unrecognized rather than failing the
/// whole event.
fn parse_time(raw: &str) -> Option<NaiveTime> {
    let cleaned = raw.trim().to_uppercase();
    if cleaned.is_empty() {
        return None;
    }
    for format in ["%H:%M:%S", "%H:%M", "%I:%M %p", "%I:%M%p", "%I %p", "%I%p"] {
        if let Ok(time) = NaiveTime::parse_from_str(&cleaned, format) {
            return Some(time);
        }
    }
    warn!(value = raw, "unparseable time, leaving unset");
    None
}

fn read_input(file: Option<&PathBuf>) -> Result<String> {
    match file {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        }
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("reading stdin")?;
            Ok(buffer)
        }
    }
}

fn parse_events(json: &str) -> Result<Vec<Event>> {
    let inputs: Vec<EventInput> = serde_json::from_str(json).context("parsing event JSON")?;
    inputs.into_iter().map(EventInput::into_event).collect()
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Save { json } => {
            let text = match json {
                Some(text) => text,
                None => read_input(None)?,
            };
            let input: EventInput = serde_json::from_str(&text).context("parsing event JSON")?;
            let event = input.into_event()?;

            let store = EventStore::open(&cli.db)?;
            let result = store.save(std::slice::from_ref(&event))?;
            println!("{}", serde_json::to_string(&result)?);
        }
        Commands::SaveBatch { file } => {
            let events = parse_events(&read_input(file.as_ref())?)?;
            let store = EventStore::open(&cli.db)?;
            let result = store.save(&events)?;
            println!("{}", serde_json::to_string(&result)?);
        }
        Commands::Query {
            from,
            to,
            source,
            category,
        } => {
            let filter = QueryFilter {
                date_from: from,
                date_to: to,
                sources: source
                    .iter()
                    .map(|s| s.parse::<EventSource>())
                    .collect::<Result<_, _>>()?,
                categories: category
                    .iter()
                    .map(|c| c.parse::<EventCategory>())
                    .collect::<Result<_, _>>()?,
            };
            let store = EventStore::open(&cli.db)?;
            let events = store.query(&filter)?;
            println!("{}", serde_json::to_string(&events)?);
        }
        Commands::Stats => {
            let store = EventStore::open(&cli.db)?;
            println!("{}", serde_json::to_string(&store.stats()?)?);
        }
        Commands::DedupFile {
            file,
            threshold,
            prefer,
        } => {
            let events = parse_events(&read_input(file.as_ref())?)?;
            let config = DedupConfig {
                threshold,
                preferred_source: prefer.parse::<EventSource>()?,
            };
            let deduped = deduplicate(events, &config);
            println!("{}", serde_json::to_string(&deduped)?);
        }
        Commands::Rekey { dry_run } => {
            let store = EventStore::open(&cli.db)?;
            let result = store.rekey_events(dry_run)?;
            println!("{}", serde_json::to_string(&result)?);
        }
        Commands::MarkScraped {
            source,
            url,
            events_count,
        } => {
            let canonical = normalize_url(&url);
            let store = EventStore::open(&cli.db)?;
            store.save_scraped_page(&source, &canonical, events_count)?;
            println!(
                "{}",
                serde_json::json!({
                    "source": source,
                    "url": canonical,
                    "events_extracted": events_count,
                })
            );
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("{}", serde_json::json!({ "error": format!("{err:#}") }));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_time_accepts_common_scraped_formats() {
        let expected = NaiveTime::from_hms_opt(19, 30, 0).expect("time");
        for raw in ["19:30", "19:30:00", "7:30 PM", "7:30pm"] {
            assert_eq!(parse_time(raw), Some(expected), "input: {raw:?}");
        }
        assert_eq!(parse_time("7pm"), NaiveTime::from_hms_opt(19, 0, 0));
        assert_eq!(parse_time("doors at eight"), None);
        assert_eq!(parse_time(""), None);
    }

    #[test]
    fn event_input_applies_defaults_and_lenient_category() {
        let input: EventInput = serde_json::from_str(
            r#"{
                "title": "Jazz Night",
                "venue_name": "The Falcon",
                "venue_city": "Marlboro",
                "event_date": "2025-12-15",
                "start_time": "7:30 PM",
                "category": "Food"
            }"#,
        )
        .expect("input json");
        let event = input.into_event().expect("conversion");

        assert_eq!(event.source, EventSource::WebAggregator);
        assert_eq!(event.category, EventCategory::FoodDrink);
        assert_eq!(event.start_time, NaiveTime::from_hms_opt(19, 30, 0));
        assert_eq!(event.venue.city.as_deref(), Some("Marlboro"));
        assert!((event.confidence - 0.8).abs() < 1e-9);
        assert!(event.needs_review);
    }

    #[test]
    fn event_input_rejects_unknown_source() {
        let input: EventInput = serde_json::from_str(
            r#"{
                "title": "Jazz Night",
                "venue_name": "The Falcon",
                "event_date": "2025-12-15",
                "source": "tiktok"
            }"#,
        )
        .expect("input json");
        assert!(input.into_event().is_err());
    }
}
