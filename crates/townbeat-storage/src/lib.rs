//! SQLite-backed relational store for venues, events, and Instagram scrape
//! data, with a versioned schema and fuzzy venue resolution.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use townbeat_core::{
    fuzzy_ratio, unique_key, Event, EventCategory, EventSource, InstagramPost, InstagramProfile,
    MediaType, PostClassification, ValidationError, Venue,
};

pub const CRATE_NAME: &str = "townbeat-storage";

/// Stamped into `schema_metadata` on creation; older databases are migrated
/// step by step up to this version on open.
pub const CURRENT_SCHEMA_VERSION: &str = "2.2.0";

/// Fuzzy name score (0-100) at or above which two venues in the same
/// city/state are treated as the same place.
pub const VENUE_MATCH_THRESHOLD: f64 = 85.0;

const SCHEMA_SQL: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Instagram profiles
CREATE TABLE IF NOT EXISTS profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instagram_id TEXT UNIQUE NOT NULL,
    handle TEXT NOT NULL,
    full_name TEXT,
    bio TEXT,
    followers_count INTEGER,
    following_count INTEGER,
    post_count INTEGER,
    profile_pic_url TEXT,
    is_verified INTEGER DEFAULT 0 CHECK(is_verified IN (0, 1)),
    external_url TEXT,
    last_scraped_at TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_profiles_handle ON profiles(handle);
CREATE INDEX IF NOT EXISTS idx_profiles_instagram_id ON profiles(instagram_id);

-- Instagram posts
CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    profile_id INTEGER NOT NULL,
    instagram_post_id TEXT UNIQUE NOT NULL,
    shortcode TEXT,
    post_url TEXT NOT NULL,
    caption TEXT,
    media_type TEXT CHECK(media_type IN ('photo', 'video', 'carousel', 'reel')),
    display_url TEXT,
    image_count INTEGER DEFAULT 1,
    like_count INTEGER DEFAULT 0,
    comment_count INTEGER DEFAULT 0,
    posted_at TEXT NOT NULL,
    scraped_at TEXT NOT NULL,
    classification TEXT CHECK(classification IN ('event', 'not_event', 'ambiguous')),
    classification_reason TEXT,
    needs_image_analysis INTEGER DEFAULT 1 CHECK(needs_image_analysis IN (0, 1)),
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (profile_id) REFERENCES profiles(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_posts_profile_id ON posts(profile_id);
CREATE INDEX IF NOT EXISTS idx_posts_instagram_post_id ON posts(instagram_post_id);
CREATE INDEX IF NOT EXISTS idx_posts_posted_at ON posts(posted_at);
CREATE INDEX IF NOT EXISTS idx_posts_shortcode ON posts(shortcode);

-- Carousel images, one row per image
CREATE TABLE IF NOT EXISTS post_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    post_id INTEGER NOT NULL,
    image_url TEXT NOT NULL,
    image_index INTEGER NOT NULL DEFAULT 0,
    file_path TEXT,
    downloaded_at TEXT,
    analyzed_at TEXT,
    is_event_flyer INTEGER DEFAULT 0 CHECK(is_event_flyer IN (0, 1)),
    FOREIGN KEY (post_id) REFERENCES posts(id) ON DELETE CASCADE,
    UNIQUE(post_id, image_index)
);

CREATE INDEX IF NOT EXISTS idx_post_images_post_id ON post_images(post_id);

-- Venues (normalized)
CREATE TABLE IF NOT EXISTS venues (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    city TEXT,
    state TEXT DEFAULT 'NY',
    address TEXT,
    instagram_handle TEXT,
    website TEXT,
    lat REAL,
    lon REAL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(name, city, state)
);

-- Events, keyed by content-based unique_key
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    unique_key TEXT UNIQUE NOT NULL,
    venue_id INTEGER NOT NULL,
    post_id INTEGER,

    title TEXT NOT NULL,
    event_date TEXT NOT NULL,
    start_time TEXT,
    end_time TEXT,
    description TEXT,
    short_description TEXT,

    source TEXT NOT NULL CHECK(source IN ('instagram', 'facebook', 'eventbrite', 'manual', 'web_aggregator')),
    category TEXT DEFAULT 'other' CHECK(category IN ('music', 'food_drink', 'art', 'community', 'outdoor', 'market', 'workshop', 'other')),

    price TEXT,
    is_free INTEGER DEFAULT 0 CHECK(is_free IN (0, 1)),
    ticket_url TEXT,
    event_url TEXT,

    image_url TEXT,
    source_url TEXT,
    source_id TEXT,

    confidence REAL DEFAULT 1.0,
    needs_review INTEGER DEFAULT 0 CHECK(needs_review IN (0, 1)),
    review_notes TEXT,
    scraped_at TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP,

    FOREIGN KEY (venue_id) REFERENCES venues(id),
    FOREIGN KEY (post_id) REFERENCES posts(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_events_date ON events(event_date);
CREATE INDEX IF NOT EXISTS idx_events_source ON events(source);
CREATE INDEX IF NOT EXISTS idx_events_category ON events(category);
CREATE INDEX IF NOT EXISTS idx_events_venue_id ON events(venue_id);
CREATE INDEX IF NOT EXISTS idx_events_post_id ON events(post_id);
CREATE INDEX IF NOT EXISTS idx_venues_instagram ON venues(instagram_handle);

-- Already-processed ledger for web aggregator pages
CREATE TABLE IF NOT EXISTS scraped_pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name TEXT NOT NULL,
    url TEXT NOT NULL,
    events_extracted INTEGER NOT NULL DEFAULT 0,
    scraped_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(source_name, url)
);

CREATE INDEX IF NOT EXISTS idx_scraped_pages_source ON scraped_pages(source_name);
"#;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unsupported schema version '{0}' in database")]
    UnknownSchemaVersion(String),
    #[error("corrupt value in column {column}: {message}")]
    Corrupt {
        column: &'static str,
        message: String,
    },
    #[error("creating database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Per-item failure recorded during a batch operation.
#[derive(Debug, Clone, Serialize)]
pub struct SaveError {
    /// Event unique key, or post id for Instagram batches.
    pub key: String,
    pub message: String,
}

/// Counts reported by batch save operations. Per-item failures are recorded
/// in `errors`; they never abort the rest of the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SaveResult {
    pub saved: usize,
    pub updated: usize,
    pub errors: Vec<SaveError>,
}

/// Outcome of the explicit re-key migration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RekeyResult {
    pub unchanged: usize,
    pub updated: usize,
    /// Rows whose recomputed key collided with another row; the existing row
    /// wins and the collided row is flagged for manual review.
    pub collisions: usize,
    pub dry_run: bool,
}

/// Optional, conjunctive filters for [`EventStore::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub sources: Vec<EventSource>,
    pub categories: Vec<EventCategory>,
}

/// Aggregate counts for the `stats` CLI surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_events: i64,
    pub needs_review: i64,
    pub unique_venues: i64,
    pub earliest: Option<String>,
    pub latest: Option<String>,
    pub by_source: BTreeMap<String, i64>,
    pub by_category: BTreeMap<String, i64>,
}

/// A persisted Instagram post, as read back for the classification workflow.
#[derive(Debug, Clone, Serialize)]
pub struct StoredPost {
    pub id: i64,
    pub instagram_post_id: String,
    pub post_url: String,
    pub caption: Option<String>,
    pub media_type: Option<MediaType>,
    pub classification: Option<PostClassification>,
    pub classification_reason: Option<String>,
    pub needs_image_analysis: bool,
    pub image_urls: Vec<String>,
}

/// A scraped-page ledger entry.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapedPage {
    pub source_name: String,
    pub url: String,
    pub events_extracted: i64,
    pub scraped_at: String,
}

enum UpsertOutcome {
    Saved,
    Updated,
}

/// SQLite store. Opens one connection and one transaction per logical
/// operation; commits on success, rolls back on any error.
#[derive(Debug, Clone)]
pub struct EventStore {
    db_path: PathBuf,
}

impl EventStore {
    /// Open (creating if needed) the database at `path`, initialize the
    /// schema, and run any pending migrations.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let store = Self { db_path };
        store.with_tx(|tx| {
            tx.execute_batch(SCHEMA_SQL)?;
            ensure_schema_version(tx)
        })?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Upsert a batch of events. Each event is validated, its venue resolved,
    /// and the row inserted or fully updated by identity key. A single
    /// event's failure is recorded and the batch continues.
    pub fn save(&self, events: &[Event]) -> Result<SaveResult> {
        self.with_tx(|tx| {
            let mut result = SaveResult::default();
            for event in events {
                match save_one(tx, event) {
                    Ok(UpsertOutcome::Saved) => result.saved += 1,
                    Ok(UpsertOutcome::Updated) => result.updated += 1,
                    Err(err) => {
                        warn!(key = %event.unique_key(), error = %err, "event save failed");
                        result.errors.push(SaveError {
                            key: event.unique_key(),
                            message: err.to_string(),
                        });
                    }
                }
            }
            info!(
                saved = result.saved,
                updated = result.updated,
                failed = result.errors.len(),
                "event batch saved"
            );
            Ok(result)
        })
    }

    /// All events ordered by date ascending, venue fields denormalized back
    /// onto each record.
    pub fn load(&self) -> Result<Vec<Event>> {
        self.query(&QueryFilter::default())
    }

    /// Query events with optional conjunctive filters, ordered by date
    /// ascending. Every value is parameter-bound.
    pub fn query(&self, filter: &QueryFilter) -> Result<Vec<Event>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut bindings: Vec<Value> = Vec::new();

        if let Some(date_from) = filter.date_from {
            clauses.push("e.event_date >= ?".to_string());
            bindings.push(date_from.to_string().into());
        }
        if let Some(date_to) = filter.date_to {
            clauses.push("e.event_date <= ?".to_string());
            bindings.push(date_to.to_string().into());
        }
        if !filter.sources.is_empty() {
            let placeholders = vec!["?"; filter.sources.len()].join(",");
            clauses.push(format!("e.source IN ({placeholders})"));
            bindings.extend(filter.sources.iter().map(|s| Value::from(s.as_str().to_string())));
        }
        if !filter.categories.is_empty() {
            let placeholders = vec!["?"; filter.categories.len()].join(",");
            clauses.push(format!("e.category IN ({placeholders})"));
            bindings.extend(
                filter
                    .categories
                    .iter()
                    .map(|c| Value::from(c.as_str().to_string())),
            );
        }

        let where_sql = if clauses.is_empty() {
            "1=1".to_string()
        } else {
            clauses.join(" AND ")
        };
        let sql = format!(
            "SELECT e.title, e.event_date, e.start_time, e.end_time, e.description,
                    e.short_description, e.source, e.category, e.price, e.is_free,
                    e.ticket_url, e.event_url, e.image_url, e.source_url, e.source_id,
                    e.confidence, e.needs_review, e.review_notes, e.scraped_at, e.post_id,
                    v.name AS venue_name, v.city AS venue_city, v.state AS venue_state,
                    v.address AS venue_address, v.instagram_handle AS venue_instagram_handle,
                    v.website AS venue_website, v.lat AS venue_lat, v.lon AS venue_lon
             FROM events e
             JOIN venues v ON e.venue_id = v.id
             WHERE {where_sql}
             ORDER BY e.event_date, e.id"
        );

        self.with_tx(|tx| {
            let mut stmt = tx.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(bindings.iter()))?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
    }

    /// Persist one Instagram scrape: the profile, its posts (each post's
    /// image list replaced wholesale), and any events extracted per post.
    /// One post's failure is recorded and the rest of the batch continues.
    pub fn save_instagram_scrape(
        &self,
        profile: &InstagramProfile,
        posts: &[InstagramPost],
        events_by_post: &HashMap<String, Vec<Event>>,
    ) -> Result<SaveResult> {
        self.with_tx(|tx| {
            let profile_id = find_or_create_profile(tx, profile)?;

            let mut result = SaveResult::default();
            for post in posts {
                match save_post_with_events(tx, post, profile_id, events_by_post) {
                    Ok((saved, updated)) => {
                        result.saved += saved;
                        result.updated += updated;
                    }
                    Err(err) => {
                        warn!(
                            post = %post.instagram_post_id,
                            error = %err,
                            "post save failed"
                        );
                        result.errors.push(SaveError {
                            key: post.instagram_post_id.clone(),
                            message: err.to_string(),
                        });
                    }
                }
            }
            info!(
                handle = %profile.handle,
                posts = posts.len(),
                saved = result.saved,
                updated = result.updated,
                failed = result.errors.len(),
                "instagram scrape saved"
            );
            Ok(result)
        })
    }

    /// Posts for a profile handle, keyed by external post id. With
    /// `only_classified`, unclassified posts are skipped.
    pub fn get_posts_for_profile(
        &self,
        handle: &str,
        only_classified: bool,
    ) -> Result<HashMap<String, StoredPost>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT p.id, p.instagram_post_id, p.post_url, p.caption, p.media_type,
                        p.classification, p.classification_reason, p.needs_image_analysis
                 FROM posts p
                 JOIN profiles pr ON p.profile_id = pr.id
                 WHERE pr.handle = ?1
                 ORDER BY p.posted_at DESC",
            )?;
            let mut rows = stmt.query([handle])?;
            let mut posts = HashMap::new();
            while let Some(row) = rows.next()? {
                let post = row_to_stored_post(tx, row)?;
                if only_classified && post.classification.is_none() {
                    continue;
                }
                posts.insert(post.instagram_post_id.clone(), post);
            }
            Ok(posts)
        })
    }

    /// Delete a profile by external id. Its posts cascade away (and each
    /// post's images with them); events keep their rows with a nulled
    /// post reference.
    pub fn delete_profile(&self, instagram_id: &str) -> Result<bool> {
        self.with_tx(|tx| {
            let affected = tx.execute(
                "DELETE FROM profiles WHERE instagram_id = ?1",
                [instagram_id],
            )?;
            Ok(affected > 0)
        })
    }

    /// Delete a post by external id. Dependent events survive with their
    /// post reference set to null.
    pub fn delete_post(&self, instagram_post_id: &str) -> Result<bool> {
        self.with_tx(|tx| {
            let affected = tx.execute(
                "DELETE FROM posts WHERE instagram_post_id = ?1",
                [instagram_post_id],
            )?;
            Ok(affected > 0)
        })
    }

    /// Record (or refresh) a scraped-page ledger entry.
    pub fn save_scraped_page(&self, source_name: &str, url: &str, events_extracted: i64) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO scraped_pages (source_name, url, events_extracted)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source_name, url) DO UPDATE SET
                   events_extracted = excluded.events_extracted,
                   scraped_at = CURRENT_TIMESTAMP",
                params![source_name, url, events_extracted],
            )?;
            Ok(())
        })
    }

    /// URLs already processed for a source.
    pub fn get_scraped_urls_for_source(&self, source_name: &str) -> Result<HashSet<String>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare("SELECT url FROM scraped_pages WHERE source_name = ?1")?;
            let mut rows = stmt.query([source_name])?;
            let mut urls = HashSet::new();
            while let Some(row) = rows.next()? {
                urls.insert(row.get::<_, String>(0)?);
            }
            Ok(urls)
        })
    }

    pub fn get_scraped_page(&self, source_name: &str, url: &str) -> Result<Option<ScrapedPage>> {
        self.with_tx(|tx| {
            let page = tx
                .query_row(
                    "SELECT source_name, url, events_extracted, scraped_at
                     FROM scraped_pages WHERE source_name = ?1 AND url = ?2",
                    params![source_name, url],
                    |row| {
                        Ok(ScrapedPage {
                            source_name: row.get(0)?,
                            url: row.get(1)?,
                            events_extracted: row.get(2)?,
                            scraped_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(page)
        })
    }

    /// Aggregate statistics over the store.
    pub fn stats(&self) -> Result<StoreStats> {
        self.with_tx(|tx| {
            let total_events: i64 =
                tx.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            let needs_review: i64 = tx.query_row(
                "SELECT COUNT(*) FROM events WHERE needs_review = 1",
                [],
                |row| row.get(0),
            )?;
            let unique_venues: i64 =
                tx.query_row("SELECT COUNT(*) FROM venues", [], |row| row.get(0))?;
            let (earliest, latest): (Option<String>, Option<String>) = tx.query_row(
                "SELECT MIN(event_date), MAX(event_date) FROM events",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let mut by_source = BTreeMap::new();
            let mut stmt = tx.prepare("SELECT source, COUNT(*) FROM events GROUP BY source")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                by_source.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
            }

            let mut by_category = BTreeMap::new();
            let mut stmt = tx.prepare("SELECT category, COUNT(*) FROM events GROUP BY category")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                by_category.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
            }

            Ok(StoreStats {
                total_events,
                needs_review,
                unique_venues,
                earliest,
                latest,
                by_source,
                by_category,
            })
        })
    }

    pub fn count_events(&self) -> Result<i64> {
        self.with_tx(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?))
    }

    pub fn count_venues(&self) -> Result<i64> {
        self.with_tx(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM venues", [], |row| row.get(0))?))
    }

    /// Recompute every stored identity key with the current normalization.
    ///
    /// Rows whose new key collides with another row are left on their old
    /// key and flagged `needs_review` with a note; nothing is deleted or
    /// overwritten. Safe to run repeatedly.
    pub fn rekey_events(&self, dry_run: bool) -> Result<RekeyResult> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT e.id, e.unique_key, e.title, e.event_date, v.name
                 FROM events e
                 JOIN venues v ON e.venue_id = v.id",
            )?;
            let mut rows = stmt.query([])?;

            let mut updates: Vec<(i64, String, String)> = Vec::new();
            let mut new_key_groups: HashMap<String, Vec<i64>> = HashMap::new();
            let mut unchanged = 0usize;

            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let old_key: String = row.get(1)?;
                let title: String = row.get(2)?;
                let date_text: String = row.get(3)?;
                let venue_name: String = row.get(4)?;

                let date = parse_date("event_date", &date_text)?;
                let new_key = unique_key(&title, date, &venue_name);
                new_key_groups.entry(new_key.clone()).or_default().push(id);

                if new_key == old_key {
                    unchanged += 1;
                } else {
                    updates.push((id, old_key, new_key));
                }
            }
            drop(rows);
            drop(stmt);

            let collision_groups = new_key_groups.values().filter(|ids| ids.len() > 1).count();
            info!(
                unchanged,
                to_update = updates.len(),
                collision_groups,
                dry_run,
                "re-key migration scan"
            );

            if dry_run {
                return Ok(RekeyResult {
                    unchanged,
                    updated: updates.len(),
                    collisions: collision_groups,
                    dry_run: true,
                });
            }

            let mut updated = 0usize;
            let mut collisions = 0usize;
            for (id, old_key, new_key) in updates {
                let outcome = tx.execute(
                    "UPDATE events SET unique_key = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
                    params![new_key, id],
                );
                match outcome {
                    Ok(_) => updated += 1,
                    Err(err) if is_constraint_violation(&err) => {
                        debug!(event_id = id, %old_key, %new_key, "re-key collision");
                        tx.execute(
                            "UPDATE events SET needs_review = 1, review_notes = ?1 WHERE id = ?2",
                            params![
                                format!("duplicate after re-key: {old_key} -> {new_key}"),
                                id
                            ],
                        )?;
                        collisions += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            Ok(RekeyResult {
                unchanged,
                updated,
                collisions,
                dry_run: false,
            })
        })
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn ensure_schema_version(tx: &Transaction) -> Result<()> {
    let stored: Option<String> = tx
        .query_row(
            "SELECT value FROM schema_metadata WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        None => {
            tx.execute(
                "INSERT INTO schema_metadata (key, value) VALUES ('version', ?1)",
                [CURRENT_SCHEMA_VERSION],
            )?;
            Ok(())
        }
        Some(version) if version == CURRENT_SCHEMA_VERSION => Ok(()),
        Some(version) => migrate_schema(tx, &version),
    }
}

/// Run sequential migration steps from `from_version` up to current. Every
/// step tolerates a database already partially migrated by a crashed run.
fn migrate_schema(tx: &Transaction, from_version: &str) -> Result<()> {
    info!(from = from_version, to = CURRENT_SCHEMA_VERSION, "migrating schema");
    let mut version = from_version;

    if version == "1.0.0" {
        migrate_1_0_0_to_2_0_0(tx)?;
        version = "2.0.0";
    }
    if version == "2.0.0" {
        migrate_2_0_0_to_2_1_0(tx)?;
        version = "2.1.0";
    }
    if version == "2.1.0" {
        migrate_2_1_0_to_2_2_0(tx)?;
        version = "2.2.0";
    }

    if version != CURRENT_SCHEMA_VERSION {
        return Err(StorageError::UnknownSchemaVersion(from_version.to_string()));
    }

    tx.execute(
        "UPDATE schema_metadata SET value = ?1 WHERE key = 'version'",
        [CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

/// 1.0.0 -> 2.0.0: profiles and posts tables, post back-reference on events.
fn migrate_1_0_0_to_2_0_0(tx: &Transaction) -> Result<()> {
    // Tables and indexes are created by SCHEMA_SQL's IF NOT EXISTS clauses;
    // only the events column is a true alteration.
    add_column_if_missing(
        tx,
        "ALTER TABLE events ADD COLUMN post_id INTEGER REFERENCES posts(id) ON DELETE SET NULL",
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_post_id ON events(post_id)",
        [],
    )?;
    Ok(())
}

/// 2.0.0 -> 2.1.0: carousel image table, post classification columns, and a
/// one-time backfill of display_url into post_images.
fn migrate_2_0_0_to_2_1_0(tx: &Transaction) -> Result<()> {
    add_column_if_missing(tx, "ALTER TABLE posts ADD COLUMN image_count INTEGER DEFAULT 1")?;
    add_column_if_missing(
        tx,
        "ALTER TABLE posts ADD COLUMN classification TEXT CHECK(classification IN ('event', 'not_event', 'ambiguous'))",
    )?;
    add_column_if_missing(tx, "ALTER TABLE posts ADD COLUMN classification_reason TEXT")?;
    add_column_if_missing(
        tx,
        "ALTER TABLE posts ADD COLUMN needs_image_analysis INTEGER DEFAULT 1 CHECK(needs_image_analysis IN (0, 1))",
    )?;

    tx.execute(
        "INSERT INTO post_images (post_id, image_url, image_index)
         SELECT p.id, p.display_url, 0 FROM posts p
         WHERE p.display_url IS NOT NULL
           AND NOT EXISTS (SELECT 1 FROM post_images pi WHERE pi.post_id = p.id)",
        [],
    )?;
    Ok(())
}

/// 2.1.0 -> 2.2.0: scraped-page ledger (table created by SCHEMA_SQL).
fn migrate_2_1_0_to_2_2_0(_tx: &Transaction) -> Result<()> {
    Ok(())
}

fn add_column_if_missing(tx: &Transaction, sql: &str) -> Result<()> {
    match tx.execute(sql, []) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(_, Some(message)))
            if message.contains("duplicate column name") =>
        {
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn save_one(tx: &Transaction, event: &Event) -> Result<UpsertOutcome> {
    event.validate()?;
    let venue_id = find_or_create_venue(tx, &event.venue)?;
    upsert_event(tx, event, venue_id)
}

/// Resolve a venue mention to a persisted row id: exact handle match, then
/// fuzzy name match scoped to (city, state), then a fresh insert. Matches
/// only ever consider rows visible at this point in the transaction, so
/// insertion order within a batch can affect the final venue count.
fn find_or_create_venue(tx: &Transaction, venue: &Venue) -> Result<i64> {
    if let Some(handle) = venue.normalized_handle() {
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM venues WHERE instagram_handle = ?1",
                [&handle],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            update_venue_fields(tx, id, venue)?;
            return Ok(id);
        }
    }

    let mut stmt = tx.prepare("SELECT id, name FROM venues WHERE city IS ?1 AND state = ?2")?;
    let mut rows = stmt.query(params![venue.city, venue.state])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let name: String = row.get(1)?;
        let score = fuzzy_ratio(&venue.name.to_lowercase(), &name.to_lowercase());
        if score >= VENUE_MATCH_THRESHOLD {
            debug!(incoming = %venue.name, matched = %name, score, "fuzzy venue match");
            update_venue_fields(tx, id, venue)?;
            return Ok(id);
        }
    }
    drop(rows);
    drop(stmt);

    insert_venue(tx, venue)
}

/// Fill any fields the stored venue is missing. Existing non-null values
/// are never replaced.
fn update_venue_fields(tx: &Transaction, venue_id: i64, venue: &Venue) -> Result<()> {
    let (lat, lon) = match venue.coordinates {
        Some((lat, lon)) => (Some(lat), Some(lon)),
        None => (None, None),
    };
    tx.execute(
        "UPDATE venues SET
            instagram_handle = COALESCE(instagram_handle, ?1),
            website = COALESCE(website, ?2),
            address = COALESCE(address, ?3),
            lat = COALESCE(lat, ?4),
            lon = COALESCE(lon, ?5)
         WHERE id = ?6",
        params![
            venue.normalized_handle(),
            venue.website,
            venue.address,
            lat,
            lon,
            venue_id
        ],
    )?;
    Ok(())
}

fn insert_venue(tx: &Transaction, venue: &Venue) -> Result<i64> {
    let (lat, lon) = match venue.coordinates {
        Some((lat, lon)) => (Some(lat), Some(lon)),
        None => (None, None),
    };
    tx.execute(
        "INSERT INTO venues (name, city, state, address, instagram_handle, website, lat, lon)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            venue.name.trim(),
            venue.city,
            venue.state,
            venue.address,
            venue.normalized_handle(),
            venue.website,
            lat,
            lon
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn upsert_event(tx: &Transaction, event: &Event, venue_id: i64) -> Result<UpsertOutcome> {
    let key = event.unique_key();
    let existing: Option<i64> = tx
        .query_row("SELECT id FROM events WHERE unique_key = ?1", [&key], |row| {
            row.get(0)
        })
        .optional()?;

    let date = event.date.to_string();
    let start_time = event.start_time.map(|t| t.format("%H:%M:%S").to_string());
    let end_time = event.end_time.map(|t| t.format("%H:%M:%S").to_string());
    let scraped_at = event.scraped_at.map(|t| t.to_rfc3339());

    if existing.is_some() {
        tx.execute(
            "UPDATE events SET
                title = ?1, event_date = ?2, start_time = ?3, end_time = ?4,
                description = ?5, short_description = ?6, source = ?7, category = ?8,
                price = ?9, is_free = ?10, ticket_url = ?11, event_url = ?12,
                image_url = ?13, source_url = ?14, source_id = ?15,
                confidence = ?16, needs_review = ?17, review_notes = ?18, scraped_at = ?19,
                venue_id = ?20, post_id = ?21, updated_at = CURRENT_TIMESTAMP
             WHERE unique_key = ?22",
            params![
                event.title,
                date,
                start_time,
                end_time,
                event.description,
                event.short_description,
                event.source.as_str(),
                event.category.as_str(),
                event.price,
                event.is_free as i64,
                event.ticket_url,
                event.event_url,
                event.image_url,
                event.source_url,
                event.source_id,
                event.confidence,
                event.needs_review as i64,
                event.review_notes,
                scraped_at,
                venue_id,
                event.post_id,
                key,
            ],
        )?;
        Ok(UpsertOutcome::Updated)
    } else {
        tx.execute(
            "INSERT INTO events (
                title, event_date, start_time, end_time,
                description, short_description, source, category,
                price, is_free, ticket_url, event_url,
                image_url, source_url, source_id,
                confidence, needs_review, review_notes, scraped_at,
                venue_id, post_id, unique_key
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                       ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                event.title,
                date,
                start_time,
                end_time,
                event.description,
                event.short_description,
                event.source.as_str(),
                event.category.as_str(),
                event.price,
                event.is_free as i64,
                event.ticket_url,
                event.event_url,
                event.image_url,
                event.source_url,
                event.source_id,
                event.confidence,
                event.needs_review as i64,
                event.review_notes,
                scraped_at,
                venue_id,
                event.post_id,
                key,
            ],
        )?;
        Ok(UpsertOutcome::Saved)
    }
}

fn find_or_create_profile(tx: &Transaction, profile: &InstagramProfile) -> Result<i64> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM profiles WHERE instagram_id = ?1",
            [&profile.instagram_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        tx.execute(
            "UPDATE profiles SET
                handle = ?1,
                full_name = COALESCE(?2, full_name),
                bio = COALESCE(?3, bio),
                followers_count = COALESCE(?4, followers_count),
                following_count = COALESCE(?5, following_count),
                post_count = COALESCE(?6, post_count),
                profile_pic_url = COALESCE(?7, profile_pic_url),
                is_verified = ?8,
                external_url = COALESCE(?9, external_url),
                last_scraped_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ?10",
            params![
                profile.handle,
                profile.full_name,
                profile.bio,
                profile.followers_count,
                profile.following_count,
                profile.post_count,
                profile.profile_pic_url,
                profile.is_verified as i64,
                profile.external_url,
                id
            ],
        )?;
        return Ok(id);
    }

    tx.execute(
        "INSERT INTO profiles (
            instagram_id, handle, full_name, bio, followers_count,
            following_count, post_count, profile_pic_url, is_verified,
            external_url, last_scraped_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, CURRENT_TIMESTAMP)",
        params![
            profile.instagram_id,
            profile.handle,
            profile.full_name,
            profile.bio,
            profile.followers_count,
            profile.following_count,
            profile.post_count,
            profile.profile_pic_url,
            profile.is_verified as i64,
            profile.external_url
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn save_post_with_events(
    tx: &Transaction,
    post: &InstagramPost,
    profile_id: i64,
    events_by_post: &HashMap<String, Vec<Event>>,
) -> Result<(usize, usize)> {
    let post_db_id = find_or_create_post(tx, post, profile_id)?;

    let mut saved = 0;
    let mut updated = 0;
    if let Some(events) = events_by_post.get(&post.instagram_post_id) {
        for event in events {
            let mut event = event.clone();
            event.post_id = Some(post_db_id);
            match save_one(tx, &event)? {
                UpsertOutcome::Saved => saved += 1,
                UpsertOutcome::Updated => updated += 1,
            }
        }
    }
    Ok((saved, updated))
}

fn find_or_create_post(tx: &Transaction, post: &InstagramPost, profile_id: i64) -> Result<i64> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM posts WHERE instagram_post_id = ?1",
            [&post.instagram_post_id],
            |row| row.get(0),
        )
        .optional()?;

    let post_db_id = if let Some(id) = existing {
        tx.execute(
            "UPDATE posts SET
                shortcode = COALESCE(?1, shortcode),
                post_url = ?2,
                caption = ?3,
                media_type = ?4,
                display_url = COALESCE(?5, display_url),
                image_count = ?6,
                like_count = ?7,
                comment_count = ?8,
                classification = COALESCE(?9, classification),
                classification_reason = COALESCE(?10, classification_reason),
                needs_image_analysis = ?11,
                scraped_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ?12",
            params![
                post.shortcode,
                post.post_url,
                post.caption,
                post.media_type.map(|m| m.as_str()),
                post.display_url,
                post.image_count(),
                post.like_count,
                post.comment_count,
                post.classification.map(|c| c.as_str()),
                post.classification_reason,
                post.needs_image_analysis as i64,
                id
            ],
        )?;
        id
    } else {
        tx.execute(
            "INSERT INTO posts (
                profile_id, instagram_post_id, shortcode, post_url, caption,
                media_type, display_url, image_count, like_count, comment_count,
                classification, classification_reason, needs_image_analysis,
                posted_at, scraped_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                       CURRENT_TIMESTAMP)",
            params![
                profile_id,
                post.instagram_post_id,
                post.shortcode,
                post.post_url,
                post.caption,
                post.media_type.map(|m| m.as_str()),
                post.display_url,
                post.image_count(),
                post.like_count,
                post.comment_count,
                post.classification.map(|c| c.as_str()),
                post.classification_reason,
                post.needs_image_analysis as i64,
                post.posted_at.to_rfc3339()
            ],
        )?;
        tx.last_insert_rowid()
    };

    replace_post_images(tx, post_db_id, &post.image_urls)?;
    Ok(post_db_id)
}

/// Replace a post's image rows wholesale so carousel ordering stays
/// consistent across re-scrapes.
fn replace_post_images(tx: &Transaction, post_db_id: i64, image_urls: &[String]) -> Result<()> {
    tx.execute("DELETE FROM post_images WHERE post_id = ?1", [post_db_id])?;
    for (index, url) in image_urls.iter().enumerate() {
        if url.is_empty() {
            continue;
        }
        tx.execute(
            "INSERT INTO post_images (post_id, image_url, image_index) VALUES (?1, ?2, ?3)",
            params![post_db_id, url, index as i64],
        )?;
    }
    Ok(())
}

fn parse_date(column: &'static str, text: &str) -> Result<NaiveDate> {
    text.parse().map_err(|err: chrono::ParseError| StorageError::Corrupt {
        column,
        message: err.to_string(),
    })
}

fn parse_time_opt(column: &'static str, text: Option<String>) -> Result<Option<NaiveTime>> {
    text.map(|t| {
        NaiveTime::parse_from_str(&t, "%H:%M:%S").map_err(|err| StorageError::Corrupt {
            column,
            message: err.to_string(),
        })
    })
    .transpose()
}

fn parse_timestamp_opt(column: &'static str, text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| StorageError::Corrupt {
                column,
                message: err.to_string(),
            })
    })
    .transpose()
}

fn row_to_event(row: &Row) -> Result<Event> {
    let lat: Option<f64> = row.get("venue_lat")?;
    let lon: Option<f64> = row.get("venue_lon")?;
    let venue = Venue {
        name: row.get("venue_name")?,
        city: row.get("venue_city")?,
        state: row.get("venue_state")?,
        address: row.get("venue_address")?,
        instagram_handle: row.get("venue_instagram_handle")?,
        website: row.get("venue_website")?,
        coordinates: match (lat, lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        },
    };

    let source_text: String = row.get("source")?;
    let source: EventSource = source_text.parse().map_err(|_| StorageError::Corrupt {
        column: "source",
        message: format!("unknown source '{source_text}'"),
    })?;
    let category_text: Option<String> = row.get("category")?;
    let category = match category_text {
        Some(text) => text.parse().map_err(|_| StorageError::Corrupt {
            column: "category",
            message: format!("unknown category '{text}'"),
        })?,
        None => EventCategory::Other,
    };

    let date_text: String = row.get("event_date")?;
    Ok(Event {
        title: row.get("title")?,
        venue,
        date: parse_date("event_date", &date_text)?,
        source,
        start_time: parse_time_opt("start_time", row.get("start_time")?)?,
        end_time: parse_time_opt("end_time", row.get("end_time")?)?,
        description: row.get("description")?,
        short_description: row.get("short_description")?,
        category,
        price: row.get("price")?,
        is_free: row.get::<_, i64>("is_free")? != 0,
        ticket_url: row.get("ticket_url")?,
        event_url: row.get("event_url")?,
        image_url: row.get("image_url")?,
        source_url: row.get("source_url")?,
        source_id: row.get("source_id")?,
        confidence: row.get("confidence")?,
        needs_review: row.get::<_, i64>("needs_review")? != 0,
        review_notes: row.get("review_notes")?,
        scraped_at: parse_timestamp_opt("scraped_at", row.get("scraped_at")?)?,
        post_id: row.get("post_id")?,
    })
}

fn row_to_stored_post(tx: &Transaction, row: &Row) -> Result<StoredPost> {
    let id: i64 = row.get(0)?;

    let media_type_text: Option<String> = row.get(4)?;
    let media_type = media_type_text
        .map(|t| {
            t.parse::<MediaType>().map_err(|_| StorageError::Corrupt {
                column: "media_type",
                message: format!("unknown media type '{t}'"),
            })
        })
        .transpose()?;
    let classification_text: Option<String> = row.get(5)?;
    let classification = classification_text
        .map(|t| {
            t.parse::<PostClassification>()
                .map_err(|_| StorageError::Corrupt {
                    column: "classification",
                    message: format!("unknown classification '{t}'"),
                })
        })
        .transpose()?;

    let mut stmt = tx.prepare(
        "SELECT image_url FROM post_images WHERE post_id = ?1 ORDER BY image_index",
    )?;
    let mut rows = stmt.query([id])?;
    let mut image_urls = Vec::new();
    while let Some(image_row) = rows.next()? {
        image_urls.push(image_row.get::<_, String>(0)?);
    }

    Ok(StoredPost {
        id,
        instagram_post_id: row.get(1)?,
        post_url: row.get(2)?,
        caption: row.get(3)?,
        media_type,
        classification,
        classification_reason: row.get(6)?,
        needs_image_analysis: row.get::<_, i64>(7)? != 0,
        image_urls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use townbeat_dedup::{deduplicate, DedupConfig};

    fn open_store() -> (tempfile::TempDir, EventStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EventStore::open(dir.path().join("events.db")).expect("open store");
        (dir, store)
    }

    fn raw(store: &EventStore) -> Connection {
        let conn = Connection::open(store.db_path()).expect("raw connection");
        conn.pragma_update(None, "foreign_keys", "ON").expect("pragma");
        conn
    }

    fn event(title: &str, venue: Venue, date: &str, source: EventSource) -> Event {
        Event::new(title, venue, date.parse().expect("date"), source)
    }

    fn post(id: &str, posted_at: &str) -> InstagramPost {
        InstagramPost {
            instagram_post_id: id.to_string(),
            shortcode: Some(format!("sc_{id}")),
            post_url: format!("https://instagram.example/p/{id}"),
            caption: Some("Friday! Live music at the Falcon".to_string()),
            media_type: Some(MediaType::Photo),
            display_url: Some(format!("https://cdn.example/{id}.jpg")),
            image_urls: vec![format!("https://cdn.example/{id}.jpg")],
            like_count: 10,
            comment_count: 2,
            posted_at: posted_at.parse().expect("timestamp"),
            classification: None,
            classification_reason: None,
            needs_image_analysis: true,
        }
    }

    #[test]
    fn saving_twice_updates_instead_of_duplicating() {
        let (_dir, store) = open_store();
        let e = event("Jazz Night", Venue::new("The Falcon"), "2025-12-15", EventSource::Instagram);

        let first = store.save(std::slice::from_ref(&e)).expect("first save");
        assert_eq!((first.saved, first.updated), (1, 0));

        let mut changed = e;
        changed.description = Some("updated description".into());
        let second = store.save(std::slice::from_ref(&changed)).expect("second save");
        assert_eq!((second.saved, second.updated), (0, 1));

        let events = store.load().expect("load");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].description.as_deref(), Some("updated description"));
    }

    #[test]
    fn near_duplicate_venue_names_resolve_to_one_row() {
        let (_dir, store) = open_store();
        let a = event("Jazz Night", Venue::new("The Falcon Bar"), "2025-12-15", EventSource::Instagram);
        let b = event("Blues Jam", Venue::new("The Falcon Bars"), "2025-12-16", EventSource::Facebook);

        let result = store.save(&[a, b]).expect("save");
        assert_eq!(result.saved, 2);
        assert_eq!(store.count_venues().expect("count"), 1);
        assert_eq!(store.count_events().expect("count"), 2);
    }

    #[test]
    fn dissimilar_venue_names_stay_separate() {
        let (_dir, store) = open_store();
        let a = event("Jazz Night", Venue::new("The Falcon"), "2025-12-15", EventSource::Instagram);
        let b = event("Blues Jam", Venue::new("The Falcon Venue"), "2025-12-16", EventSource::Facebook);

        store.save(&[a, b]).expect("save");
        assert_eq!(store.count_venues().expect("count"), 2);
    }

    #[test]
    fn instagram_handle_match_beats_name_mismatch() {
        let (_dir, store) = open_store();
        let a = event(
            "Jazz Night",
            Venue::new("The Falcon").with_handle("@thefalconny"),
            "2025-12-15",
            EventSource::Instagram,
        );
        let b = event(
            "Blues Jam",
            Venue::new("Totally Different Name").with_handle("thefalconny"),
            "2025-12-16",
            EventSource::Instagram,
        );

        store.save(&[a, b]).expect("save");
        assert_eq!(store.count_venues().expect("count"), 1);
    }

    #[test]
    fn venue_resolution_depends_on_insertion_order() {
        // "Falcon Bar" ~ "Falcon Bars" and "Falcon Bars" ~ "Falcon Barss"
        // clear the threshold, but "Falcon Bar" ~ "Falcon Barss" does not.
        let names = ["Falcon Bar", "Falcon Bars", "Falcon Barss"];

        let (_dir, store) = open_store();
        let batch: Vec<Event> = names
            .iter()
            .map(|name| event("Jazz Night", Venue::new(*name), "2025-12-15", EventSource::Manual))
            .collect();
        store.save(&batch).expect("save");
        assert_eq!(store.count_venues().expect("count"), 2);

        let (_dir2, reordered_store) = open_store();
        let reordered: Vec<Event> = [names[1], names[0], names[2]]
            .iter()
            .map(|name| event("Jazz Night", Venue::new(*name), "2025-12-15", EventSource::Manual))
            .collect();
        reordered_store.save(&reordered).expect("save");
        assert_eq!(reordered_store.count_venues().expect("count"), 1);
    }

    #[test]
    fn every_event_field_round_trips() {
        let (_dir, store) = open_store();

        let venue = Venue {
            name: "The Falcon".to_string(),
            city: Some("Marlboro".to_string()),
            state: "NY".to_string(),
            address: Some("1348 Route 9W".to_string()),
            instagram_handle: Some("thefalconny".to_string()),
            website: Some("https://liveatthefalcon.com".to_string()),
            coordinates: Some((41.6051, -73.9787)),
        };
        let mut e = event("Jazz Night", venue, "2025-12-15", EventSource::Eventbrite);
        e.start_time = Some(NaiveTime::from_hms_opt(19, 30, 0).expect("time"));
        e.end_time = Some(NaiveTime::from_hms_opt(22, 0, 0).expect("time"));
        e.description = Some("An evening of jazz standards".to_string());
        e.short_description = Some("Jazz standards".to_string());
        e.category = EventCategory::Music;
        e.price = Some("$25".to_string());
        e.is_free = false;
        e.ticket_url = Some("https://tickets.example/jazz".to_string());
        e.event_url = Some("https://liveatthefalcon.com/jazz".to_string());
        e.image_url = Some("https://cdn.example/jazz.jpg".to_string());
        e.source_url = Some("https://eventbrite.example/jazz".to_string());
        e.source_id = Some("eb-123".to_string());
        e.confidence = 0.9;
        e.needs_review = true;
        e.review_notes = Some("double-check ticket price".to_string());
        e.scraped_at = Some("2025-12-01T12:00:00Z".parse().expect("timestamp"));

        store.save(std::slice::from_ref(&e)).expect("save");
        let loaded = store.load().expect("load");
        assert_eq!(loaded, vec![e]);
    }

    #[test]
    fn query_filters_are_conjunctive() {
        let (_dir, store) = open_store();
        let mut a = event("Jazz Night", Venue::new("The Falcon"), "2025-12-15", EventSource::Instagram);
        a.category = EventCategory::Music;
        let mut b = event("Pottery Class", Venue::new("Art Barn"), "2025-12-16", EventSource::Eventbrite);
        b.category = EventCategory::Workshop;
        let mut c = event("Holiday Market", Venue::new("Village Green"), "2025-12-20", EventSource::Facebook);
        c.category = EventCategory::Market;
        store.save(&[a, b, c]).expect("save");

        let in_range = store
            .query(&QueryFilter {
                date_from: Some("2025-12-16".parse().expect("date")),
                date_to: Some("2025-12-20".parse().expect("date")),
                ..QueryFilter::default()
            })
            .expect("query");
        assert_eq!(in_range.len(), 2);
        assert_eq!(in_range[0].title, "Pottery Class");
        assert_eq!(in_range[1].title, "Holiday Market");

        let by_source = store
            .query(&QueryFilter {
                sources: vec![EventSource::Instagram, EventSource::Facebook],
                ..QueryFilter::default()
            })
            .expect("query");
        assert_eq!(by_source.len(), 2);

        let combined = store
            .query(&QueryFilter {
                date_from: Some("2025-12-16".parse().expect("date")),
                categories: vec![EventCategory::Market],
                ..QueryFilter::default()
            })
            .expect("query");
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].title, "Holiday Market");
    }

    #[test]
    fn invalid_event_is_recorded_without_aborting_batch() {
        let (_dir, store) = open_store();
        let good = event("Jazz Night", Venue::new("The Falcon"), "2025-12-15", EventSource::Manual);
        let mut bad = event("x", Venue::new("The Falcon"), "2025-12-15", EventSource::Manual);
        bad.title = "   ".to_string();

        let result = store.save(&[bad, good]).expect("save");
        assert_eq!(result.saved, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("title"));
        assert_eq!(store.count_events().expect("count"), 1);
    }

    #[test]
    fn out_of_enum_values_violate_check_constraints() {
        let (_dir, store) = open_store();
        let conn = raw(&store);
        conn.execute(
            "INSERT INTO venues (name) VALUES ('The Falcon')",
            [],
        )
        .expect("venue insert");

        let result = conn.execute(
            "INSERT INTO events (unique_key, venue_id, title, event_date, source)
             VALUES ('abcd1234abcd1234', 1, 'Jazz Night', '2025-12-15', 'tiktok')",
            [],
        );
        assert!(matches!(result, Err(ref err) if is_constraint_violation(err)));

        let result = conn.execute(
            "INSERT INTO events (unique_key, venue_id, title, event_date, source, category)
             VALUES ('abcd1234abcd1234', 1, 'Jazz Night', '2025-12-15', 'manual', 'raves')",
            [],
        );
        assert!(matches!(result, Err(ref err) if is_constraint_violation(err)));
    }

    #[test]
    fn instagram_scrape_persists_profile_posts_and_events() {
        let (_dir, store) = open_store();
        let profile = InstagramProfile::new("ig-901", "@thefalconny");
        let mut carousel = post("post-1", "2025-12-01T15:00:00Z");
        carousel.media_type = Some(MediaType::Carousel);
        carousel.image_urls = vec![
            "https://cdn.example/a.jpg".to_string(),
            "https://cdn.example/b.jpg".to_string(),
            "https://cdn.example/c.jpg".to_string(),
        ];
        let plain = post("post-2", "2025-12-02T15:00:00Z");

        let mut events_by_post = HashMap::new();
        events_by_post.insert(
            "post-1".to_string(),
            vec![event("Jazz Night", Venue::new("The Falcon"), "2025-12-15", EventSource::Instagram)],
        );

        let result = store
            .save_instagram_scrape(&profile, &[carousel.clone(), plain], &events_by_post)
            .expect("scrape save");
        assert_eq!((result.saved, result.updated), (1, 0));
        assert!(result.errors.is_empty());

        let posts = store.get_posts_for_profile("thefalconny", false).expect("posts");
        assert_eq!(posts.len(), 2);
        let stored = &posts["post-1"];
        assert_eq!(stored.image_urls.len(), 3);
        assert_eq!(stored.image_urls[0], "https://cdn.example/a.jpg");

        let events = store.load().expect("load");
        assert_eq!(events.len(), 1);
        assert!(events[0].post_id.is_some());

        // Re-scrape with a changed carousel replaces the image list wholesale.
        carousel.image_urls = vec!["https://cdn.example/z.jpg".to_string()];
        let result = store
            .save_instagram_scrape(&profile, std::slice::from_ref(&carousel), &events_by_post)
            .expect("re-scrape");
        assert_eq!((result.saved, result.updated), (0, 1));

        let posts = store.get_posts_for_profile("thefalconny", false).expect("posts");
        assert_eq!(posts["post-1"].image_urls, vec!["https://cdn.example/z.jpg".to_string()]);
    }

    #[test]
    fn only_classified_filter_skips_unclassified_posts() {
        let (_dir, store) = open_store();
        let profile = InstagramProfile::new("ig-901", "thefalconny");
        let unclassified = post("post-1", "2025-12-01T15:00:00Z");
        let mut classified = post("post-2", "2025-12-02T15:00:00Z");
        classified.classification = Some(PostClassification::Event);
        classified.classification_reason = Some("date and venue in caption".to_string());

        store
            .save_instagram_scrape(&profile, &[unclassified, classified], &HashMap::new())
            .expect("scrape save");

        let all = store.get_posts_for_profile("thefalconny", false).expect("posts");
        assert_eq!(all.len(), 2);

        let classified_only = store.get_posts_for_profile("thefalconny", true).expect("posts");
        assert_eq!(classified_only.len(), 1);
        assert_eq!(
            classified_only["post-2"].classification,
            Some(PostClassification::Event)
        );
    }

    #[test]
    fn deleting_profile_cascades_posts_but_events_survive() {
        let (_dir, store) = open_store();
        let profile = InstagramProfile::new("ig-901", "thefalconny");
        let mut events_by_post = HashMap::new();
        events_by_post.insert(
            "post-1".to_string(),
            vec![event("Jazz Night", Venue::new("The Falcon"), "2025-12-15", EventSource::Instagram)],
        );
        store
            .save_instagram_scrape(&profile, &[post("post-1", "2025-12-01T15:00:00Z")], &events_by_post)
            .expect("scrape save");

        assert!(store.delete_profile("ig-901").expect("delete"));
        assert!(store.get_posts_for_profile("thefalconny", false).expect("posts").is_empty());

        let conn = raw(&store);
        let images: i64 = conn
            .query_row("SELECT COUNT(*) FROM post_images", [], |row| row.get(0))
            .expect("count");
        assert_eq!(images, 0);

        let events = store.load().expect("load");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].post_id, None);
    }

    #[test]
    fn deleting_post_nulls_event_reference() {
        let (_dir, store) = open_store();
        let profile = InstagramProfile::new("ig-901", "thefalconny");
        let mut events_by_post = HashMap::new();
        events_by_post.insert(
            "post-1".to_string(),
            vec![event("Jazz Night", Venue::new("The Falcon"), "2025-12-15", EventSource::Instagram)],
        );
        store
            .save_instagram_scrape(&profile, &[post("post-1", "2025-12-01T15:00:00Z")], &events_by_post)
            .expect("scrape save");

        assert!(store.delete_post("post-1").expect("delete"));
        assert!(!store.delete_post("post-1").expect("second delete"));

        let events = store.load().expect("load");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].post_id, None);
    }

    #[test]
    fn scraped_page_ledger_upserts_and_isolates_sources() {
        let (_dir, store) = open_store();
        assert!(store.get_scraped_urls_for_source("hvmag").expect("urls").is_empty());

        store
            .save_scraped_page("hvmag", "https://hvmag.example/events", 4)
            .expect("save page");
        store
            .save_scraped_page("chronogram", "https://chronogram.example/calendar", 7)
            .expect("save page");

        let urls = store.get_scraped_urls_for_source("hvmag").expect("urls");
        assert_eq!(urls.len(), 1);
        assert!(urls.contains("https://hvmag.example/events"));

        store
            .save_scraped_page("hvmag", "https://hvmag.example/events", 9)
            .expect("re-save page");
        let page = store
            .get_scraped_page("hvmag", "https://hvmag.example/events")
            .expect("get page")
            .expect("page exists");
        assert_eq!(page.events_extracted, 9);

        assert!(store
            .get_scraped_page("chronogram", "https://hvmag.example/events")
            .expect("get page")
            .is_none());
    }

    #[test]
    fn stats_aggregates_counts_and_date_range() {
        let (_dir, store) = open_store();
        let mut a = event("Jazz Night", Venue::new("The Falcon"), "2025-12-15", EventSource::Instagram);
        a.category = EventCategory::Music;
        a.needs_review = true;
        let b = event("Holiday Market", Venue::new("Village Green"), "2025-12-20", EventSource::Facebook);
        store.save(&[a, b]).expect("save");

        let stats = store.stats().expect("stats");
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.needs_review, 1);
        assert_eq!(stats.unique_venues, 2);
        assert_eq!(stats.earliest.as_deref(), Some("2025-12-15"));
        assert_eq!(stats.latest.as_deref(), Some("2025-12-20"));
        assert_eq!(stats.by_source.get("instagram"), Some(&1));
        assert_eq!(stats.by_category.get("other"), Some(&1));
    }

    #[test]
    fn rekey_updates_stale_keys_and_is_stable_after() {
        let (_dir, store) = open_store();
        let e = event("Jazz Night", Venue::new("The Falcon"), "2025-12-15", EventSource::Manual);
        store.save(std::slice::from_ref(&e)).expect("save");

        let conn = raw(&store);
        conn.execute(
            "UPDATE events SET unique_key = '0123456789abcdef'",
            [],
        )
        .expect("stale key");
        drop(conn);

        let dry = store.rekey_events(true).expect("dry run");
        assert!(dry.dry_run);
        assert_eq!((dry.unchanged, dry.updated, dry.collisions), (0, 1, 0));

        let live = store.rekey_events(false).expect("live run");
        assert_eq!((live.updated, live.collisions), (1, 0));

        // Saving the same event again now hits the recomputed key.
        let again = store.save(std::slice::from_ref(&e)).expect("re-save");
        assert_eq!((again.saved, again.updated), (0, 1));

        let second = store.rekey_events(false).expect("second run");
        assert_eq!((second.unchanged, second.updated, second.collisions), (1, 0, 0));
    }

    #[test]
    fn rekey_collision_flags_row_for_review() {
        let (_dir, store) = open_store();
        let a = event("Jazz Night", Venue::new("The Falcon"), "2025-12-15", EventSource::Manual);
        let b = event("Blues Jam", Venue::new("The Falcon"), "2025-12-15", EventSource::Manual);
        store.save(&[a, b]).expect("save");

        // Retitle the second event so its recomputed key matches the first.
        let conn = raw(&store);
        conn.execute(
            "UPDATE events SET title = 'Jazz Night!' WHERE title = 'Blues Jam'",
            [],
        )
        .expect("retitle");
        drop(conn);

        let result = store.rekey_events(false).expect("rekey");
        assert_eq!((result.unchanged, result.updated, result.collisions), (1, 0, 1));

        let flagged: Vec<Event> = store
            .load()
            .expect("load")
            .into_iter()
            .filter(|e| e.needs_review)
            .collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].title, "Jazz Night!");
        assert!(flagged[0]
            .review_notes
            .as_deref()
            .expect("notes")
            .contains("duplicate after re-key"));
    }

    #[test]
    fn opening_a_v1_database_migrates_to_current() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("events.db");

        let conn = Connection::open(&db_path).expect("raw connection");
        conn.execute_batch(
            "CREATE TABLE schema_metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             INSERT INTO schema_metadata (key, value) VALUES ('version', '1.0.0');
             CREATE TABLE venues (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL,
                 city TEXT,
                 state TEXT DEFAULT 'NY',
                 address TEXT,
                 instagram_handle TEXT,
                 website TEXT,
                 lat REAL,
                 lon REAL,
                 created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                 UNIQUE(name, city, state)
             );
             CREATE TABLE events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 unique_key TEXT UNIQUE NOT NULL,
                 venue_id INTEGER NOT NULL,
                 title TEXT NOT NULL,
                 event_date TEXT NOT NULL,
                 start_time TEXT,
                 end_time TEXT,
                 description TEXT,
                 short_description TEXT,
                 source TEXT NOT NULL,
                 category TEXT DEFAULT 'other',
                 price TEXT,
                 is_free INTEGER DEFAULT 0,
                 ticket_url TEXT,
                 event_url TEXT,
                 image_url TEXT,
                 source_url TEXT,
                 source_id TEXT,
                 confidence REAL DEFAULT 1.0,
                 needs_review INTEGER DEFAULT 0,
                 review_notes TEXT,
                 scraped_at TEXT,
                 created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                 updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                 FOREIGN KEY (venue_id) REFERENCES venues(id)
             );
             INSERT INTO venues (name) VALUES ('The Falcon');
             INSERT INTO events (unique_key, venue_id, title, event_date, source)
             VALUES ('0123456789abcdef', 1, 'Jazz Night', '2025-12-15', 'manual');",
        )
        .expect("v1 schema");
        drop(conn);

        let store = EventStore::open(&db_path).expect("open migrates");

        let conn = raw(&store);
        let version: String = conn
            .query_row(
                "SELECT value FROM schema_metadata WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .expect("version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        drop(conn);

        // Migrated rows read back, and the new post reference exists.
        let events = store.load().expect("load");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].post_id, None);

        // Re-opening is a no-op.
        let reopened = EventStore::open(&db_path).expect("reopen");
        assert_eq!(reopened.count_events().expect("count"), 1);
    }

    #[test]
    fn dedup_then_save_collapses_cross_source_batch() {
        let (_dir, store) = open_store();

        let mut insta = event("Live: Jazz Night", Venue::new("The Falcon"), "2025-12-15", EventSource::Instagram);
        insta.image_url = Some("https://insta.example/flyer.jpg".to_string());
        let fb = event("Jazz Night", Venue::new("the falcon"), "2025-12-15", EventSource::Facebook);
        let other = event("Blues Night", Venue::new("The Falcon"), "2025-12-16", EventSource::Instagram);

        let deduped = deduplicate(vec![insta, fb, other], &DedupConfig::default());
        let result = store.save(&deduped).expect("save");

        assert_eq!((result.saved, result.updated), (2, 0));
        assert_eq!(store.count_venues().expect("count"), 1);

        let events = store.load().expect("load");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].source, EventSource::Facebook);
        assert_eq!(events[0].image_url.as_deref(), Some("https://insta.example/flyer.jpg"));
    }
}
