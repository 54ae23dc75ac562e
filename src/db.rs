use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::extractor::category::Category;

pub type StoreResult<T> = Result<T, StoreError>;

/// Menu source metadata for one restaurant.
#[derive(Debug, Clone, PartialEq)]
pub struct RestaurantMenuSource {
    pub id: String,
    pub name: String,
    pub menu_url: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub content_fingerprint: Option<String>,
    pub is_open: bool,
    pub closure_reason: Option<String>,
    pub menu_section_order: Vec<String>,
}

/// Persisted dish row. `photo_url` and the vote fields belong to other writers.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogDish {
    pub id: i64,
    pub restaurant_id: String,
    pub name: String,
    pub category: String,
    pub menu_section: Option<String>,
    pub price: Option<f64>,
    pub photo_url: Option<String>,
    pub vote_count: i64,
    pub avg_rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDish {
    pub restaurant_id: String,
    pub name: String,
    pub category: Category,
    pub menu_section: Option<String>,
    pub price: Option<f64>,
}

/// Field-scoped dish update; `None` means "leave the column alone".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DishPatch {
    pub category: Option<Category>,
    pub menu_section: Option<Option<String>>,
    pub price: Option<Option<f64>>,
}

impl DishPatch {
    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.menu_section.is_none() && self.price.is_none()
    }

    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.category.is_some() {
            fields.push("category");
        }
        if self.menu_section.is_some() {
            fields.push("menu_section");
        }
        if self.price.is_some() {
            fields.push("price");
        }
        fields
    }
}

/// Catalog operations the sync pipeline depends on.
pub trait CatalogStore {
    fn restaurant(&self, id: &str) -> StoreResult<RestaurantMenuSource>;
    /// Restaurants never checked or checked before `cutoff`, oldest first.
    fn stale_restaurants(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<RestaurantMenuSource>>;
    fn dishes_for(&self, restaurant_id: &str) -> StoreResult<Vec<CatalogDish>>;
    fn insert_dish(&self, dish: &NewDish) -> StoreResult<i64>;
    fn update_dish_fields(&self, dish_id: i64, patch: &DishPatch) -> StoreResult<()>;
    /// Refresh only the checked timestamp.
    fn mark_checked(&self, restaurant_id: &str, at: DateTime<Utc>) -> StoreResult<()>;
    fn mark_closed(
        &self,
        restaurant_id: &str,
        fingerprint: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
    /// Mark the restaurant open after a sync. A `None` fingerprint clears the
    /// stored one so the next run extracts again.
    fn record_sync(
        &self,
        restaurant_id: &str,
        fingerprint: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
    fn set_section_order(&self, restaurant_id: &str, order: &[String]) -> StoreResult<()>;
}

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn connect(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Db { conn })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Db { conn })
    }

    pub fn init_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS restaurants (
                id                  TEXT PRIMARY KEY,
                name                TEXT NOT NULL,
                menu_url            TEXT,
                last_checked_at     TEXT,
                content_fingerprint TEXT,
                is_open             BOOLEAN NOT NULL DEFAULT 1,
                closure_reason      TEXT,
                menu_section_order  TEXT,
                created_at          TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_restaurants_checked ON restaurants(last_checked_at);

            CREATE TABLE IF NOT EXISTS dishes (
                id            INTEGER PRIMARY KEY,
                restaurant_id TEXT NOT NULL REFERENCES restaurants(id),
                name          TEXT NOT NULL,
                category      TEXT NOT NULL,
                menu_section  TEXT,
                price         REAL,
                photo_url     TEXT,
                vote_count    INTEGER NOT NULL DEFAULT 0,
                avg_rating    REAL,
                created_at    TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_dishes_restaurant ON dishes(restaurant_id);
            ",
        )?;
        Ok(())
    }

    /// Register a restaurant or update its name and menu url.
    pub fn upsert_restaurant(&self, id: &str, name: &str, menu_url: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO restaurants (id, name, menu_url) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, menu_url = excluded.menu_url",
            params![id, name, menu_url],
        )?;
        Ok(())
    }

    pub fn get_stats(&self, cutoff: DateTime<Utc>) -> StoreResult<Stats> {
        let restaurants: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM restaurants", [], |r| r.get(0))?;
        let stale: usize = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM restaurants WHERE {STALE_PREDICATE}"),
            params![timestamp(cutoff)],
            |r| r.get(0),
        )?;
        let closed: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM restaurants WHERE is_open = 0",
            [],
            |r| r.get(0),
        )?;
        let dishes: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM dishes", [], |r| r.get(0))?;
        Ok(Stats {
            restaurants,
            stale,
            closed,
            dishes,
        })
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

pub struct Stats {
    pub restaurants: usize,
    pub stale: usize,
    pub closed: usize,
    pub dishes: usize,
}

/// Restaurants `run` would pick up in batch mode; `?1` is the staleness cutoff.
const STALE_PREDICATE: &str = "menu_url IS NOT NULL AND menu_url != '' \
     AND (last_checked_at IS NULL OR last_checked_at < ?1)";

const RESTAURANT_COLUMNS: &str = "id, name, menu_url, last_checked_at, content_fingerprint, \
     is_open, closure_reason, menu_section_order";

fn restaurant_from_row(row: &Row<'_>) -> rusqlite::Result<(RestaurantMenuSource, Option<String>)> {
    let last_checked: Option<String> = row.get(3)?;
    let order_json: Option<String> = row.get(7)?;
    Ok((
        RestaurantMenuSource {
            id: row.get(0)?,
            name: row.get(1)?,
            menu_url: row.get(2)?,
            last_checked_at: last_checked.as_deref().and_then(parse_timestamp),
            content_fingerprint: row.get(4)?,
            is_open: row.get(5)?,
            closure_reason: row.get(6)?,
            menu_section_order: Vec::new(),
        },
        order_json,
    ))
}

fn with_section_order(
    (mut source, order_json): (RestaurantMenuSource, Option<String>),
) -> StoreResult<RestaurantMenuSource> {
    if let Some(json) = order_json {
        source.menu_section_order = serde_json::from_str(&json)?;
    }
    Ok(source)
}

impl CatalogStore for Db {
    fn restaurant(&self, id: &str) -> StoreResult<RestaurantMenuSource> {
        let sql = format!("SELECT {RESTAURANT_COLUMNS} FROM restaurants WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], restaurant_from_row)
            .optional()?
            .ok_or_else(|| StoreError::RestaurantNotFound(id.to_string()))?;
        with_section_order(row)
    }

    fn stale_restaurants(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<RestaurantMenuSource>> {
        let sql = format!(
            "SELECT {RESTAURANT_COLUMNS} FROM restaurants
             WHERE {STALE_PREDICATE}
             ORDER BY last_checked_at IS NOT NULL, last_checked_at, id
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![timestamp(cutoff), limit as i64], restaurant_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(with_section_order).collect()
    }

    fn dishes_for(&self, restaurant_id: &str) -> StoreResult<Vec<CatalogDish>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, restaurant_id, name, category, menu_section, price,
                    photo_url, vote_count, avg_rating
             FROM dishes WHERE restaurant_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![restaurant_id], |row| {
                Ok(CatalogDish {
                    id: row.get(0)?,
                    restaurant_id: row.get(1)?,
                    name: row.get(2)?,
                    category: row.get(3)?,
                    menu_section: row.get(4)?,
                    price: row.get(5)?,
                    photo_url: row.get(6)?,
                    vote_count: row.get(7)?,
                    avg_rating: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_dish(&self, dish: &NewDish) -> StoreResult<i64> {
        self.conn.execute(
            "INSERT INTO dishes (restaurant_id, name, category, menu_section, price)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                dish.restaurant_id,
                dish.name,
                dish.category.as_str(),
                dish.menu_section,
                dish.price,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_dish_fields(&self, dish_id: i64, patch: &DishPatch) -> StoreResult<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut sets = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(category) = patch.category {
            values.push(Box::new(category.as_str()));
            sets.push(format!("category = ?{}", values.len()));
        }
        if let Some(section) = &patch.menu_section {
            values.push(Box::new(section.clone()));
            sets.push(format!("menu_section = ?{}", values.len()));
        }
        if let Some(price) = patch.price {
            values.push(Box::new(price));
            sets.push(format!("price = ?{}", values.len()));
        }
        values.push(Box::new(dish_id));
        let sql = format!(
            "UPDATE dishes SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len()
        );

        let refs: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        if self.conn.execute(&sql, refs.as_slice())? == 0 {
            return Err(StoreError::DishNotFound(dish_id));
        }
        Ok(())
    }

    fn mark_checked(&self, restaurant_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE restaurants SET last_checked_at = ?2 WHERE id = ?1",
            params![restaurant_id, timestamp(at)],
        )?;
        Ok(())
    }

    fn mark_closed(
        &self,
        restaurant_id: &str,
        fingerprint: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE restaurants
             SET is_open = 0, closure_reason = ?2, content_fingerprint = ?3, last_checked_at = ?4
             WHERE id = ?1",
            params![restaurant_id, reason, fingerprint, timestamp(at)],
        )?;
        Ok(())
    }

    fn record_sync(
        &self,
        restaurant_id: &str,
        fingerprint: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE restaurants
             SET is_open = 1, closure_reason = NULL, content_fingerprint = ?2, last_checked_at = ?3
             WHERE id = ?1",
            params![restaurant_id, fingerprint, timestamp(at)],
        )?;
        Ok(())
    }

    fn set_section_order(&self, restaurant_id: &str, order: &[String]) -> StoreResult<()> {
        let json = serde_json::to_string(order)?;
        self.conn.execute(
            "UPDATE restaurants SET menu_section_order = ?2 WHERE id = ?1",
            params![restaurant_id, json],
        )?;
        Ok(())
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
