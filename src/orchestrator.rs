use std::time::Duration;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::closure::ClosureClassifier;
use crate::config::Settings;
use crate::db::{CatalogStore, RestaurantMenuSource};
use crate::error::SyncError;
use crate::extractor::MenuExtractor;
use crate::fetcher::PageSource;
use crate::fingerprint;
use crate::reconcile::{self, ReconcileOutcome};

/// Which restaurants one invocation works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Forced refresh of one restaurant regardless of staleness.
    Single(String),
    /// Up to `limit` restaurants never checked or checked before the staleness threshold.
    Stale { limit: usize },
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub selection: Selection,
    /// No new restaurant is started once this passes.
    pub deadline: Option<Instant>,
    /// Extract even when the page fingerprint is unchanged.
    pub ignore_fingerprint: bool,
}

impl RunOptions {
    pub fn new(selection: Selection) -> Self {
        RunOptions {
            selection,
            deadline: None,
            ignore_fingerprint: false,
        }
    }
}

/// Terminal state of one restaurant.
#[derive(Debug, Clone, PartialEq)]
enum ItemOutcome {
    ContentUnchanged,
    Closed { reason: String },
    NoDishes,
    Synced(ReconcileOutcome),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ItemReport {
    pub restaurant_id: String,
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unchanged: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_dishes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_errors: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closure_reason: Option<String>,
}

impl ItemReport {
    fn new(source: &RestaurantMenuSource, status: &str) -> Self {
        ItemReport {
            restaurant_id: source.id.clone(),
            name: source.name.clone(),
            status: status.to_string(),
            ..ItemReport::default()
        }
    }

    fn from_outcome(source: &RestaurantMenuSource, outcome: ItemOutcome) -> Self {
        match outcome {
            ItemOutcome::ContentUnchanged => ItemReport::new(source, "unchanged"),
            ItemOutcome::Closed { reason } => ItemReport {
                closure_reason: Some(reason),
                ..ItemReport::new(source, "closed")
            },
            ItemOutcome::NoDishes => ItemReport::new(source, "no_dishes"),
            ItemOutcome::Synced(o) => ItemReport {
                inserted: Some(o.inserted),
                updated: Some(o.updated),
                unchanged: Some(o.unchanged),
                total_dishes: Some(o.total_dishes),
                write_errors: (o.write_errors > 0).then_some(o.write_errors),
                ..ItemReport::new(source, "success")
            },
        }
    }

    pub fn is_error(&self) -> bool {
        self.status.starts_with("error:")
    }
}

/// Aggregated result returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub processed_count: usize,
    pub success_count: usize,
    pub total_inserted: usize,
    pub total_updated: usize,
    pub per_item: Vec<ItemReport>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deadline_reached: bool,
}

impl RunSummary {
    fn push(&mut self, report: ItemReport) {
        self.processed_count += 1;
        if !report.is_error() {
            self.success_count += 1;
        }
        self.total_inserted += report.inserted.unwrap_or(0);
        self.total_updated += report.updated.unwrap_or(0);
        self.per_item.push(report);
    }
}

pub struct Orchestrator<'a, S, F, X> {
    store: &'a S,
    fetcher: &'a F,
    extractor: &'a X,
    closure: ClosureClassifier,
    staleness: chrono::Duration,
    inter_item_delay: Duration,
    item_timeout: Duration,
    show_progress: bool,
}

impl<'a, S, F, X> Orchestrator<'a, S, F, X>
where
    S: CatalogStore,
    F: PageSource,
    X: MenuExtractor,
{
    pub fn new(settings: &Settings, store: &'a S, fetcher: &'a F, extractor: &'a X) -> Self {
        Orchestrator {
            store,
            fetcher,
            extractor,
            closure: ClosureClassifier::new(settings.closure_scan_chars),
            staleness: settings.staleness(),
            inter_item_delay: settings.inter_item_delay(),
            item_timeout: settings.item_timeout(),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Process the selected restaurants one after another.
    ///
    /// Only misconfiguration and failure to read the work list abort the run;
    /// every per-restaurant error ends up as an `error:` status in the summary.
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary, SyncError> {
        self.extractor.check_credentials()?;

        let sources = self.select(&options.selection)?;
        info!(count = sources.len(), selection = ?options.selection, "menu sync starting");

        let pb = if self.show_progress && sources.len() > 1 {
            let pb = ProgressBar::new(sources.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut summary = RunSummary::default();
        for (i, source) in sources.iter().enumerate() {
            if deadline_passed(options.deadline) {
                warn!(remaining = sources.len() - i, "run deadline reached, stopping");
                summary.deadline_reached = true;
                break;
            }
            if i > 0 {
                self.pace(options.deadline).await;
                if deadline_passed(options.deadline) {
                    warn!(remaining = sources.len() - i, "run deadline reached, stopping");
                    summary.deadline_reached = true;
                    break;
                }
            }

            pb.set_message(source.name.clone());
            let report = self.process_with_timeout(source, options.ignore_fingerprint).await;
            info!(
                restaurant_id = %report.restaurant_id,
                status = %report.status,
                inserted = report.inserted.unwrap_or(0),
                updated = report.updated.unwrap_or(0),
                "restaurant processed"
            );
            summary.push(report);
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!(
            processed = summary.processed_count,
            succeeded = summary.success_count,
            inserted = summary.total_inserted,
            updated = summary.total_updated,
            "menu sync finished"
        );
        Ok(summary)
    }

    fn select(&self, selection: &Selection) -> Result<Vec<RestaurantMenuSource>, SyncError> {
        let sources = match selection {
            Selection::Single(id) => vec![self.store.restaurant(id)?],
            Selection::Stale { limit } => {
                let cutoff = Utc::now() - self.staleness;
                self.store.stale_restaurants(cutoff, *limit)?
            }
        };
        Ok(sources)
    }

    async fn pace(&self, deadline: Option<Instant>) {
        let wake = Instant::now() + self.inter_item_delay;
        let wake = match deadline {
            Some(d) if d < wake => d,
            _ => wake,
        };
        tokio::time::sleep_until(wake).await;
    }

    async fn process_with_timeout(
        &self,
        source: &RestaurantMenuSource,
        ignore_fingerprint: bool,
    ) -> ItemReport {
        let result = tokio::time::timeout(
            self.item_timeout,
            self.process(source, ignore_fingerprint),
        )
        .await
        .unwrap_or(Err(SyncError::ItemTimeout(self.item_timeout)));

        match result {
            Ok(outcome) => ItemReport::from_outcome(source, outcome),
            Err(e) => {
                warn!(restaurant_id = %source.id, error = %e, "restaurant failed");
                ItemReport::new(source, &e.status())
            }
        }
    }

    /// Fetching -> (ContentUnchanged | Closed | Extracting) -> Reconciling -> Done.
    async fn process(
        &self,
        source: &RestaurantMenuSource,
        ignore_fingerprint: bool,
    ) -> Result<ItemOutcome, SyncError> {
        let id = source.id.as_str();
        let url = source
            .menu_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| SyncError::NoMenuUrl(source.id.clone()))?;

        debug!(restaurant_id = id, url, "fetching");
        let text = self.fetcher.fetch(url).await?;
        let fp = fingerprint::fingerprint(&text);

        if !ignore_fingerprint && fingerprint::is_unchanged(source.content_fingerprint.as_deref(), &fp) {
            debug!(restaurant_id = id, fingerprint = %fp, "content unchanged");
            self.store.mark_checked(id, Utc::now())?;
            return Ok(ItemOutcome::ContentUnchanged);
        }

        if let Some(signal) = self.closure.classify(&text) {
            info!(restaurant_id = id, phrase = %signal.phrase, "closure detected");
            self.store.mark_closed(id, &fp, &signal.phrase, Utc::now())?;
            return Ok(ItemOutcome::Closed {
                reason: signal.phrase,
            });
        }

        debug!(restaurant_id = id, chars = text.len(), "extracting");
        let menu = self.extractor.extract(&source.name, &text).await?;
        if menu.dishes.is_empty() {
            warn!(restaurant_id = id, "extraction found no dishes");
            self.store.mark_checked(id, Utc::now())?;
            return Ok(ItemOutcome::NoDishes);
        }

        debug!(restaurant_id = id, dishes = menu.dishes.len(), "reconciling");
        let existing = self.store.dishes_for(id)?;
        let plan = reconcile::plan(id, &existing, &menu);
        let outcome = reconcile::apply(self.store, &plan);

        // Skipped writes must be retried, so the page cannot count as seen yet.
        let seen = (outcome.write_errors == 0).then_some(fp.as_str());
        if seen.is_none() {
            warn!(
                restaurant_id = id,
                write_errors = outcome.write_errors,
                "dish writes failed, fingerprint not stored"
            );
        }
        self.store.record_sync(id, seen, Utc::now())?;
        Ok(ItemOutcome::Synced(outcome))
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use chrono::DateTime;

    use super::*;
    use crate::db::{CatalogDish, Db, DishPatch, NewDish, StoreResult};
    use crate::error::{ExtractionError, FetchError, StoreError};
    use crate::extractor::category::Category;
    use crate::extractor::{ExtractedDish, ExtractedMenu};

    struct FakeSource {
        pages: RefCell<HashMap<String, Result<String, u16>>>,
        slow: Vec<String>,
        calls: Cell<usize>,
    }

    impl FakeSource {
        fn new(pages: &[(&str, &str)]) -> Self {
            FakeSource {
                pages: RefCell::new(
                    pages
                        .iter()
                        .map(|(u, t)| (u.to_string(), Ok(t.to_string())))
                        .collect(),
                ),
                slow: Vec::new(),
                calls: Cell::new(0),
            }
        }

        fn set(&self, url: &str, text: &str) {
            self.pages
                .borrow_mut()
                .insert(url.to_string(), Ok(text.to_string()));
        }

        fn fail(&self, url: &str, status: u16) {
            self.pages.borrow_mut().insert(url.to_string(), Err(status));
        }
    }

    impl PageSource for FakeSource {
        async fn fetch(&self, url: &str) -> Result<String, FetchError> {
            self.calls.set(self.calls.get() + 1);
            if self.slow.iter().any(|u| u == url) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            match self.pages.borrow().get(url) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(status)) => Err(FetchError::Status(*status)),
                None => Err(FetchError::Status(404)),
            }
        }
    }

    struct FakeExtractor {
        menus: RefCell<HashMap<String, Result<ExtractedMenu, String>>>,
        calls: Cell<usize>,
        has_key: bool,
    }

    impl FakeExtractor {
        fn new() -> Self {
            FakeExtractor {
                menus: RefCell::new(HashMap::new()),
                calls: Cell::new(0),
                has_key: true,
            }
        }

        fn set(&self, restaurant: &str, dishes: Vec<ExtractedDish>) {
            self.menus.borrow_mut().insert(
                restaurant.to_string(),
                Ok(ExtractedMenu {
                    dishes,
                    menu_section_order: Vec::new(),
                }),
            );
        }

        fn malformed(&self, restaurant: &str) {
            self.menus
                .borrow_mut()
                .insert(restaurant.to_string(), Err("expected value at line 1".into()));
        }
    }

    impl MenuExtractor for FakeExtractor {
        fn check_credentials(&self) -> Result<(), ExtractionError> {
            if self.has_key {
                Ok(())
            } else {
                Err(ExtractionError::MissingCredentials)
            }
        }

        async fn extract(&self, name: &str, _text: &str) -> Result<ExtractedMenu, ExtractionError> {
            self.calls.set(self.calls.get() + 1);
            match self.menus.borrow().get(name) {
                Some(Ok(menu)) => Ok(menu.clone()),
                Some(Err(msg)) => Err(ExtractionError::Malformed(msg.clone())),
                None => Ok(ExtractedMenu::default()),
            }
        }
    }

    /// Counts dish writes and can reject inserts of one dish name.
    struct CountingStore {
        inner: Db,
        dish_writes: Cell<usize>,
        reject_insert: RefCell<Option<String>>,
    }

    impl CountingStore {
        fn new(inner: Db) -> Self {
            CountingStore {
                inner,
                dish_writes: Cell::new(0),
                reject_insert: RefCell::new(None),
            }
        }
    }

    impl CatalogStore for CountingStore {
        fn restaurant(&self, id: &str) -> StoreResult<RestaurantMenuSource> {
            self.inner.restaurant(id)
        }
        fn stale_restaurants(
            &self,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> StoreResult<Vec<RestaurantMenuSource>> {
            self.inner.stale_restaurants(cutoff, limit)
        }
        fn dishes_for(&self, restaurant_id: &str) -> StoreResult<Vec<CatalogDish>> {
            self.inner.dishes_for(restaurant_id)
        }
        fn insert_dish(&self, dish: &NewDish) -> StoreResult<i64> {
            self.dish_writes.set(self.dish_writes.get() + 1);
            if self.reject_insert.borrow().as_deref() == Some(dish.name.as_str()) {
                return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
            }
            self.inner.insert_dish(dish)
        }
        fn update_dish_fields(&self, dish_id: i64, patch: &DishPatch) -> StoreResult<()> {
            self.dish_writes.set(self.dish_writes.get() + 1);
            self.inner.update_dish_fields(dish_id, patch)
        }
        fn mark_checked(&self, restaurant_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
            self.inner.mark_checked(restaurant_id, at)
        }
        fn mark_closed(
            &self,
            restaurant_id: &str,
            fingerprint: &str,
            reason: &str,
            at: DateTime<Utc>,
        ) -> StoreResult<()> {
            self.inner.mark_closed(restaurant_id, fingerprint, reason, at)
        }
        fn record_sync(
            &self,
            restaurant_id: &str,
            fingerprint: Option<&str>,
            at: DateTime<Utc>,
        ) -> StoreResult<()> {
            self.inner.record_sync(restaurant_id, fingerprint, at)
        }
        fn set_section_order(&self, restaurant_id: &str, order: &[String]) -> StoreResult<()> {
            self.inner.set_section_order(restaurant_id, order)
        }
    }

    fn settings() -> Settings {
        Settings {
            inter_item_delay_ms: 0,
            ..Settings::default()
        }
    }

    fn store(restaurants: &[(&str, &str, &str)]) -> CountingStore {
        let db = Db::open_in_memory().unwrap();
        db.init_schema().unwrap();
        for (id, name, url) in restaurants {
            db.upsert_restaurant(id, name, url).unwrap();
        }
        CountingStore::new(db)
    }

    fn dish(name: &str, category: Category, section: Option<&str>, price: f64) -> ExtractedDish {
        ExtractedDish {
            name: name.into(),
            category,
            menu_section: section.map(str::to_string),
            price: Some(price),
        }
    }

    fn single(id: &str) -> RunOptions {
        RunOptions::new(Selection::Single(id.into()))
    }

    /// Cheese Pizza is extracted with the same (empty) section as the stored row,
    /// so it stays unchanged; `section_change_updates_only_section` covers a differing section.
    #[tokio::test]
    async fn end_to_end_matching_section() {
        let store = store(&[("r", "Tony's", "https://tonys.example/menu")]);
        store
            .inner
            .insert_dish(&NewDish {
                restaurant_id: "r".into(),
                name: "Cheese Pizza".into(),
                category: Category::Pizza,
                menu_section: None,
                price: Some(12.0),
            })
            .unwrap();
        let source = FakeSource::new(&[("https://tonys.example/menu", "Cheese Pizza $12\nPepperoni Pizza $14")]);
        let extractor = FakeExtractor::new();
        extractor.set(
            "Tony's",
            vec![
                dish("Cheese Pizza", Category::Pizza, None, 12.0),
                dish("Pepperoni Pizza", Category::Pizza, Some("Pizza"), 14.0),
            ],
        );

        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);
        let summary = orch.run(&single("r")).await.unwrap();

        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.total_inserted, 1);
        let item = &summary.per_item[0];
        assert_eq!(item.status, "success");
        assert_eq!(item.inserted, Some(1));
        assert_eq!(item.unchanged, Some(1));
        assert_eq!(item.updated, Some(0));
        assert_eq!(item.total_dishes, Some(2));

        let r = store.restaurant("r").unwrap();
        assert_eq!(
            r.content_fingerprint.as_deref(),
            Some(fingerprint::fingerprint("Cheese Pizza $12\nPepperoni Pizza $14").as_str())
        );
        assert!(r.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn section_change_updates_only_section() {
        let store = store(&[("r", "Tony's", "https://tonys.example/menu")]);
        store
            .inner
            .insert_dish(&NewDish {
                restaurant_id: "r".into(),
                name: "Cheese Pizza".into(),
                category: Category::Pizza,
                menu_section: None,
                price: Some(12.0),
            })
            .unwrap();
        let source = FakeSource::new(&[("https://tonys.example/menu", "menu")]);
        let extractor = FakeExtractor::new();
        extractor.set("Tony's", vec![dish("Cheese Pizza", Category::Pizza, Some("Pizza"), 12.0)]);

        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);
        let summary = orch.run(&single("r")).await.unwrap();
        assert_eq!(summary.per_item[0].updated, Some(1));
        assert_eq!(
            store.dishes_for("r").unwrap()[0].menu_section.as_deref(),
            Some("Pizza")
        );
    }

    #[tokio::test]
    async fn second_run_on_unchanged_page_skips_extraction() {
        let store = store(&[("r", "Tony's", "https://tonys.example/menu")]);
        let source = FakeSource::new(&[("https://tonys.example/menu", "Cheese Pizza $12")]);
        let extractor = FakeExtractor::new();
        extractor.set("Tony's", vec![dish("Cheese Pizza", Category::Pizza, None, 12.0)]);
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);

        orch.run(&single("r")).await.unwrap();
        let before = store.dishes_for("r").unwrap();
        let writes = store.dish_writes.get();

        let summary = orch.run(&single("r")).await.unwrap();
        assert_eq!(summary.per_item[0].status, "unchanged");
        assert_eq!(extractor.calls.get(), 1);
        assert_eq!(store.dish_writes.get(), writes);
        assert_eq!(store.dishes_for("r").unwrap(), before);
    }

    #[tokio::test]
    async fn ignore_fingerprint_forces_extraction() {
        let store = store(&[("r", "Tony's", "https://tonys.example/menu")]);
        let source = FakeSource::new(&[("https://tonys.example/menu", "Cheese Pizza $12")]);
        let extractor = FakeExtractor::new();
        extractor.set("Tony's", vec![dish("Cheese Pizza", Category::Pizza, None, 12.0)]);
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);

        orch.run(&single("r")).await.unwrap();
        let mut forced = single("r");
        forced.ignore_fingerprint = true;
        let summary = orch.run(&forced).await.unwrap();
        assert_eq!(summary.per_item[0].status, "success");
        assert_eq!(summary.per_item[0].unchanged, Some(1));
        assert_eq!(extractor.calls.get(), 2);
    }

    #[tokio::test]
    async fn closure_short_circuits_extraction() {
        let store = store(&[("r", "Shack", "https://shack.example")]);
        let source = FakeSource::new(&[("https://shack.example", "Thanks for a great summer! We are closed for the season.")]);
        let extractor = FakeExtractor::new();
        extractor.set("Shack", vec![dish("Lobster Roll", Category::LobsterRoll, None, 28.0)]);
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);

        let summary = orch.run(&single("r")).await.unwrap();
        let item = &summary.per_item[0];
        assert_eq!(item.status, "closed");
        assert_eq!(item.closure_reason.as_deref(), Some("closed for the season"));
        assert_eq!(extractor.calls.get(), 0);
        assert_eq!(store.dish_writes.get(), 0);
        assert!(!store.restaurant("r").unwrap().is_open);
    }

    #[tokio::test]
    async fn reopening_marks_open_again() {
        let store = store(&[("r", "Shack", "https://shack.example")]);
        let source = FakeSource::new(&[("https://shack.example", "Closed for the season")]);
        let extractor = FakeExtractor::new();
        extractor.set("Shack", vec![dish("Lobster Roll", Category::LobsterRoll, None, 28.0)]);
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);

        orch.run(&single("r")).await.unwrap();
        source.set("https://shack.example", "Lobster Roll $28");
        let summary = orch.run(&single("r")).await.unwrap();
        assert_eq!(summary.per_item[0].status, "success");
        let r = store.restaurant("r").unwrap();
        assert!(r.is_open);
        assert!(r.closure_reason.is_none());
    }

    #[tokio::test]
    async fn unknown_category_persisted_as_default() {
        use crate::extractor::validate::{validate, UntrustedExtraction};

        let store = store(&[("r", "Taqueria", "https://taq.example")]);
        let source = FakeSource::new(&[("https://taq.example", "Carne Asada Burrito $11")]);
        let extractor = FakeExtractor::new();
        let raw: UntrustedExtraction = serde_json::from_value(serde_json::json!({
            "dishes": [{ "name": "Carne Asada Burrito", "category": "burrito", "menu_section": null, "price": 11 }]
        }))
        .unwrap();
        let (menu, _) = validate(raw, settings().default_category());
        extractor.set("Taqueria", menu.dishes);

        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);
        orch.run(&single("r")).await.unwrap();
        let dishes = store.dishes_for("r").unwrap();
        assert_eq!(dishes.len(), 1);
        assert_eq!(dishes[0].category, "entree");
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let store = store(&[
            ("r1", "One", "https://one.example"),
            ("r2", "Two", "https://two.example"),
            ("r3", "Three", "https://three.example"),
        ]);
        let mut source = FakeSource::new(&[
            ("https://one.example", "Burger $10"),
            ("https://two.example", "Fries $4"),
            ("https://three.example", "Shake $6"),
        ]);
        source.slow.push("https://two.example".into());
        let extractor = FakeExtractor::new();
        extractor.set("One", vec![dish("Burger", Category::Burger, None, 10.0)]);
        extractor.set("Two", vec![dish("Fries", Category::Fries, None, 4.0)]);
        extractor.set("Three", vec![dish("Shake", Category::Smoothie, None, 6.0)]);

        let s = Settings {
            item_timeout_secs: 1,
            ..settings()
        };
        let orch = Orchestrator::new(&s, &store, &source, &extractor);
        let summary = orch
            .run(&RunOptions::new(Selection::Stale { limit: 10 }))
            .await
            .unwrap();

        let statuses: Vec<(&str, &str)> = summary
            .per_item
            .iter()
            .map(|r| (r.restaurant_id.as_str(), r.status.as_str()))
            .collect();
        assert_eq!(statuses[0], ("r1", "success"));
        assert_eq!(statuses[1].0, "r2");
        assert!(statuses[1].1.starts_with("error:"));
        assert_eq!(statuses[2], ("r3", "success"));
        assert_eq!(summary.processed_count, 3);
        assert_eq!(summary.success_count, 2);
        assert_eq!(store.dishes_for("r3").unwrap().len(), 1);
        assert!(store.restaurant("r2").unwrap().last_checked_at.is_none());
    }

    #[tokio::test]
    async fn fetch_error_status_in_summary() {
        let store = store(&[("r", "Tony's", "https://tonys.example")]);
        let source = FakeSource::new(&[]);
        source.fail("https://tonys.example", 503);
        let extractor = FakeExtractor::new();
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);

        let summary = orch.run(&single("r")).await.unwrap();
        assert_eq!(summary.per_item[0].status, "error: fetch returned HTTP 503");
        assert_eq!(summary.success_count, 0);
    }

    #[tokio::test]
    async fn malformed_extraction_fails_item_without_writes() {
        let store = store(&[("r", "Tony's", "https://tonys.example")]);
        let source = FakeSource::new(&[("https://tonys.example", "menu")]);
        let extractor = FakeExtractor::new();
        extractor.malformed("Tony's");
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);

        let summary = orch.run(&single("r")).await.unwrap();
        assert!(summary.per_item[0].status.starts_with("error: extraction response malformed"));
        assert_eq!(store.dish_writes.get(), 0);
        assert!(store.restaurant("r").unwrap().content_fingerprint.is_none());
    }

    #[tokio::test]
    async fn empty_extraction_is_not_destructive() {
        let store = store(&[("r", "Tony's", "https://tonys.example")]);
        store
            .inner
            .insert_dish(&NewDish {
                restaurant_id: "r".into(),
                name: "Cheese Pizza".into(),
                category: Category::Pizza,
                menu_section: None,
                price: Some(12.0),
            })
            .unwrap();
        let source = FakeSource::new(&[("https://tonys.example", "menu")]);
        let extractor = FakeExtractor::new();
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);

        let summary = orch.run(&single("r")).await.unwrap();
        assert_eq!(summary.per_item[0].status, "no_dishes");
        assert_eq!(store.dishes_for("r").unwrap().len(), 1);
        let r = store.restaurant("r").unwrap();
        assert!(r.last_checked_at.is_some());
        assert!(r.content_fingerprint.is_none());
    }

    #[tokio::test]
    async fn store_write_error_skips_only_that_dish() {
        let store = store(&[("r", "Tony's", "https://tonys.example")]);
        *store.reject_insert.borrow_mut() = Some("Calzone".into());
        let source = FakeSource::new(&[("https://tonys.example", "menu")]);
        let extractor = FakeExtractor::new();
        extractor.set(
            "Tony's",
            vec![
                dish("Calzone", Category::Pizza, None, 13.0),
                dish("Cheese Pizza", Category::Pizza, None, 12.0),
            ],
        );
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);

        let summary = orch.run(&single("r")).await.unwrap();
        let item = &summary.per_item[0];
        assert_eq!(item.status, "success");
        assert_eq!(item.inserted, Some(1));
        assert_eq!(item.write_errors, Some(1));
        assert_eq!(store.dishes_for("r").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_dish_write_is_retried_on_same_page() {
        let store = store(&[("r", "Tony's", "https://tonys.example")]);
        *store.reject_insert.borrow_mut() = Some("Calzone".into());
        let source = FakeSource::new(&[("https://tonys.example", "menu")]);
        let extractor = FakeExtractor::new();
        extractor.set(
            "Tony's",
            vec![
                dish("Calzone", Category::Pizza, None, 13.0),
                dish("Cheese Pizza", Category::Pizza, None, 12.0),
            ],
        );
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);

        orch.run(&single("r")).await.unwrap();
        let r = store.restaurant("r").unwrap();
        assert!(r.content_fingerprint.is_none());
        assert!(r.last_checked_at.is_some());

        *store.reject_insert.borrow_mut() = None;
        let summary = orch.run(&single("r")).await.unwrap();
        let item = &summary.per_item[0];
        assert_eq!(item.status, "success");
        assert_eq!(item.inserted, Some(1));
        assert_eq!(item.unchanged, Some(1));
        assert_eq!(item.write_errors, None);
        assert_eq!(extractor.calls.get(), 2);

        let names: Vec<String> = store.dishes_for("r").unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["Cheese Pizza", "Calzone"]);
        assert_eq!(
            store.restaurant("r").unwrap().content_fingerprint.as_deref(),
            Some(fingerprint::fingerprint("menu").as_str())
        );
    }

    #[tokio::test]
    async fn dish_ids_never_disappear() {
        let store = store(&[("r", "Tony's", "https://tonys.example")]);
        let source = FakeSource::new(&[("https://tonys.example", "v1")]);
        let extractor = FakeExtractor::new();
        extractor.set(
            "Tony's",
            vec![
                dish("Cheese Pizza", Category::Pizza, None, 12.0),
                dish("Summer Salad", Category::Salad, None, 9.0),
            ],
        );
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);
        orch.run(&single("r")).await.unwrap();
        let ids_v1: Vec<i64> = store.dishes_for("r").unwrap().iter().map(|d| d.id).collect();

        source.set("https://tonys.example", "v2");
        extractor.set("Tony's", vec![dish("Cheese Pizza", Category::Pizza, None, 13.0)]);
        orch.run(&single("r")).await.unwrap();
        let ids_v2: Vec<i64> = store.dishes_for("r").unwrap().iter().map(|d| d.id).collect();

        assert!(ids_v1.iter().all(|id| ids_v2.contains(id)));
        assert_eq!(ids_v2.len(), 2);
    }

    #[tokio::test]
    async fn missing_credentials_abort_before_any_item() {
        let store = store(&[("r", "Tony's", "https://tonys.example")]);
        let source = FakeSource::new(&[("https://tonys.example", "menu")]);
        let mut extractor = FakeExtractor::new();
        extractor.has_key = false;
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);

        let err = orch.run(&single("r")).await.unwrap_err();
        assert!(matches!(err, SyncError::Extraction(ExtractionError::MissingCredentials)));
        assert_eq!(source.calls.get(), 0);
    }

    #[tokio::test]
    async fn expired_deadline_starts_nothing() {
        let store = store(&[("r1", "One", "https://one.example"), ("r2", "Two", "https://two.example")]);
        let source = FakeSource::new(&[("https://one.example", "a"), ("https://two.example", "b")]);
        let extractor = FakeExtractor::new();
        let orch = Orchestrator::new(&settings(), &store, &source, &extractor);

        let mut options = RunOptions::new(Selection::Stale { limit: 10 });
        options.deadline = Some(Instant::now());
        let summary = orch.run(&options).await.unwrap();
        assert_eq!(summary.processed_count, 0);
        assert!(summary.deadline_reached);
        assert_eq!(source.calls.get(), 0);
    }

    #[tokio::test]
    async fn deadline_during_pacing_stops_batch() {
        let store = store(&[("r1", "One", "https://one.example"), ("r2", "Two", "https://two.example")]);
        let source = FakeSource::new(&[("https://one.example", "a"), ("https://two.example", "b")]);
        let extractor = FakeExtractor::new();
        let s = Settings {
            inter_item_delay_ms: 10_000,
            ..settings()
        };
        let orch = Orchestrator::new(&s, &store, &source, &extractor);

        let mut options = RunOptions::new(Selection::Stale { limit: 10 });
        options.deadline = Some(Instant::now() + Duration::from_millis(200));
        let summary = orch.run(&options).await.unwrap();
        assert_eq!(summary.processed_count, 1);
        assert!(summary.deadline_reached);
        assert_eq!(source.calls.get(), 1);
    }

    #[test]
    fn summary_serializes_contract_fields() {
        let mut summary = RunSummary::default();
        summary.push(ItemReport {
            restaurant_id: "r".into(),
            name: "Tony's".into(),
            status: "success".into(),
            inserted: Some(1),
            updated: Some(0),
            unchanged: Some(1),
            total_dishes: Some(2),
            ..ItemReport::default()
        });
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["processed_count"], 1);
        assert_eq!(json["success_count"], 1);
        assert_eq!(json["total_inserted"], 1);
        assert_eq!(json["per_item"][0]["total_dishes"], 2);
        assert!(json["per_item"][0].get("closure_reason").is_none());
        assert!(json.get("deadline_reached").is_none());
    }
}
