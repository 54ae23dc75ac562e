use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};

use menu_sync::config::Settings;
use menu_sync::db::{CatalogStore, Db};
use menu_sync::extractor::LlmExtractor;
use menu_sync::fetcher::HttpFetcher;
use menu_sync::orchestrator::{Orchestrator, RunOptions, Selection};

#[derive(Parser)]
#[command(name = "menu_sync", about = "Keep restaurant dish catalogs in sync with their menu pages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the catalog schema
    Init,
    /// Register a restaurant (or update its name and menu url)
    AddRestaurant {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        /// Restaurant id (default: slug of the name)
        #[arg(long)]
        id: Option<String>,
    },
    /// Sync one restaurant, or a batch of stale ones
    Run {
        /// Force a refresh of this restaurant regardless of staleness
        #[arg(long)]
        restaurant_id: Option<String>,
        /// Max restaurants in a batch (default: batch_limit setting)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Stop starting new restaurants after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
        /// Extract even if the page content is unchanged
        #[arg(long)]
        force: bool,
    },
    /// List a restaurant's dishes
    Dishes {
        #[arg(long)]
        restaurant_id: String,
    },
    /// Show catalog statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load().context("loading settings")?;

    let result = match cli.command {
        Commands::Init => {
            let db = Db::connect(&settings.db_path)?;
            db.init_schema()?;
            println!("Schema ready at {}", settings.db_path);
            Ok(())
        }
        Commands::AddRestaurant { name, url, id } => {
            let db = Db::connect(&settings.db_path)?;
            db.init_schema()?;
            let id = id.unwrap_or_else(|| slugify(&name));
            anyhow::ensure!(!id.is_empty(), "cannot derive an id from name {:?}", name);
            db.upsert_restaurant(&id, &name, &url)?;
            println!("Saved restaurant {} ({})", id, url);
            Ok(())
        }
        Commands::Run {
            restaurant_id,
            limit,
            deadline_secs,
            force,
        } => {
            let db = Db::connect(&settings.db_path)?;
            db.init_schema()?;
            let fetcher = HttpFetcher::new(&settings)?;
            let extractor = LlmExtractor::new(&settings)?;

            let selection = match restaurant_id {
                Some(id) => Selection::Single(id),
                None => Selection::Stale {
                    limit: limit.unwrap_or(settings.batch_limit),
                },
            };
            let options = RunOptions {
                selection,
                deadline: deadline_secs
                    .map(|s| tokio::time::Instant::now() + Duration::from_secs(s)),
                ignore_fingerprint: force,
            };

            let summary = Orchestrator::new(&settings, &db, &fetcher, &extractor)
                .with_progress(true)
                .run(&options)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Dishes { restaurant_id } => {
            let db = Db::connect(&settings.db_path)?;
            db.init_schema()?;
            let restaurant = db.restaurant(&restaurant_id)?;
            let dishes = db.dishes_for(&restaurant_id)?;
            if dishes.is_empty() {
                println!("No dishes for {}. Run 'run --restaurant-id {}' first.", restaurant.name, restaurant_id);
                return Ok(());
            }

            println!(
                "{:>5} | {:<32} | {:<12} | {:<20} | {:>7} | {:>5}",
                "id", "Dish", "Category", "Section", "Price", "Votes"
            );
            println!("{}", "-".repeat(96));
            for d in &dishes {
                let price = d.price.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".into());
                let section = d.menu_section.as_deref().unwrap_or("-");
                println!(
                    "{:>5} | {:<32} | {:<12} | {:<20} | {:>7} | {:>5}",
                    d.id,
                    truncate(&d.name, 32),
                    d.category,
                    truncate(section, 20),
                    price,
                    d.vote_count
                );
            }

            let state = match (&restaurant.is_open, &restaurant.closure_reason) {
                (false, Some(reason)) => format!("closed ({})", reason),
                (false, None) => "closed".to_string(),
                _ => "open".to_string(),
            };
            println!("\n{} dishes | {} | {}", dishes.len(), restaurant.name, state);
            if !restaurant.menu_section_order.is_empty() {
                println!("Sections: {}", restaurant.menu_section_order.join(" > "));
            }
            Ok(())
        }
        Commands::Stats => {
            let db = Db::connect(&settings.db_path)?;
            db.init_schema()?;
            let s = db.get_stats(Utc::now() - settings.staleness())?;
            println!("Restaurants: {}", s.restaurants);
            println!("Stale:       {}", s.stale);
            println!("Closed:      {}", s.closed);
            println!("Dishes:      {}", s.dishes);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        eprintln!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() && c != '\'' {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
