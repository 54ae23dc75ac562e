use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::db::{CatalogDish, CatalogStore, DishPatch, NewDish};
use crate::extractor::{ExtractedDish, ExtractedMenu};

/// Prices closer than half a cent are equal.
const PRICE_EPSILON: f64 = 0.005;

#[derive(Debug, Clone, PartialEq)]
pub enum DishChange {
    Insert(NewDish),
    Update {
        dish_id: i64,
        name: String,
        patch: DishPatch,
    },
    Unchanged {
        dish_id: i64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub restaurant_id: String,
    pub changes: Vec<DishChange>,
    pub section_order: Option<Vec<String>>,
    /// Catalog rows before applying; none of them is ever removed.
    pub existing_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub write_errors: usize,
    pub total_dishes: usize,
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Diff extracted dishes against the current catalog. Rows with no extracted
/// counterpart produce no change.
pub fn plan(restaurant_id: &str, existing: &[CatalogDish], menu: &ExtractedMenu) -> ReconcilePlan {
    let mut index: HashMap<String, &CatalogDish> = HashMap::with_capacity(existing.len());
    for dish in existing {
        index.entry(name_key(&dish.name)).or_insert(dish);
    }

    let mut planned: HashSet<String> = HashSet::new();
    let mut changes = Vec::with_capacity(menu.dishes.len());

    for extracted in &menu.dishes {
        let key = name_key(&extracted.name);
        if !planned.insert(key.clone()) {
            continue;
        }
        let change = match index.get(&key) {
            None => DishChange::Insert(NewDish {
                restaurant_id: restaurant_id.to_string(),
                name: extracted.name.clone(),
                category: extracted.category,
                menu_section: extracted.menu_section.clone(),
                price: extracted.price,
            }),
            Some(current) => {
                let patch = diff_fields(current, extracted);
                if patch.is_empty() {
                    DishChange::Unchanged { dish_id: current.id }
                } else {
                    DishChange::Update {
                        dish_id: current.id,
                        name: current.name.clone(),
                        patch,
                    }
                }
            }
        };
        changes.push(change);
    }

    ReconcilePlan {
        restaurant_id: restaurant_id.to_string(),
        changes,
        section_order: (!menu.menu_section_order.is_empty())
            .then(|| menu.menu_section_order.clone()),
        existing_count: existing.len(),
    }
}

/// Only the differing pipeline-owned fields.
fn diff_fields(current: &CatalogDish, extracted: &ExtractedDish) -> DishPatch {
    let mut patch = DishPatch::default();
    if current.category != extracted.category.as_str() {
        patch.category = Some(extracted.category);
    }
    if current.menu_section != extracted.menu_section {
        patch.menu_section = Some(extracted.menu_section.clone());
    }
    if !same_price(current.price, extracted.price) {
        patch.price = Some(extracted.price);
    }
    patch
}

fn same_price(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => (x - y).abs() < PRICE_EPSILON,
        _ => false,
    }
}

/// Execute a plan. A failed write is counted and skipped; the rest still run.
pub fn apply<S: CatalogStore>(store: &S, plan: &ReconcilePlan) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    for change in &plan.changes {
        match change {
            DishChange::Insert(dish) => match store.insert_dish(dish) {
                Ok(id) => {
                    debug!(dish_id = id, name = %dish.name, "dish inserted");
                    outcome.inserted += 1;
                }
                Err(e) => {
                    warn!(restaurant_id = %plan.restaurant_id, name = %dish.name, error = %e, "dish insert failed");
                    outcome.write_errors += 1;
                }
            },
            DishChange::Update {
                dish_id,
                name,
                patch,
            } => match store.update_dish_fields(*dish_id, patch) {
                Ok(()) => {
                    debug!(dish_id, name = %name, fields = ?patch.fields(), "dish updated");
                    outcome.updated += 1;
                }
                Err(e) => {
                    warn!(restaurant_id = %plan.restaurant_id, dish_id, error = %e, "dish update failed");
                    outcome.write_errors += 1;
                }
            },
            DishChange::Unchanged { .. } => outcome.unchanged += 1,
        }
    }

    if let Some(order) = &plan.section_order {
        if let Err(e) = store.set_section_order(&plan.restaurant_id, order) {
            warn!(restaurant_id = %plan.restaurant_id, error = %e, "section order update failed");
            outcome.write_errors += 1;
        }
    }

    outcome.total_dishes = plan.existing_count + outcome.inserted;
    outcome
}
