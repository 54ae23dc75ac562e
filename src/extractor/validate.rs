use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::category::Category;
use super::{ExtractedDish, ExtractedMenu};
use crate::error::ExtractionError;

/// Raw extraction capability output; nothing here is trusted.
#[derive(Debug, Default, Deserialize)]
pub struct UntrustedExtraction {
    #[serde(default)]
    pub dishes: Vec<Value>,
    #[serde(default)]
    pub menu_section_order: Vec<Value>,
}

/// What validation repaired or dropped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub dropped_unnamed: usize,
    pub coerced_categories: usize,
    pub duplicates: usize,
}

/// Parse the capability's message content, tolerating markdown code fences.
pub fn parse_untrusted(content: &str) -> Result<UntrustedExtraction, ExtractionError> {
    let body = strip_code_fence(content.trim());
    serde_json::from_str(body).map_err(|e| ExtractionError::Malformed(e.to_string()))
}

/// Map the untrusted shape into strict dishes.
pub fn validate(raw: UntrustedExtraction, default_category: Category) -> (ExtractedMenu, ValidationReport) {
    let mut report = ValidationReport::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut dishes = Vec::with_capacity(raw.dishes.len());

    for item in &raw.dishes {
        let Some(name) = string_field(item, "name") else {
            report.dropped_unnamed += 1;
            continue;
        };
        if !seen.insert(name.to_lowercase()) {
            report.duplicates += 1;
            continue;
        }

        let raw_category = string_field(item, "category").unwrap_or_default();
        let category = match Category::parse(&raw_category) {
            Some(c) => c,
            None => {
                debug!(dish = %name, category = %raw_category, default = %default_category, "coercing category");
                report.coerced_categories += 1;
                default_category
            }
        };

        dishes.push(ExtractedDish {
            name,
            category,
            menu_section: string_field(item, "menu_section"),
            price: item.get("price").and_then(parse_price),
        });
    }

    let mut section_seen = HashSet::new();
    let menu_section_order = raw
        .menu_section_order
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && section_seen.insert(s.to_lowercase()))
        .collect();

    if report.dropped_unnamed > 0 || report.coerced_categories > 0 {
        warn!(
            dropped_unnamed = report.dropped_unnamed,
            coerced = report.coerced_categories,
            duplicates = report.duplicates,
            "extraction output repaired"
        );
    }

    (
        ExtractedMenu {
            dishes,
            menu_section_order,
        },
        report,
    )
}

fn string_field(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_price(v: &Value) -> Option<f64> {
    let price = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .trim()
            .parse::<f64>()
            .ok()?,
        _ => return None,
    };
    (price.is_finite() && price >= 0.0).then_some(price)
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
