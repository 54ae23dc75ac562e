use serde_json::{json, Value};

use super::category::Category;

/// Items below this price are condiment-level and skipped by the extractor.
pub const CONDIMENT_PRICE_FLOOR: f64 = 3.0;

pub const SCHEMA_NAME: &str = "menu_extraction";

pub fn system_instruction() -> String {
    let vocabulary = Category::ALL
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "You extract dishes from restaurant menu pages.\n\
         Return every orderable food dish with:\n\
         - name: the dish name as printed, without price or description\n\
         - category: exactly one of [{vocabulary}]\n\
         - menu_section: the menu heading the dish appears under, or null\n\
         - price: the price as a number without currency symbol, or null if not shown\n\
         Also return menu_section_order: the menu section headings in the order they appear.\n\
         Rules:\n\
         - Skip generic beverages (soda, coffee, tea, juice, water, beer, wine).\n\
         - Skip condiments, sauces, dressings and add-ons priced under ${CONDIMENT_PRICE_FLOOR:.2}.\n\
         - When a dish is offered in several sizes, return it once with the largest size's price.\n\
         - Assign one category per dish; never invent a category outside the list.\n\
         - Content under [STRUCTURED DATA] is the most reliable, then [EMBEDDED MENU DATA], then [PAGE TEXT]."
    )
}

pub fn user_message(restaurant_name: &str, page_text: &str) -> String {
    format!("Restaurant: {restaurant_name}\n\nMenu page content:\n{page_text}")
}

/// Strict JSON schema the extraction capability must answer with.
pub fn response_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["dishes", "menu_section_order"],
        "properties": {
            "dishes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["name", "category", "menu_section", "price"],
                    "properties": {
                        "name": { "type": "string" },
                        "category": { "type": "string" },
                        "menu_section": { "type": ["string", "null"] },
                        "price": { "type": ["number", "null"] }
                    }
                }
            },
            "menu_section_order": {
                "type": "array",
                "items": { "type": "string" }
            }
        }
    })
}
