//! Menu extraction through an external structured-extraction capability.
//!
//! The capability's answer crosses into the pipeline only through
//! [`validate::validate`], which turns the untrusted JSON into [`ExtractedDish`]es.

pub mod category;
pub mod llm;
pub mod prompt;
pub mod validate;

use category::Category;

use crate::error::ExtractionError;

pub use llm::LlmExtractor;

/// A dish as read from the menu page. Never persisted directly.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedDish {
    pub name: String,
    pub category: Category,
    pub menu_section: Option<String>,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedMenu {
    pub dishes: Vec<ExtractedDish>,
    pub menu_section_order: Vec<String>,
}

#[allow(async_fn_in_trait)]
pub trait MenuExtractor {
    /// Fails fast when the capability cannot possibly be called.
    fn check_credentials(&self) -> Result<(), ExtractionError>;

    async fn extract(
        &self,
        restaurant_name: &str,
        page_text: &str,
    ) -> Result<ExtractedMenu, ExtractionError>;
}
