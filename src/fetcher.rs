use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::FetchError;

static JSON_LD_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());
static SCRIPT_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("script").unwrap());
static MENU_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(\$\s?\d+(?:\.\d{2})?|"price"|\bprice\b|\bmenu\b)"#).unwrap()
});
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Elements whose text never reaches the normalized output.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "footer", "svg", "template", "iframe", "head",
];

const STRUCTURED_LABEL: &str = "[STRUCTURED DATA]";
const EMBEDDED_LABEL: &str = "[EMBEDDED MENU DATA]";
const TEXT_LABEL: &str = "[PAGE TEXT]";

/// Anything that can turn a menu url into normalized page text.
#[allow(async_fn_in_trait)]
pub trait PageSource {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// Size limits applied while flattening a page.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    pub max_chars: usize,
    pub max_script_chars: usize,
}

impl Normalizer {
    /// Structured blocks first, then menu-looking scripts, then visible text.
    pub fn normalize(&self, html: &str) -> String {
        let document = Html::parse_document(html);

        let structured: Vec<String> = document
            .select(&JSON_LD_SEL)
            .map(|el| compact_json(&element_text(&el)))
            .filter(|s| !s.is_empty())
            .collect();

        let embedded: Vec<String> = document
            .select(&SCRIPT_SEL)
            .filter(|el| !is_json_ld(el))
            .map(|el| element_text(&el))
            .filter(|s| !s.trim().is_empty() && s.len() <= self.max_script_chars)
            .filter(|s| MENU_HINT_RE.is_match(s))
            .map(|s| collapse_whitespace(&s))
            .collect();

        let visible = visible_lines(&document);

        let mut out = String::new();
        for (label, parts) in [
            (STRUCTURED_LABEL, structured),
            (EMBEDDED_LABEL, embedded),
            (TEXT_LABEL, visible),
        ] {
            if parts.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(label);
            out.push('\n');
            out.push_str(&parts.join("\n"));
        }

        truncate_chars(out, self.max_chars)
    }
}

pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
    normalizer: Normalizer,
}

impl HttpFetcher {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let timeout = settings.fetch_timeout();
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(HttpFetcher {
            client,
            timeout,
            normalizer: Normalizer {
                max_chars: settings.max_content_chars,
                max_script_chars: settings.max_script_chars,
            },
        })
    }

    async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(e, self.timeout))
    }
}

impl PageSource for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let start = Instant::now();
        let html = self.fetch_html(url).await?;
        let text = self.normalizer.normalize(&html);
        info!(
            url,
            html_bytes = html.len(),
            text_chars = text.chars().count(),
            latency_ms = start.elapsed().as_millis() as u64,
            "fetched menu page"
        );
        Ok(text)
    }
}

fn is_json_ld(el: &ElementRef<'_>) -> bool {
    el.value()
        .attr("type")
        .is_some_and(|t| t.eq_ignore_ascii_case("application/ld+json"))
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<String>()
}

/// Re-serialize JSON compactly; fall back to whitespace collapsing for invalid blocks.
fn compact_json(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => value.to_string(),
        Err(e) => {
            debug!(error = %e, "embedded json block did not parse");
            collapse_whitespace(raw)
        }
    }
}

fn is_skipped_element(node: &Node) -> bool {
    match node {
        Node::Element(el) => {
            SKIP_TAGS.contains(&el.name()) || el.attr("role") == Some("navigation")
        }
        _ => false,
    }
}

/// Visible text lines with whitespace collapsed and consecutive repeats dropped.
fn visible_lines(document: &Html) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for node in document.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        if node.ancestors().any(|a| is_skipped_element(a.value())) {
            continue;
        }
        let line = collapse_whitespace(text);
        if line.is_empty() || lines.last() == Some(&line) {
            continue;
        }
        lines.push(line);
    }
    lines
}

fn collapse_whitespace(s: &str) -> String {
    WHITESPACE_RE.replace_all(s.trim(), " ").into_owned()
}

fn truncate_chars(mut s: String, max_chars: usize) -> String {
    if let Some((idx, _)) = s.char_indices().nth(max_chars) {
        s.truncate(idx);
    }
    s
}
