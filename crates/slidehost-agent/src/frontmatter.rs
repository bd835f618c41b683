//! Headmatter for the generated `slides.md`.
//!
//! Values are written as JSON, which is valid YAML: strings come out quoted,
//! everything else in flow style.

use serde_json::{Map, Value};
use slidehost_process::PresentationRequest;

pub fn default_frontmatter() -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("theme".to_string(), Value::from("default"));
    m.insert("title".to_string(), Value::from("Presentation"));
    m.insert("highlighter".to_string(), Value::from("shiki"));
    m.insert("lineNumbers".to_string(), Value::from(false));
    m.insert("drawings".to_string(), serde_json::json!({ "persist": false }));
    m.insert("transition".to_string(), Value::from("slide-left"));
    m.insert("mdc".to_string(), Value::from(true));
    m
}

/// defaults ← `config` ← `frontmatter` ← explicit `title`/`theme`.
/// Later layers win on key collision.
pub fn merge(defaults: &Map<String, Value>, req: &PresentationRequest) -> Map<String, Value> {
    let mut out = defaults.clone();
    for layer in [req.config.as_ref(), req.frontmatter.as_ref()]
        .into_iter()
        .flatten()
    {
        for (k, v) in layer {
            out.insert(k.clone(), v.clone());
        }
    }
    if let Some(title) = req.title.as_ref().filter(|t| !t.trim().is_empty()) {
        out.insert("title".to_string(), Value::from(title.trim()));
    }
    if let Some(theme) = req.theme.as_ref().filter(|t| !t.trim().is_empty()) {
        out.insert("theme".to_string(), Value::from(theme.trim()));
    }
    out
}

pub fn render_header(fields: &Map<String, Value>) -> String {
    let mut out = String::from("---\n");
    for (k, v) in fields {
        out.push_str(&render_key(k));
        out.push_str(": ");
        out.push_str(&v.to_string());
        out.push('\n');
    }
    out.push_str("---\n");
    out
}

pub fn render_document(fields: &Map<String, Value>, content: &str) -> String {
    let mut out = render_header(fields);
    out.push('\n');
    out.push_str(content.trim_start_matches('\u{feff}'));
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn render_key(k: &str) -> String {
    let plain = !k.is_empty()
        && k
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if plain {
        k.to_string()
    } else {
        Value::from(k).to_string()
    }
}
