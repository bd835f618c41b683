use std::collections::BTreeMap;

use slidehost_agent::{AgentError, TtlPolicy};
use slidehost_process::PresentationRequest;

pub const MIN_CONTENT_CHARS: usize = 10;
pub const MAX_CONTENT_CHARS: usize = 1_000_000;
pub const MAX_CSS_CHARS: usize = 100_000;
pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_THEME_CHARS: usize = 100;

struct Problem {
    field: &'static str,
    code: &'static str,
    message: String,
}

/// Checks a create request before anything is allocated.
///
/// A single problem keeps its specific code; several are reported together
/// under `validation_error`.
pub fn validate_request(req: &PresentationRequest, ttl: &TtlPolicy) -> Result<(), AgentError> {
    let mut problems = Vec::new();

    let content_chars = req.content.trim().chars().count();
    if content_chars == 0 {
        problems.push(Problem {
            field: "content",
            code: "content_required",
            message: "content is required".to_string(),
        });
    } else if content_chars < MIN_CONTENT_CHARS {
        problems.push(Problem {
            field: "content",
            code: "content_too_short",
            message: format!("content must be at least {MIN_CONTENT_CHARS} characters"),
        });
    } else if req.content.chars().count() > MAX_CONTENT_CHARS {
        problems.push(Problem {
            field: "content",
            code: "content_too_long",
            message: format!("content must be at most {MAX_CONTENT_CHARS} characters"),
        });
    }

    if let Some(title) = &req.title
        && title.chars().count() > MAX_TITLE_CHARS
    {
        problems.push(Problem {
            field: "title",
            code: "title_too_long",
            message: format!("title must be at most {MAX_TITLE_CHARS} characters"),
        });
    }

    if let Some(theme) = &req.theme
        && !theme_is_valid(theme)
    {
        problems.push(Problem {
            field: "theme",
            code: "invalid_theme",
            message: "theme must be a package name or local path".to_string(),
        });
    }

    if let Some(css) = &req.custom_css
        && css.chars().count() > MAX_CSS_CHARS
    {
        problems.push(Problem {
            field: "customCSS",
            code: "custom_css_too_long",
            message: format!("customCSS must be at most {MAX_CSS_CHARS} characters"),
        });
    }

    if let Err(AgentError::Validation { message, .. }) = ttl.resolve(req.ttl) {
        problems.push(Problem {
            field: "ttl",
            code: "invalid_ttl",
            message,
        });
    }

    match problems.len() {
        0 => Ok(()),
        1 => {
            let p = problems.remove(0);
            Err(AgentError::invalid_field(p.code, p.field, p.message))
        }
        n => {
            let field_errors: BTreeMap<String, String> = problems
                .into_iter()
                .map(|p| (p.field.to_string(), p.message))
                .collect();
            Err(AgentError::Validation {
                code: "validation_error".to_string(),
                message: format!("{n} fields are invalid"),
                field_errors,
            })
        }
    }
}

fn theme_is_valid(theme: &str) -> bool {
    let theme = theme.trim();
    !theme.is_empty()
        && theme.chars().count() <= MAX_THEME_CHARS
        && !theme.contains("..")
        && theme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '@' | '/' | '.'))
}
