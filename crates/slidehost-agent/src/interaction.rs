use std::collections::HashSet;

/// One canned answer for an interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRule {
    /// Case-insensitive substring looked for in renderer output.
    pub pattern: String,
    /// Bytes written to the renderer's stdin when the pattern shows up.
    pub response: String,
}

impl PromptRule {
    pub fn new(pattern: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into().to_ascii_lowercase(),
            response: response.into(),
        }
    }
}

/// Declarative mapping from detected prompts to responses, first match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractionPolicy {
    rules: Vec<PromptRule>,
}

impl InteractionPolicy {
    pub fn new(rules: Vec<PromptRule>) -> Self {
        Self { rules }
    }

    /// Never answers anything.
    pub fn none() -> Self {
        Self::default()
    }

    /// Accepts the renderer's offers to install missing themes and addons.
    pub fn auto_confirm() -> Self {
        Self::new(vec![
            PromptRule::new("do you want to install", "Y\n"),
            PromptRule::new("install it now", "Y\n"),
            PromptRule::new("(y/n)", "Y\n"),
        ])
    }

    pub fn rules(&self) -> &[PromptRule] {
        &self.rules
    }

    pub fn response_for(&self, text: &str) -> Option<&str> {
        let lower = text.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|r| !r.pattern.is_empty() && lower.contains(&r.pattern))
            .map(|r| r.response.as_str())
    }
}

/// Tracks which prompts were already answered during one startup.
///
/// A prompt is usually seen twice: once as an unterminated fragment and again
/// when the renderer finally prints the newline.
#[derive(Debug, Default)]
pub(crate) struct PromptResponder {
    answered: HashSet<String>,
}

impl PromptResponder {
    pub(crate) fn respond<'a>(
        &mut self,
        policy: &'a InteractionPolicy,
        text: &str,
    ) -> Option<&'a str> {
        let response = policy.response_for(text)?;
        // Output printed after an answered prompt lands on the same line.
        if self.answered.iter().any(|a| text.starts_with(a.as_str())) {
            return None;
        }
        self.answered.insert(text.to_string());
        Some(response)
    }
}
