//! Single-pass string templating with an explicit variable set.
//!
//! `TemplateContext` enumerates exactly the variables a template may use:
//! the four built-ins (`workflow_status`, `trigger_id`, `timestamp`,
//! `execution_count`) plus caller-added extras. Substitution is one pass
//! left to right; a substituted value containing `{{...}}` is never
//! re-expanded, and unknown variables are left verbatim.

use std::collections::HashMap;

// ---------------------------------------------------------------------------
// TemplateContext
// ---------------------------------------------------------------------------

/// The variable set available to a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub workflow_status: Option<String>,
    pub trigger_id: Option<String>,
    pub timestamp: Option<String>,
    pub execution_count: Option<u64>,
    extras: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a caller-defined variable. Built-in names win over extras.
    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(name.into(), value.into());
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "workflow_status" => self.workflow_status.clone(),
            "trigger_id" => self.trigger_id.clone(),
            "timestamp" => self.timestamp.clone(),
            "execution_count" => self.execution_count.map(|c| c.to_string()),
            other => self.extras.get(other).cloned(),
        }
    }

    /// Substitute `{{name}}` occurrences in `template`.
    ///
    /// One pass: the output is scanned exactly once, so values containing
    /// `{{...}}` survive literally.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after_open = &rest[open + 2..];
            match after_open.find("}}") {
                Some(close) => {
                    let name = after_open[..close].trim();
                    match self.lookup(name) {
                        Some(value) => out.push_str(&value),
                        // Unknown variable: keep the placeholder verbatim.
                        None => {
                            out.push_str("{{");
                            out.push_str(&after_open[..close]);
                            out.push_str("}}");
                        }
                    }
                    rest = &after_open[close + 2..];
                }
                // Unterminated open brace: emit the rest as-is.
                None => {
                    out.push_str(&rest[open..]);
                    return out;
                }
            }
        }

        out.push_str(rest);
        out
    }
}
