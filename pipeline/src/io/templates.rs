//! Prompt template loading and rendering.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use minijinja::Environment;
use serde_json::Value;
use tracing::debug;

/// Variables passed to a template. Values may be strings, numbers or lists.
pub type TemplateVars = BTreeMap<String, Value>;

/// Renders a named prompt template.
pub trait TemplateLoader {
    fn render(&self, name: &str, vars: &TemplateVars) -> Result<String>;
}

const EMBEDDED: &[(&str, &str)] = &[
    ("draft", include_str!("prompts/draft.md")),
    ("refine", include_str!("prompts/refine.md")),
    ("challenge", include_str!("prompts/challenge.md")),
    ("tiebreak", include_str!("prompts/tiebreak.md")),
    ("implement", include_str!("prompts/implement.md")),
    ("implement-refine", include_str!("prompts/implement-refine.md")),
    ("review", include_str!("prompts/review.md")),
    ("implement-tiebreak", include_str!("prompts/implement-tiebreak.md")),
];

/// Template engine wrapper around minijinja.
///
/// `<override_dir>/<name>.md` takes precedence over the embedded default.
pub struct PromptTemplates {
    env: Environment<'static>,
    override_dir: Option<PathBuf>,
}

impl PromptTemplates {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        Self { env, override_dir }
    }

    fn source(&self, name: &str) -> Result<String> {
        if let Some(dir) = &self.override_dir {
            let path = dir.join(format!("{name}.md"));
            if path.exists() {
                debug!(template = name, path = %path.display(), "using template override");
                return fs::read_to_string(&path)
                    .with_context(|| format!("read template {}", path.display()));
            }
        }
        EMBEDDED
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, body)| (*body).to_string())
            .ok_or_else(|| anyhow!("unknown template '{name}'"))
    }
}

impl TemplateLoader for PromptTemplates {
    fn render(&self, name: &str, vars: &TemplateVars) -> Result<String> {
        let source = self.source(name)?;
        self.env
            .render_str(&source, vars)
            .with_context(|| format!("render template '{name}'"))
    }
}
