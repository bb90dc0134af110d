use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

const DEFAULT_IDENTIFY: &str = include_str!("default_prompts/identify.md");
const DEFAULT_VALIDATE: &str = include_str!("default_prompts/validate.md");
const DEFAULT_FIX: &str = include_str!("default_prompts/fix.md");
const DEFAULT_TESTGEN: &str = include_str!("default_prompts/testgen.md");

fn default_template(phase: &str) -> Option<&'static str> {
    match phase {
        "identify" => Some(DEFAULT_IDENTIFY),
        "validate" => Some(DEFAULT_VALIDATE),
        "fix" => Some(DEFAULT_FIX),
        "testgen" => Some(DEFAULT_TESTGEN),
        _ => None,
    }
}

/// Prompt template engine with embedded defaults and user overrides.
pub struct PromptEngine {
    override_dir: Option<String>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<String>) -> Self {
        Self { override_dir }
    }

    /// Load the template for a phase; an override file `<phase>.md` in the
    /// override directory takes precedence over the embedded default.
    pub fn load_template(&self, phase: &str) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(format!("{phase}.md"));
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                });
            }
        }

        default_template(phase)
            .map(str::to_string)
            .ok_or_else(|| Error::Prompt(format!("unknown prompt phase: {phase}")))
    }

    /// Load a phase template and render it with the given variables.
    pub fn render_phase(&self, phase: &str, vars: &HashMap<String, String>) -> Result<String> {
        let template = self.load_template(phase)?;
        render_template(&template, vars)
    }
}

/// Render a template string with the `upon` engine (`{{ var }}` syntax).
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(template)
        .map_err(|e| Error::Prompt(format!("template compile error: {e}")))?;
    compiled
        .render(
            &engine,
            upon::to_value(vars).map_err(|e| Error::Prompt(e.to_string()))?,
        )
        .to_string()
        .map_err(|e| Error::Prompt(format!("template render error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_load_default_identify() {
        let engine = PromptEngine::new(None);
        let template = engine.load_template("identify").unwrap();
        assert!(template.contains("store_issue"));
        assert!(template.contains("{{ hunks }}"));
    }

    #[test]
    fn test_load_default_validate() {
        let engine = PromptEngine::new(None);
        let template = engine.load_template("validate").unwrap();
        assert!(template.contains("store_verdict"));
        assert!(template.contains("FALSE POSITIVE"));
    }

    #[test]
    fn test_load_default_fix_mentions_minimal_change() {
        let engine = PromptEngine::new(None);
        let template = engine.load_template("fix").unwrap();
        assert!(template.contains("minimal"));
        assert!(template.contains("{{ mitigation }}"));
    }

    #[test]
    fn test_unknown_phase_errors() {
        let engine = PromptEngine::new(None);
        assert!(engine.load_template("deploy").is_err());
    }

    #[test]
    fn test_render_identify_substitutes_hunks() {
        let engine = PromptEngine::new(None);
        let rendered = engine
            .render_phase("identify", &vars(&[("hunks", "### File: a.py")]))
            .unwrap();
        assert!(rendered.contains("### File: a.py"));
        assert!(!rendered.contains("{{ hunks }}"));
    }

    #[test]
    fn test_render_fix_substitutes_issue_fields() {
        let engine = PromptEngine::new(None);
        let rendered = engine
            .render_phase(
                "fix",
                &vars(&[
                    ("file_path", "src/db.py"),
                    ("line_start", "10"),
                    ("line_end", "12"),
                    ("issue_type", "security"),
                    ("severity", "critical"),
                    ("description", "SQL injection"),
                    ("code_snippet", "query = f\"...\""),
                    ("mitigation", "use parameters"),
                ]),
            )
            .unwrap();
        assert!(rendered.contains("src/db.py"));
        assert!(rendered.contains("SQL injection"));
        assert!(rendered.contains("use parameters"));
    }

    #[test]
    fn test_override_dir_takes_precedence() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("identify.md"), "custom {{ hunks }}").unwrap();
        let engine = PromptEngine::new(Some(dir.path().to_string_lossy().to_string()));
        let rendered = engine
            .render_phase("identify", &vars(&[("hunks", "X")]))
            .unwrap();
        assert_eq!(rendered, "custom X");
    }

    #[test]
    fn test_missing_override_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let engine = PromptEngine::new(Some(dir.path().to_string_lossy().to_string()));
        assert!(engine.load_template("validate").unwrap().contains("store_verdict"));
    }

    #[test]
    fn test_render_template_bad_syntax_errors() {
        let err = render_template("{{ unclosed", &vars(&[])).unwrap_err();
        assert!(err.to_string().contains("template"));
    }
}
