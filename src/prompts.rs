use std::path::Path;

use anyhow::{Context as AnyhowContext, Result, bail};
use handlebars::Handlebars;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::jsonl;

/// One prompt template record from the input file.
///
/// The system/user templates carry `{{name}}` placeholders resolved from
/// `variables`. List-valued variables expand into one variant per combination;
/// scalar variables are shared across all combinations unchanged.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub system: String,
    pub user: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub logprobs: Option<u32>,
}

/// One concrete rendering of a template: the variable assignment it was
/// rendered under plus the substituted system/user texts.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub variables: Map<String, Value>,
    pub system_text: String,
    pub user_text: String,
}

/// Shared template registry. Strict mode makes an unresolvable placeholder a
/// rendering error instead of an empty substitution.
pub fn registry() -> Handlebars<'static> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
}

/// Loads prompt templates from a file of whitespace-separated JSON objects
/// (compact or pretty-printed). A malformed object or a missing required
/// field fails with the position in the error chain.
pub fn load_templates(path: &Path) -> Result<Vec<PromptTemplate>> {
    jsonl::read_seq(path)
}

impl PromptTemplate {
    /// Expands this template into one variant per combination of its
    /// list-valued variables (exactly one variant when there are none).
    ///
    /// List variables combine via cartesian product in declaration order, the
    /// last-declared variable varying fastest.
    pub fn expand(&self, registry: &Handlebars) -> Result<Vec<Variant>> {
        let mut scalars = Map::new();
        let mut list_keys: Vec<&String> = Vec::new();
        let mut list_values: Vec<&Vec<Value>> = Vec::new();
        for (key, value) in &self.variables {
            match value {
                Value::Array(items) => {
                    list_keys.push(key);
                    list_values.push(items);
                }
                scalar => {
                    scalars.insert(key.clone(), scalar.clone());
                }
            }
        }

        if list_keys.is_empty() {
            return Ok(vec![self.render(registry, scalars)?]);
        }
        if let Some(slot) = list_values.iter().position(|items| items.is_empty()) {
            bail!(
                "Template '{}' variable '{}' is an empty list and expands to zero variants",
                self.id,
                list_keys[slot]
            );
        }

        let mut variants = Vec::new();
        let mut indices = vec![0usize; list_values.len()];
        loop {
            let mut context = scalars.clone();
            for (slot, key) in list_keys.iter().enumerate() {
                context.insert((*key).clone(), list_values[slot][indices[slot]].clone());
            }
            variants.push(self.render(registry, context)?);

            // Odometer increment, last slot fastest.
            let mut slot = indices.len();
            let rolled_over = loop {
                if slot == 0 {
                    break true;
                }
                slot -= 1;
                indices[slot] += 1;
                if indices[slot] < list_values[slot].len() {
                    break false;
                }
                indices[slot] = 0;
            };
            if rolled_over {
                return Ok(variants);
            }
        }
    }

    fn render(&self, registry: &Handlebars, variables: Map<String, Value>) -> Result<Variant> {
        let system_text = registry
            .render_template(&self.system, &variables)
            .with_context(|| format!("Failed to render system template of prompt '{}'", self.id))?;
        let user_text = registry
            .render_template(&self.user, &variables)
            .with_context(|| format!("Failed to render user template of prompt '{}'", self.id))?;
        Ok(Variant {
            variables,
            system_text,
            user_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn template(variables: Value) -> PromptTemplate {
        PromptTemplate {
            id: "demo".into(),
            system: "You speak {{register}} English.".into(),
            user: "Write about {{topic}} in the year {{year}}.".into(),
            variables: variables.as_object().cloned().unwrap_or_default(),
            logprobs: None,
        }
    }

    #[test]
    fn scalar_only_template_expands_to_one_variant() {
        let template = template(serde_json::json!({
            "register": "casual",
            "topic": "slang",
            "year": 2024,
        }));
        let variants = template.expand(&registry()).expect("one variant");
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].system_text, "You speak casual English.");
        assert_eq!(
            variants[0].user_text,
            "Write about slang in the year 2024."
        );
    }

    #[test]
    fn list_variables_expand_to_full_cartesian_product() {
        let template = template(serde_json::json!({
            "register": "casual",
            "topic": ["slang", "memes"],
            "year": [2020, 2022, 2024],
        }));
        let variants = template.expand(&registry()).expect("six variants");
        assert_eq!(variants.len(), 6);

        let assignments: Vec<String> = variants
            .iter()
            .map(|variant| {
                format!(
                    "{}-{}",
                    variant.variables["topic"], variant.variables["year"]
                )
            })
            .collect();
        let mut unique = assignments.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 6, "no duplicate combinations: {assignments:?}");

        // Declaration order: topic varies slowest, year fastest.
        assert_eq!(assignments[0], "\"slang\"-2020");
        assert_eq!(assignments[1], "\"slang\"-2022");
        assert_eq!(assignments[3], "\"memes\"-2020");
        for variant in &variants {
            assert_eq!(variant.variables["register"], "casual");
        }
    }

    #[test]
    fn unresolvable_placeholder_fails_rendering() {
        let template = template(serde_json::json!({ "register": "formal" }));
        let err = template.expand(&registry()).unwrap_err();
        assert!(
            err.to_string().contains("demo"),
            "error should name the template: {err:#}"
        );
    }

    #[test]
    fn empty_list_variable_is_rejected() {
        let template = template(serde_json::json!({
            "register": "formal",
            "topic": [],
            "year": 2024,
        }));
        let err = template.expand(&registry()).unwrap_err();
        assert!(err.to_string().contains("empty list"));
    }

    #[test]
    fn loads_mixed_compact_and_pretty_records() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("prompts.jsonl");
        fs::write(
            &path,
            r#"{"id": "a", "system": "s", "user": "u"}

{
  "id": "b",
  "system": "s",
  "user": "u",
  "variables": {"year": [2020, 2022]},
  "logprobs": 5
}
"#,
        )
        .unwrap();

        let templates = load_templates(&path).expect("two templates");
        assert_eq!(templates.len(), 2);
        assert!(templates[0].variables.is_empty());
        assert_eq!(templates[1].logprobs, Some(5));
    }

    #[test]
    fn missing_required_field_reports_position() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("prompts.jsonl");
        fs::write(&path, "{\"id\": \"a\", \"system\": \"s\"}").unwrap();

        let err = load_templates(&path).unwrap_err();
        let chain: Vec<String> = err.chain().map(|cause| cause.to_string()).collect();
        assert!(
            chain.iter().any(|msg| msg.contains("missing field `user`")),
            "error chain: {chain:?}"
        );
        assert!(
            chain.iter().any(|msg| msg.contains("prompts.jsonl")),
            "error chain should name the file: {chain:?}"
        );
    }
}
