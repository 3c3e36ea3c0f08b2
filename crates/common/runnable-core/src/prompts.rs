//! Prompt templates with `{name}` placeholders.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::runnables::{Runnable, RunnableConfig, call_with_config};
use crate::tracers::schemas::RunType;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid placeholder regex")
});

/// A string template rendered from an object of variables.
///
/// `{name}` is replaced by the variable's value; `{{` and `}}` render as
/// literal braces. String values are inserted as-is, other values as JSON.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
    input_variables: Vec<String>,
    name: Option<String>,
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl PromptTemplate {
    pub fn from_template(template: impl Into<String>) -> Self {
        let template = template.into();
        let mut input_variables: Vec<String> = Vec::new();
        for captures in PLACEHOLDER.captures_iter(&template) {
            if let Some(name) = captures.get(1) {
                let name = name.as_str().to_string();
                if !input_variables.contains(&name) {
                    input_variables.push(name);
                }
            }
        }
        Self {
            template,
            input_variables,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn input_variables(&self) -> &[String] {
        &self.input_variables
    }

    /// Render the template. Every placeholder must have a value.
    pub fn format(&self, values: &Map<String, Value>) -> Result<String> {
        if let Some(missing) = self
            .input_variables
            .iter()
            .find(|name| !values.contains_key(name.as_str()))
        {
            return Err(Error::invalid_input(format!(
                "Missing variable '{missing}' for prompt template. Expected: {:?}",
                self.input_variables
            )));
        }
        let rendered = PLACEHOLDER.replace_all(&self.template, |captures: &Captures| {
            match captures.get(1) {
                Some(name) => values.get(name.as_str()).map(render).unwrap_or_default(),
                None if &captures[0] == "{{" => "{".to_string(),
                None => "}".to_string(),
            }
        });
        Ok(rendered.into_owned())
    }

    /// Accept an object, or a bare value when the template has exactly one
    /// variable.
    fn variables(&self, input: Value) -> Result<Map<String, Value>> {
        match input {
            Value::Object(values) => Ok(values),
            other if self.input_variables.len() == 1 => {
                let mut values = Map::new();
                values.insert(self.input_variables[0].clone(), other);
                Ok(values)
            }
            other => Err(Error::invalid_input(format!(
                "Expected an object with keys {:?}, got {other}",
                self.input_variables
            ))),
        }
    }
}

#[async_trait]
impl Runnable for PromptTemplate {
    type Input = Value;
    type Output = String;

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn run_type(&self) -> RunType {
        RunType::Prompt
    }

    async fn invoke(&self, input: Value, config: Option<RunnableConfig>) -> Result<String> {
        call_with_config(self, input, config, |input, _run| async move {
            self.format(&self.variables(input)?)
        })
        .await
    }
}
