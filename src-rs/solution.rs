use std::time::Duration;

use anyhow::{anyhow, Context};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::timeout::with_timeout;

/// Style preamble sent ahead of the rendered problem details.
const GENERATOR_INSTRUCTIONS: &str = "You are a Python code generator that only outputs valid \
Python code solutions. You should use a minimal amount of external libraries, and you should be \
writing code that is legible and the optimal solution in terms of time and space complexity. It \
is very important that this code is legible and understandable, so add comments next to relevant \
places in the code that explain what the code does. Absolutely no markdown. Write your answer in \
the style of a solution to a Leetcode problem.";

/// Structured problem bundle received from the desktop client. Consumed once
/// per request, never persisted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProblemInfo {
    pub problem_statement: Option<String>,
    pub input_format: Option<InputFormat>,
    pub output_format: Option<OutputFormat>,
    pub constraints: Option<Vec<Constraint>>,
    pub test_cases: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputFormat {
    pub description: Option<String>,
    pub parameters: Option<Vec<Parameter>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: Option<String>,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputFormat {
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub subtype: Option<String>,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Constraint {
    pub description: String,
    pub parameter: Option<String>,
    pub range: Option<ConstraintRange>,
    pub nullable: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConstraintRange {
    pub min: serde_json::Number,
    pub max: serde_json::Number,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("OpenAI API key is required")]
    MissingApiKey,
    #[error("OpenAI request timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Invalid response from OpenAI API")]
    MalformedResponse,
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(model: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create OpenAI HTTP client")?;

        Ok(Self {
            http,
            base_url: "https://api.openai.com/v1".to_string(),
            model,
            timeout,
        })
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// Requests one free-form completion for the rendered problem prompt.
    /// Exactly one outbound call is made, bounded by the configured timeout.
    pub async fn generate_solution(
        &self,
        problem: &ProblemInfo,
        api_key: &str,
    ) -> Result<String, CompletionError> {
        if api_key.trim().is_empty() {
            return Err(CompletionError::MissingApiKey);
        }

        tracing::info!(model = %self.model, "starting solution generation");

        let body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "user",
                    "content": format!("{}{}", GENERATOR_INSTRUCTIONS, render_prompt(problem)),
                }
            ],
        });

        let url = format!("{}/chat/completions", self.base_url);
        let payload = with_timeout(self.timeout, async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .await
                .context("OpenAI request failed")?;

            let status = response.status();
            let text = response
                .text()
                .await
                .context("failed to read OpenAI response body")?;

            if !status.is_success() {
                return Err(anyhow!(
                    "OpenAI API failed with status {}: {}",
                    status,
                    text
                ));
            }

            serde_json::from_str::<Value>(&text).context("failed to decode OpenAI response")
        })
        .await
        .map_err(|expired| CompletionError::TimedOut(expired.0))??;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .filter(|value| !value.is_empty())
            .ok_or(CompletionError::MalformedResponse)?;

        Ok(clean_code_from_markdown(content))
    }
}

/// Strips one leading language-tagged fence and one trailing bare fence if
/// present at the very edges of the string. Mid-content fences are left
/// alone.
pub fn clean_code_from_markdown(content: &str) -> String {
    static OPENING_FENCE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^```[\w]*\n").expect("valid regex"));
    static CLOSING_FENCE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\n```$").expect("valid regex"));

    let without_opening = OPENING_FENCE_RE.replace(content, "");
    CLOSING_FENCE_RE.replace(&without_opening, "").into_owned()
}

pub fn render_prompt(problem: &ProblemInfo) -> String {
    let parameters = problem
        .input_format
        .as_ref()
        .and_then(|input| input.parameters.as_ref())
        .map(|parameters| {
            parameters
                .iter()
                .map(render_parameter)
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_else(|| "No parameters".to_string());

    let constraints = problem
        .constraints
        .as_ref()
        .map(|constraints| {
            constraints
                .iter()
                .map(render_constraint)
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_else(|| "No constraints".to_string());

    let empty_cases = Value::Array(Vec::new());
    let test_cases = problem.test_cases.as_ref().unwrap_or(&empty_cases);
    let test_cases =
        serde_json::to_string_pretty(test_cases).unwrap_or_else(|_| "[]".to_string());

    format!(
        "You are a Python code generator. Your task is to generate a valid Python solution for \
the following problem.\n\
IMPORTANT: Return ONLY the Python code solution. No explanations, no markdown formatting, no \
additional text.\n\
\n\
PROBLEM DETAILS:\n\
---------------\n\
Problem Statement:\n\
{statement}\n\
\n\
Input Format:\n\
{input_description}\n\
\n\
Parameters:\n\
{parameters}\n\
\n\
Output Format:\n\
{output_description}\n\
Returns: {returns}\n\
\n\
Constraints:\n\
{constraints}\n\
\n\
Test Cases:\n\
{test_cases}",
        statement = problem.problem_statement.as_deref().unwrap_or("None"),
        input_description = problem
            .input_format
            .as_ref()
            .and_then(|input| input.description.as_deref())
            .unwrap_or("None"),
        parameters = parameters,
        output_description = problem
            .output_format
            .as_ref()
            .and_then(|output| output.description.as_deref())
            .unwrap_or("None"),
        returns = render_returns(problem.output_format.as_ref()),
        constraints = constraints,
        test_cases = test_cases,
    )
}

fn render_parameter(parameter: &Parameter) -> String {
    let mut type_str = parameter.kind.clone();
    if let Some(subtype) = &parameter.subtype {
        type_str.push_str(" of ");
        type_str.push_str(subtype);
    }
    type_str.push_str(if parameter.nullable {
        " | None"
    } else {
        " (required)"
    });
    format!("- {}: {}", parameter.name, type_str)
}

fn render_returns(output: Option<&OutputFormat>) -> String {
    let Some(output) = output else {
        return "None (never None)".to_string();
    };

    let mut rendered = output.kind.clone().unwrap_or_else(|| "None".to_string());
    if let Some(subtype) = &output.subtype {
        rendered.push_str(" of ");
        rendered.push_str(subtype);
    }
    rendered.push_str(if output.nullable {
        " | None"
    } else {
        " (never None)"
    });
    rendered
}

fn render_constraint(constraint: &Constraint) -> String {
    let mut line = format!("- {}", constraint.description);
    if let Some(range) = &constraint.range {
        line.push_str(&format!(
            " ({}: {} to {})",
            constraint.parameter.as_deref().unwrap_or_default(),
            range.min,
            range.max
        ));
    }
    match constraint.nullable {
        Some(true) => line.push_str(" (can be None)"),
        Some(false) => line.push_str(" (cannot be None)"),
        None => {}
    }
    line
}
