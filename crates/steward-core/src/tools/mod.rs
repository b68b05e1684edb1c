pub mod calculator;
pub mod clock;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Trait for tools callable by the LLM agent.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, params: Value) -> Result<String>;
}

/// Tool description advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),
}

/// JSON schema for a parameter struct.
pub fn schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// Registry of available tools, keyed and listed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(calculator::CalculatorTool));
        registry.register(Arc::new(clock::CurrentTimeTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas for every tool, sorted by name so requests stay stable.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Validate `args` against the tool's schema, then run it.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let problems = validate(&args, &tool.parameters_schema());
        if !problems.is_empty() {
            debug!("Rejected arguments for {name}: {}", problems.join("; "));
            return Err(ToolError::InvalidArguments(problems.join("; ")));
        }

        tool.execute(args)
            .await
            .map(|content| ToolOutput { content })
            .map_err(|e| ToolError::ExecutionFailed(format!("{e:#}")))
    }
}

/// Check `value` against the subset of JSON Schema tools use.
/// Returns one message per violation.
pub fn validate(value: &Value, schema: &Value) -> Vec<String> {
    let mut problems = Vec::new();
    check(value, schema, "$", &mut problems);
    problems
}

fn type_matches(value: &Value, ty: &str) -> bool {
    match ty {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn check(value: &Value, schema: &Value, at: &str, problems: &mut Vec<String>) {
    // `type` may be a single name or a list (schemars emits ["string", "null"] for Option).
    let types: Vec<&str> = match schema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    if !types.is_empty() && !types.iter().any(|t| type_matches(value, t)) {
        problems.push(format!("{at}: expected {}", types.join(" or ")));
        return;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            problems.push(format!("{at}: {value} is not one of {}", Value::Array(allowed.clone())));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                problems.push(format!("{at}: {n} is below the minimum {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                problems.push(format!("{at}: {n} is above the maximum {max}"));
            }
        }
    }

    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if len < min {
                problems.push(format!("{at}: shorter than {min} characters"));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                problems.push(format!("{at}: longer than {max} characters"));
            }
        }
    }

    if let Some(obj) = value.as_object() {
        let props = schema.get("properties").and_then(Value::as_object);
        for field in schema
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
        {
            if !obj.contains_key(field) {
                problems.push(format!("{at}.{field}: missing required field"));
            }
        }
        let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
        for (field, field_value) in obj {
            match props.and_then(|p| p.get(field)) {
                Some(field_schema) => {
                    check(field_value, field_schema, &format!("{at}.{field}"), problems)
                }
                None if closed => problems.push(format!("{at}.{field}: unexpected field")),
                None => {}
            }
        }
    }

    if let (Some(items), Some(schema_items)) = (value.as_array(), schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item, schema_items, &format!("{at}[{i}]"), problems);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Repeat the input"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string", "minLength": 1}},
                "required": ["text"]
            })
        }
        async fn execute(&self, params: Value) -> Result<String> {
            match params["text"].as_str() {
                Some("fail") => anyhow::bail!("asked to fail"),
                Some(text) => Ok(text.to_string()),
                None => Ok(String::new()),
            }
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::with_builtins();
        r.register(Arc::new(Echo));
        r
    }

    #[tokio::test]
    async fn invoke_runs_valid_call() {
        let out = registry().invoke("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out.content, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let err = registry().invoke("nope", json!({})).await.unwrap_err();
        assert_eq!(err, ToolError::NotFound("nope".into()));
    }

    #[tokio::test]
    async fn schema_violation_is_rejected_before_execution() {
        let err = registry().invoke("echo", json!({"text": 3})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(ref m) if m.contains("$.text")));
        let err = registry().invoke("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(ref m) if m.contains("missing")));
    }

    #[tokio::test]
    async fn execution_errors_are_wrapped() {
        let err = registry().invoke("echo", json!({"text": "fail"})).await.unwrap_err();
        assert_eq!(err, ToolError::ExecutionFailed("asked to fail".into()));
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let names: Vec<String> = registry().schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["calculator", "current_time", "echo"]);
    }

    #[test]
    fn nullable_types_and_closed_objects() {
        let schema = json!({
            "type": "object",
            "properties": {"tz": {"type": ["string", "null"]}},
            "additionalProperties": false
        });
        assert!(validate(&json!({"tz": null}), &schema).is_empty());
        assert!(validate(&json!({"tz": "UTC"}), &schema).is_empty());
        let problems = validate(&json!({"tz": "UTC", "x": 1}), &schema);
        assert_eq!(problems, vec!["$.x: unexpected field".to_string()]);
    }

    #[test]
    fn ranges_enums_and_items() {
        let schema = json!({
            "type": "array",
            "items": {"type": "integer", "minimum": 0, "maximum": 9}
        });
        assert_eq!(validate(&json!([1, 12]), &schema).len(), 1);
        let schema = json!({"type": "string", "enum": ["a", "b"]});
        assert_eq!(validate(&json!("c"), &schema).len(), 1);
        assert!(validate(&json!("a"), &schema).is_empty());
    }
}
