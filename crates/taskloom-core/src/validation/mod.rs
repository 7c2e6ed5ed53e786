//! Declarative output validation with auto-fix.
//!
//! A rule string is either `"<kind>: <rest>"` for kind in
//! {schema, type, range, format, semantic}, or a bare custom expression
//! evaluated by the restricted language in [`expr`]. Fixable failures
//! mutate the node's output in place when auto-fix is enabled.

pub mod expr;

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};

use crate::config::ValidationConfig;
use crate::error::TaskloomError;
use crate::events::{Event, EventBus};
use crate::graph::TaskNode;
use expr::Expr;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://[^\s]+$").unwrap());
static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
});
static DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Email,
    Url,
    Uuid,
    Date,
}

impl FormatKind {
    fn regex(&self) -> &'static Regex {
        match self {
            FormatKind::Email => &EMAIL_RE,
            FormatKind::Url => &URL_RE,
            FormatKind::Uuid => &UUID_RE,
            FormatKind::Date => &DATE_RE,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FormatKind::Email => "email",
            FormatKind::Url => "url",
            FormatKind::Uuid => "uuid",
            FormatKind::Date => "date",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Rule {
    Schema {
        expected_type: Option<String>,
        required: Vec<String>,
    },
    Type(String),
    Range {
        min: f64,
        max: f64,
    },
    Format(FormatKind),
    Custom(Expr),
    Semantic(String),
}

/// Parse a rule string into its typed form.
pub fn parse_rule(rule: &str) -> Result<Rule, TaskloomError> {
    if let Some((prefix, rest)) = rule.split_once(':') {
        let prefix = prefix.trim().to_lowercase();
        let rest = rest.trim();
        match prefix.as_str() {
            "schema" => {
                // A malformed schema body degrades to an empty schema.
                let parsed: Value = serde_json::from_str(rest).unwrap_or_else(|_| json!({}));
                let expected_type = parsed
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let required = parsed
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                return Ok(Rule::Schema {
                    expected_type,
                    required,
                });
            }
            "type" => return Ok(Rule::Type(rest.to_lowercase())),
            "range" => {
                let mut min = f64::NEG_INFINITY;
                let mut max = f64::INFINITY;
                for part in rest.split(',') {
                    let Some((key, value)) = part.split_once(':') else {
                        continue;
                    };
                    let parsed = value.trim().parse::<f64>().map_err(|_| {
                        TaskloomError::InvalidConfiguration(format!(
                            "invalid range bound: {value}"
                        ))
                    })?;
                    match key.trim() {
                        "min" => min = parsed,
                        "max" => max = parsed,
                        _ => {}
                    }
                }
                return Ok(Rule::Range { min, max });
            }
            "format" => {
                let kind = match rest.to_lowercase().as_str() {
                    "email" => FormatKind::Email,
                    "url" => FormatKind::Url,
                    "uuid" => FormatKind::Uuid,
                    "date" => FormatKind::Date,
                    other => {
                        return Err(TaskloomError::InvalidConfiguration(format!(
                            "unknown format: {other}"
                        )));
                    }
                };
                return Ok(Rule::Format(kind));
            }
            "semantic" => return Ok(Rule::Semantic(rest.to_string())),
            _ => {}
        }
    }

    let expr = expr::parse_expr(rule)
        .map_err(|err| TaskloomError::InvalidConfiguration(format!("bad custom rule: {err}")))?;
    Ok(Rule::Custom(expr))
}

/// Outcome of validating one node's output.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub rule: String,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
    pub message: String,
    pub confidence_score: f64,
    pub suggestions: Vec<String>,
    pub auto_fixable: bool,
}

impl ValidationReport {
    fn pass(rule: &str, message: impl Into<String>) -> Self {
        Self {
            passed: true,
            rule: rule.to_string(),
            expected: None,
            actual: None,
            message: message.into(),
            confidence_score: 1.0,
            suggestions: Vec::new(),
            auto_fixable: false,
        }
    }

    fn fail(rule: &str, message: impl Into<String>) -> Self {
        Self {
            passed: false,
            rule: rule.to_string(),
            expected: None,
            actual: None,
            message: message.into(),
            confidence_score: 1.0,
            suggestions: Vec::new(),
            auto_fixable: false,
        }
    }
}

/// Verdict from an implementation-defined semantic check.
#[derive(Debug, Clone, Serialize)]
pub struct SemanticVerdict {
    pub valid: bool,
    pub confidence: f64,
    pub message: String,
}

/// Semantic validation is graded externally (typically by an LLM); the core
/// only forwards the verdict.
#[async_trait]
pub trait SemanticValidator: Send + Sync {
    async fn validate(&self, rule: &str, output: &Value) -> SemanticVerdict;
}

/// Deterministic stand-in used when no grader is wired up.
pub struct StubSemanticValidator;

#[async_trait]
impl SemanticValidator for StubSemanticValidator {
    async fn validate(&self, rule: &str, _output: &Value) -> SemanticVerdict {
        SemanticVerdict {
            valid: true,
            confidence: 1.0,
            message: format!("semantic rule '{rule}' accepted by stub grader"),
        }
    }
}

pub struct ValidationService {
    bus: Arc<EventBus>,
    config: ValidationConfig,
    semantic: Arc<dyn SemanticValidator>,
}

impl ValidationService {
    pub fn new(bus: Arc<EventBus>, config: ValidationConfig) -> Self {
        Self {
            bus,
            config,
            semantic: Arc::new(StubSemanticValidator),
        }
    }

    pub fn with_semantic(mut self, semantic: Arc<dyn SemanticValidator>) -> Self {
        self.semantic = semantic;
        self
    }

    /// Validate a node's output against its rule, applying auto-fix when
    /// enabled and possible, then publish `validation.passed` or
    /// `validation.failed`.
    pub async fn validate_node(&self, node: &mut TaskNode) -> ValidationReport {
        if node.validation_rule.trim().is_empty() {
            return ValidationReport::pass("", "no validation rule specified");
        }

        let rule_str = node.validation_rule.clone();
        let task_view = json!({
            "id": node.id,
            "status": node.status,
            "retries": node.retries,
            "agent_type": node.agent_type,
        });

        let mut report = match parse_rule(&rule_str) {
            Ok(rule) => {
                let mut report = check(&rule, &node.output_data, &task_view, &rule_str);
                if let Rule::Semantic(semantic_rule) = &rule {
                    let verdict = self.semantic.validate(semantic_rule, &node.output_data).await;
                    report.passed = verdict.valid;
                    report.confidence_score = verdict.confidence;
                    report.message = verdict.message;
                }
                if !report.passed && self.config.auto_fix_enabled && report.auto_fixable {
                    if apply_fix(&rule, &mut node.output_data) {
                        tracing::info!(node_id = %node.id, "auto-fixed validation failure");
                        report.passed = true;
                        report.message.push_str(" (auto-fixed)");
                    }
                }
                report
            }
            Err(err) => ValidationReport::fail(&rule_str, err.to_string()),
        };

        report.actual.get_or_insert_with(|| node.output_data.clone());

        let event_type = if report.passed {
            "validation.passed"
        } else {
            "validation.failed"
        };
        let event = Event::new(event_type, "validation_service")
            .with_payload(json!({
                "node_id": node.id,
                "rule": rule_str,
                "message": report.message,
                "confidence": report.confidence_score,
            }))
            .with_priority(if report.passed { 0 } else { 1 });
        if let Err(err) = self.bus.publish(event).await {
            tracing::warn!(error = %err, "failed to publish validation event");
        }

        report
    }
}

fn check(rule: &Rule, output: &Value, task: &Value, rule_str: &str) -> ValidationReport {
    match rule {
        Rule::Schema {
            expected_type,
            required,
        } => {
            if expected_type.as_deref() == Some("object") && !output.is_object() {
                let mut report =
                    ValidationReport::fail(rule_str, format!("expected object, got {}", type_of(output)));
                report.expected = Some(json!("object"));
                report.actual = Some(json!(type_of(output)));
                return report;
            }
            if let Value::Object(map) = output {
                let missing: Vec<&String> =
                    required.iter().filter(|key| !map.contains_key(*key)).collect();
                if !missing.is_empty() {
                    let mut report = ValidationReport::fail(
                        rule_str,
                        format!("missing required fields: {missing:?}"),
                    );
                    report.expected = Some(json!(required));
                    report.actual = Some(json!(map.keys().collect::<Vec<_>>()));
                    report.suggestions =
                        missing.iter().map(|f| format!("add field: {f}")).collect();
                    report.auto_fixable = true;
                    return report;
                }
            } else if !required.is_empty() {
                return ValidationReport::fail(rule_str, "required fields need an object output");
            }
            ValidationReport::pass(rule_str, "schema validation passed")
        }
        Rule::Type(expected) => {
            let matches = match expected.as_str() {
                "string" => output.is_string(),
                "int" => output.is_i64() || output.is_u64(),
                "float" => output.is_number(),
                "bool" => output.is_boolean(),
                "list" => output.is_array(),
                "dict" | "object" => output.is_object(),
                other => {
                    return ValidationReport::fail(rule_str, format!("unknown type: {other}"));
                }
            };
            if matches {
                ValidationReport::pass(rule_str, "type validation passed")
            } else {
                let mut report = ValidationReport::fail(
                    rule_str,
                    format!("type mismatch: expected {expected}, got {}", type_of(output)),
                );
                report.expected = Some(json!(expected));
                report.actual = Some(json!(type_of(output)));
                report.suggestions = vec![format!("convert to {expected}")];
                report.auto_fixable = true;
                report
            }
        }
        Rule::Range { min, max } => {
            let Some(number) = output.as_f64() else {
                return ValidationReport::fail(rule_str, "range validation requires numeric output");
            };
            if number >= *min && number <= *max {
                ValidationReport::pass(rule_str, "range validation passed")
            } else {
                let clamped = number.clamp(*min, *max);
                let mut report = ValidationReport::fail(
                    rule_str,
                    format!("value {number} out of range [{min}, {max}]"),
                );
                report.expected = Some(json!(format!("{min} <= value <= {max}")));
                report.actual = Some(json!(number));
                report.suggestions = vec![format!("clamp to range: {clamped}")];
                report.auto_fixable = true;
                report
            }
        }
        Rule::Format(kind) => {
            let Some(text) = output.as_str() else {
                return ValidationReport::fail(rule_str, "format validation requires string output");
            };
            if kind.regex().is_match(text) {
                ValidationReport::pass(rule_str, "format validation passed")
            } else {
                let mut report = ValidationReport::fail(
                    rule_str,
                    format!("invalid {} format", kind.as_str()),
                );
                report.expected = Some(json!(kind.as_str()));
                report.actual = Some(json!(text));
                report
            }
        }
        Rule::Custom(expr) => match expr::eval_bool(expr, output, task) {
            Ok(true) => ValidationReport::pass(rule_str, format!("expression '{rule_str}' holds")),
            Ok(false) => {
                ValidationReport::fail(rule_str, format!("expression '{rule_str}' is false"))
            }
            Err(err) => {
                ValidationReport::fail(rule_str, format!("expression evaluation error: {err}"))
            }
        },
        // The verdict is filled in by the caller; this placeholder only
        // carries the rule text.
        Rule::Semantic(_) => ValidationReport::pass(rule_str, "semantic validation pending"),
    }
}

fn apply_fix(rule: &Rule, output: &mut Value) -> bool {
    match rule {
        Rule::Schema { required, .. } => {
            let Value::Object(map) = output else {
                return false;
            };
            for key in required {
                map.entry(key.clone()).or_insert(Value::Null);
            }
            true
        }
        Rule::Type(expected) => {
            let converted = match (expected.as_str(), &*output) {
                ("string", Value::Number(n)) => Some(Value::String(n.to_string())),
                ("string", Value::Bool(b)) => Some(Value::String(b.to_string())),
                ("int", Value::String(s)) => {
                    s.trim().parse::<i64>().ok().map(Value::from)
                }
                ("int", Value::Number(n)) => n
                    .as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| Value::from(f as i64)),
                ("float", Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
                ("bool", Value::String(s)) => match s.trim().to_lowercase().as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            };
            match converted {
                Some(fixed) => {
                    *output = fixed;
                    true
                }
                None => false,
            }
        }
        Rule::Range { min, max } => {
            let Some(number) = output.as_f64() else {
                return false;
            };
            *output = Value::from(number.clamp(*min, *max));
            true
        }
        _ => false,
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BusConfig;
    use crate::graph::HandlerKind;

    fn service(auto_fix: bool) -> ValidationService {
        ValidationService::new(
            Arc::new(EventBus::new(BusConfig::default())),
            ValidationConfig {
                auto_fix_enabled: auto_fix,
            },
        )
    }

    fn node_with(rule: &str, output: Value) -> TaskNode {
        let mut node = TaskNode::new("vnode", HandlerKind::DataProcessing);
        node.validation_rule = rule.to_string();
        node.output_data = output;
        node
    }

    #[tokio::test]
    async fn empty_rule_passes() {
        let svc = service(true);
        let mut node = node_with("", json!({"anything": 1}));
        let report = svc.validate_node(&mut node).await;
        assert!(report.passed);
    }

    #[tokio::test]
    async fn schema_missing_keys_auto_fixed_with_null() {
        let svc = service(true);
        let mut node = node_with(
            r#"schema: {"type": "object", "required": ["status", "count"]}"#,
            json!({"status": "done"}),
        );
        let report = svc.validate_node(&mut node).await;
        assert!(report.passed);
        assert!(report.message.ends_with("(auto-fixed)"));
        assert_eq!(node.output_data["count"], Value::Null);
    }

    #[tokio::test]
    async fn schema_failure_without_auto_fix() {
        let svc = service(false);
        let mut node = node_with(
            r#"schema: {"required": ["missing_key"]}"#,
            json!({"present": 1}),
        );
        let report = svc.validate_node(&mut node).await;
        assert!(!report.passed);
        assert!(report.auto_fixable);
        assert!(node.output_data.get("missing_key").is_none());
    }

    #[tokio::test]
    async fn type_conversion_fix() {
        let svc = service(true);
        let mut node = node_with("type: int", json!("42"));
        let report = svc.validate_node(&mut node).await;
        assert!(report.passed);
        assert_eq!(node.output_data, json!(42));
    }

    #[tokio::test]
    async fn range_boundary_passes_and_clamp_fixes() {
        let svc = service(true);

        // Boundary values pass without fixing.
        for boundary in [0.0, 100.0] {
            let mut node = node_with("range: min:0,max:100", json!(boundary));
            let report = svc.validate_node(&mut node).await;
            assert!(report.passed, "boundary {boundary} should pass");
            assert!(!report.message.contains("auto-fixed"));
        }

        let mut node = node_with("range: min:0,max:100", json!(250));
        let report = svc.validate_node(&mut node).await;
        assert!(report.passed);
        assert_eq!(node.output_data, json!(100.0));
    }

    #[tokio::test]
    async fn format_has_no_auto_fix() {
        let svc = service(true);
        let mut node = node_with("format: email", json!("not-an-email"));
        let report = svc.validate_node(&mut node).await;
        assert!(!report.passed);
        assert!(!report.auto_fixable);
        assert_eq!(node.output_data, json!("not-an-email"));

        let mut ok = node_with("format: email", json!("dev@example.org"));
        assert!(svc.validate_node(&mut ok).await.passed);
    }

    #[tokio::test]
    async fn format_validators_cover_the_fixed_set() {
        let svc = service(false);
        let cases = [
            ("format: url", json!("https://example.org/x"), true),
            ("format: url", json!("ftp://example.org"), false),
            (
                "format: uuid",
                json!("123e4567-e89b-12d3-a456-426614174000"),
                true,
            ),
            ("format: uuid", json!("not-a-uuid"), false),
            ("format: date", json!("2024-03-01"), true),
            ("format: date", json!("03/01/2024"), false),
        ];
        for (rule, output, expected) in cases {
            let mut node = node_with(rule, output.clone());
            let report = svc.validate_node(&mut node).await;
            assert_eq!(report.passed, expected, "rule {rule} on {output}");
        }
    }

    #[tokio::test]
    async fn custom_expression_rules() {
        let svc = service(true);
        let mut node = node_with("output.ok == true", json!({"ok": true}));
        assert!(svc.validate_node(&mut node).await.passed);

        let mut failing = node_with("output.confidence > 0.9", json!({"confidence": 0.2}));
        let report = svc.validate_node(&mut failing).await;
        assert!(!report.passed);
        assert!(!report.auto_fixable);
    }

    #[tokio::test]
    async fn semantic_rule_uses_the_grader() {
        let svc = service(true);
        let mut node = node_with("semantic: summary mentions revenue", json!({"summary": "..."}));
        let report = svc.validate_node(&mut node).await;
        assert!(report.passed);
        assert_eq!(report.confidence_score, 1.0);
    }

    #[test]
    fn malformed_schema_body_degrades_to_empty() {
        let rule = parse_rule("schema: {not json").unwrap();
        match rule {
            Rule::Schema {
                expected_type,
                required,
            } => {
                assert!(expected_type.is_none());
                assert!(required.is_empty());
            }
            other => panic!("unexpected rule: {other:?}"),
        }
    }

    #[test]
    fn unknown_format_is_rejected_at_parse_time() {
        assert!(parse_rule("format: phone").is_err());
    }
}
