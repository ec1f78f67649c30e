//! Condition evaluation for Decision steps.
//!
//! `ConditionEvaluator` is the seam the engine evaluates expressions through.
//! `JexlEvaluator` is the default implementation: it wraps
//! `jexl_eval::Evaluator` with a set of string and collection transforms.
//!
//! Context values are always passed as the evaluation context, never
//! interpolated into the expression string.

use serde_json::{json, Value};

use journalflow_types::workflow::ContextMap;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("empty expression")]
    Empty,
}

// ---------------------------------------------------------------------------
// ConditionEvaluator trait
// ---------------------------------------------------------------------------

/// Evaluates an expression against an instance context.
///
/// Implementations must be deterministic for a fixed context and must not
/// block: evaluation happens inline on the runner task.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &ContextMap) -> Result<Value, ExpressionError>;

    /// Evaluate and coerce the result with [`is_truthy`].
    fn evaluate_bool(&self, expression: &str, context: &ContextMap) -> Result<bool, ExpressionError> {
        self.evaluate(expression, context).map(|v| is_truthy(&v))
    }
}

/// JavaScript-like truthiness: null, false, 0 and "" are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(Value::as_str).unwrap_or("")
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// JEXL-backed evaluator with standard transforms pre-registered.
///
/// Context keys are top-level identifiers, so a context of `{risk: 8}`
/// satisfies `risk > 5`. Transforms: `lower`, `upper`, `trim`, `length`,
/// `contains`, `startsWith`, `endsWith`, `not`.
pub struct JexlEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl JexlEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        args.get(1).is_some_and(|needle| items.contains(needle))
                    }
                    _ => str_arg(args, 0).contains(str_arg(args, 1)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!is_truthy(&val)))
            });

        Self { evaluator }
    }
}

impl Default for JexlEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JexlEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JexlEvaluator").finish_non_exhaustive()
    }
}

impl ConditionEvaluator for JexlEvaluator {
    fn evaluate(&self, expression: &str, context: &ContextMap) -> Result<Value, ExpressionError> {
        if expression.trim().is_empty() {
            return Err(ExpressionError::Empty);
        }
        let prepared = prepare(expression);
        let mut root: serde_json::Map<String, Value> = context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        // Unknown top-level identifiers read as null instead of failing.
        for name in prepared.roots {
            root.entry(name).or_insert(Value::Null);
        }
        self.evaluator
            .eval_in_context(&prepared.expression, &Value::Object(root))
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Expression preparation
// ---------------------------------------------------------------------------

const KEYWORDS: &[&str] = &["true", "false", "null", "in"];

/// An expression rewritten for jexl-eval plus the top-level identifiers it reads.
#[derive(Debug, PartialEq)]
struct Prepared {
    expression: String,
    roots: Vec<String>,
}

/// jexl-eval has no unary minus, so a negative literal in operand position
/// (`pnl < -100`) becomes `(0 - 100)`. String literals are copied untouched.
fn prepare(expression: &str) -> Prepared {
    let chars: Vec<char> = expression.chars().collect();
    let mut out = String::with_capacity(expression.len() + 8);
    let mut roots: Vec<String> = Vec::new();
    // Last significant character outside literals; identifiers and numbers record 'a'.
    let mut prev: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\'' || c == '"' {
            out.push(c);
            i += 1;
            while i < chars.len() {
                let ch = chars[i];
                out.push(ch);
                i += 1;
                if ch == '\\' && i < chars.len() {
                    out.push(chars[i]);
                    i += 1;
                } else if ch == c {
                    break;
                }
            }
            prev = Some('a');
            continue;
        }

        let negative_literal = c == '-'
            && chars.get(i + 1).is_some_and(char::is_ascii_digit)
            && prev.is_none_or(expects_operand);
        if negative_literal {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
                end += 1;
            }
            out.push_str("(0 - ");
            out.extend(&chars[start..end]);
            out.push(')');
            prev = Some('a');
            i = end;
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let is_root = !matches!(prev, Some('.') | Some('|'));
            if is_root && !KEYWORDS.contains(&ident.as_str()) && !roots.contains(&ident) {
                roots.push(ident.clone());
            }
            out.push_str(&ident);
            prev = Some('a');
            continue;
        }

        if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                out.push(chars[i]);
                i += 1;
            }
            prev = Some('a');
            continue;
        }

        out.push(c);
        if !c.is_whitespace() {
            prev = Some(c);
        }
        i += 1;
    }

    Prepared {
        expression: out,
        roots,
    }
}

/// Whether a `-` after `prev` starts an operand rather than a subtraction.
fn expects_operand(prev: char) -> bool {
    matches!(
        prev,
        '(' | '[' | '{' | ',' | '?' | ':' | '<' | '>' | '=' | '!' | '&' | '|' | '+' | '-' | '*' | '/' | '%'
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
