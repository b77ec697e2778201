//! Query filter compiler
//!
//! Turns a document-query filter (the usual JSON vocabulary of field
//! equality, comparison, logical and array operators) into a [`Filter`]: a
//! compiled, immutable predicate over documents.
//!
//! # Supported Syntax
//!
//! | Form | Meaning |
//! |------|---------|
//! | `{"a": 1}` | field equality (arrays match on containment, `null` matches missing) |
//! | `{"a.b.0": 1}` | dotted path through objects, array indexes and array elements |
//! | `$eq $ne $gt $gte $lt $lte` | comparison |
//! | `$in $nin` | membership |
//! | `$exists $size $all $elemMatch` | presence and array operators |
//! | `$not` | negated operator expression |
//! | `$and $or $nor` | logical combinators |
//!
//! Compilation is total: anything outside this vocabulary is rejected with a
//! [`CompilationError`] before a predicate exists.

use crate::json::{
    compare_values, set_at_path, value_type_name, values_equal, FieldPath, JsonPathError,
};
use crate::types::{DELETED_FIELD, ID_FIELD};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;

/// Error raised while compiling a filter
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompilationError {
    /// A filter or sub-filter was not a JSON object
    #[error("filter must be an object, found {found}")]
    NotAnObject {
        /// Type actually supplied
        found: &'static str,
    },

    /// An operator outside the supported vocabulary
    #[error("unknown operator {0}")]
    UnknownOperator(String),

    /// An operator received an operand of the wrong shape
    #[error("invalid operand for {operator}: {reason}")]
    InvalidOperand {
        /// The operator
        operator: String,
        /// What was wrong
        reason: String,
    },

    /// A field name could not be parsed as a dotted path
    #[error("invalid field path '{0}'")]
    InvalidPath(String),
}

fn invalid(operator: &str, reason: impl Into<String>) -> CompilationError {
    CompilationError::InvalidOperand {
        operator: operator.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone)]
enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Nor(Vec<Expr>),
    Field {
        path: FieldPath,
        conditions: Vec<Condition>,
    },
}

#[derive(Debug, Clone)]
enum Condition {
    Eq(Value),
    Ne(Value),
    Range(Ordering, bool, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Size(usize),
    All(Vec<Value>),
    ElemMatch(ElemMatch),
    Not(Vec<Condition>),
}

#[derive(Debug, Clone)]
enum ElemMatch {
    Document(Box<Expr>),
    Value(Vec<Condition>),
}

/// A compiled query predicate
///
/// # Examples
///
/// ```
/// use livedoc_core::filter::Filter;
/// use serde_json::json;
///
/// let open = Filter::compile(&json!({"status": "open", "priority": {"$gte": 2}})).unwrap();
/// assert!(open.matches(&json!({"status": "open", "priority": 3})));
/// assert!(!open.matches(&json!({"status": "open", "priority": 1})));
/// ```
#[derive(Debug, Clone)]
pub struct Filter {
    expr: Expr,
    source: Value,
}

impl Filter {
    /// Compile a filter document
    pub fn compile(filter: &Value) -> Result<Self, CompilationError> {
        let expr = match filter {
            // A missing filter selects everything
            Value::Null => Expr::And(Vec::new()),
            Value::Object(obj) => compile_document(obj)?,
            other => {
                return Err(CompilationError::NotAnObject {
                    found: value_type_name(other),
                })
            }
        };
        Ok(Filter {
            expr,
            source: filter.clone(),
        })
    }

    /// Filter matching every document
    pub fn match_all() -> Self {
        Filter {
            expr: Expr::And(Vec::new()),
            source: Value::Object(Map::new()),
        }
    }

    /// Filter selecting the document with identity `id`
    pub fn by_id(id: &Value) -> Self {
        let mut source = Map::new();
        source.insert(ID_FIELD.to_string(), id.clone());
        Filter {
            expr: Expr::Field {
                path: FieldPath::from_segments(vec![ID_FIELD.to_string()]),
                conditions: vec![Condition::Eq(id.clone())],
            },
            source: Value::Object(source),
        }
    }

    /// Restrict this filter to documents without the soft-delete marker
    pub fn live(self) -> Self {
        let not_deleted = Expr::Field {
            path: FieldPath::from_segments(vec![DELETED_FIELD.to_string()]),
            conditions: vec![Condition::Exists(false)],
        };
        let source = serde_json::json!({
            "$and": [self.source, { DELETED_FIELD: { "$exists": false } }]
        });
        Filter {
            expr: Expr::And(vec![self.expr, not_deleted]),
            source,
        }
    }

    /// The filter document this predicate was compiled from
    pub fn source(&self) -> &Value {
        &self.source
    }

    /// Evaluate the predicate against a document
    pub fn matches(&self, doc: &Value) -> bool {
        eval_expr(&self.expr, doc)
    }

    /// The identity value if this filter is exactly `{_id: <scalar>}`
    pub fn id_equality(&self) -> Option<&Value> {
        match &self.expr {
            Expr::Field { path, conditions }
                if path.len() == 1 && path.first() == Some(ID_FIELD) && conditions.len() == 1 =>
            {
                match &conditions[0] {
                    Condition::Eq(v) if !v.is_object() && !v.is_array() => Some(v),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Document seeded from the filter's top-level equality conditions
    ///
    /// Used as the starting point of an upsert that matched nothing.
    ///
    /// Fails when two equality conditions cannot both be written, e.g. `{a: 1,
    /// "a.b": 2}`, or when a dotted index reaches too far into an array value.
    pub fn upsert_seed(&self) -> Result<Value, JsonPathError> {
        let mut seed = Value::Object(Map::new());
        collect_equalities(&self.expr, &mut seed)?;
        Ok(seed)
    }
}

// =============================================================================
// Compilation
// =============================================================================

fn compile_document(obj: &Map<String, Value>) -> Result<Expr, CompilationError> {
    let mut clauses = Vec::with_capacity(obj.len());
    for (key, value) in obj {
        let clause = match key.as_str() {
            "$and" => Expr::And(compile_clause_list(key, value)?),
            "$or" => Expr::Or(compile_clause_list(key, value)?),
            "$nor" => Expr::Nor(compile_clause_list(key, value)?),
            op if op.starts_with('$') => {
                return Err(CompilationError::UnknownOperator(op.to_string()))
            }
            field => {
                let path: FieldPath = field
                    .parse()
                    .map_err(|_| CompilationError::InvalidPath(field.to_string()))?;
                Expr::Field {
                    path,
                    conditions: compile_field_value(value)?,
                }
            }
        };
        clauses.push(clause);
    }
    if clauses.len() == 1 {
        if let Some(only) = clauses.pop() {
            return Ok(only);
        }
    }
    Ok(Expr::And(clauses))
}

fn compile_clause_list(operator: &str, value: &Value) -> Result<Vec<Expr>, CompilationError> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid(operator, "expected an array of filters"))?;
    if items.is_empty() {
        return Err(invalid(operator, "array must not be empty"));
    }
    items
        .iter()
        .map(|item| match item {
            Value::Object(obj) => compile_document(obj),
            other => Err(CompilationError::NotAnObject {
                found: value_type_name(other),
            }),
        })
        .collect()
}

fn is_operator_object(obj: &Map<String, Value>) -> bool {
    !obj.is_empty() && obj.keys().any(|k| k.starts_with('$'))
}

fn compile_field_value(value: &Value) -> Result<Vec<Condition>, CompilationError> {
    match value {
        Value::Object(obj) if is_operator_object(obj) => compile_operators(obj),
        literal => Ok(vec![Condition::Eq(literal.clone())]),
    }
}

fn compile_operators(obj: &Map<String, Value>) -> Result<Vec<Condition>, CompilationError> {
    let mut conditions = Vec::with_capacity(obj.len());
    for (op, operand) in obj {
        if !op.starts_with('$') {
            return Err(invalid(op, "cannot mix field names with operators"));
        }
        conditions.push(compile_operator(op, operand)?);
    }
    Ok(conditions)
}

fn compile_operator(op: &str, operand: &Value) -> Result<Condition, CompilationError> {
    let condition = match op {
        "$eq" => Condition::Eq(operand.clone()),
        "$ne" => Condition::Ne(operand.clone()),
        "$gt" => Condition::Range(Ordering::Greater, false, operand.clone()),
        "$gte" => Condition::Range(Ordering::Greater, true, operand.clone()),
        "$lt" => Condition::Range(Ordering::Less, false, operand.clone()),
        "$lte" => Condition::Range(Ordering::Less, true, operand.clone()),
        "$in" => Condition::In(array_operand(op, operand)?),
        "$nin" => Condition::Nin(array_operand(op, operand)?),
        "$all" => Condition::All(array_operand(op, operand)?),
        "$exists" => Condition::Exists(match operand {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::Null => false,
            _ => return Err(invalid(op, "expected a boolean")),
        }),
        "$size" => {
            let size = operand
                .as_u64()
                .ok_or_else(|| invalid(op, "expected a non-negative integer"))?;
            Condition::Size(size as usize)
        }
        "$elemMatch" => {
            let obj = operand
                .as_object()
                .ok_or_else(|| invalid(op, "expected an object"))?;
            let value_form = !obj.is_empty()
                && obj
                    .keys()
                    .all(|k| k.starts_with('$') && !matches!(k.as_str(), "$and" | "$or" | "$nor"));
            if value_form {
                Condition::ElemMatch(ElemMatch::Value(compile_operators(obj)?))
            } else {
                Condition::ElemMatch(ElemMatch::Document(Box::new(compile_document(obj)?)))
            }
        }
        "$not" => match operand {
            Value::Object(obj) if is_operator_object(obj) => Condition::Not(compile_operators(obj)?),
            _ => return Err(invalid(op, "expected an operator expression")),
        },
        other => return Err(CompilationError::UnknownOperator(other.to_string())),
    };
    Ok(condition)
}

fn array_operand(op: &str, operand: &Value) -> Result<Vec<Value>, CompilationError> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| invalid(op, "expected an array"))
}

fn collect_equalities(expr: &Expr, seed: &mut Value) -> Result<(), JsonPathError> {
    match expr {
        Expr::And(clauses) => {
            for clause in clauses {
                collect_equalities(clause, seed)?;
            }
        }
        Expr::Field { path, conditions } => {
            for condition in conditions {
                if let Condition::Eq(v) = condition {
                    set_at_path(seed, path, v.clone())?;
                }
            }
        }
        Expr::Or(_) | Expr::Nor(_) => {}
    }
    Ok(())
}

// =============================================================================
// Evaluation
// =============================================================================

fn eval_expr(expr: &Expr, doc: &Value) -> bool {
    match expr {
        Expr::And(clauses) => clauses.iter().all(|c| eval_expr(c, doc)),
        Expr::Or(clauses) => clauses.iter().any(|c| eval_expr(c, doc)),
        Expr::Nor(clauses) => !clauses.iter().any(|c| eval_expr(c, doc)),
        Expr::Field { path, conditions } => {
            let mut found = Vec::new();
            candidates(doc, path.segments(), &mut found);
            conditions.iter().all(|c| eval_condition(c, &found))
        }
    }
}

/// Collect every value reachable at `segments`
///
/// A non-numeric segment applied to an array descends into each element.
fn candidates<'a>(value: &'a Value, segments: &[String], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(obj) => {
            if let Some(child) = obj.get(head) {
                candidates(child, rest, out);
            }
        }
        Value::Array(arr) => match head.parse::<usize>() {
            Ok(idx) => {
                if let Some(child) = arr.get(idx) {
                    candidates(child, rest, out);
                }
            }
            Err(_) => {
                for element in arr.iter().filter(|e| e.is_object()) {
                    candidates(element, segments, out);
                }
            }
        },
        _ => {}
    }
}

fn eq_matches(candidate: &Value, expected: &Value) -> bool {
    if values_equal(candidate, expected) {
        return true;
    }
    match candidate {
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        _ => false,
    }
}

fn range_matches(candidate: &Value, direction: Ordering, inclusive: bool, bound: &Value) -> bool {
    let check = |v: &Value| match compare_values(v, bound) {
        Some(Ordering::Equal) => inclusive,
        Some(ord) => ord == direction,
        None => false,
    };
    match candidate {
        Value::Array(items) => items.iter().any(check),
        other => check(other),
    }
}

fn eval_eq(found: &[&Value], expected: &Value) -> bool {
    if expected.is_null() && found.is_empty() {
        return true;
    }
    found.iter().any(|c| eq_matches(c, expected))
}

fn eval_condition(condition: &Condition, found: &[&Value]) -> bool {
    match condition {
        Condition::Eq(v) => eval_eq(found, v),
        Condition::Ne(v) => !eval_eq(found, v),
        Condition::Range(direction, inclusive, bound) => found
            .iter()
            .any(|c| range_matches(c, *direction, *inclusive, bound)),
        Condition::In(values) => values.iter().any(|v| eval_eq(found, v)),
        Condition::Nin(values) => !values.iter().any(|v| eval_eq(found, v)),
        Condition::Exists(expected) => !found.is_empty() == *expected,
        Condition::Size(n) => found
            .iter()
            .any(|c| c.as_array().map(|a| a.len() == *n).unwrap_or(false)),
        Condition::All(values) => {
            !values.is_empty()
                && found
                    .iter()
                    .any(|c| values.iter().all(|v| eq_matches(c, v)))
        }
        Condition::ElemMatch(elem) => found.iter().any(|c| match c {
            Value::Array(items) => items.iter().any(|item| match elem {
                ElemMatch::Document(expr) => item.is_object() && eval_expr(expr, item),
                ElemMatch::Value(conds) => conds.iter().all(|cond| eval_condition(cond, &[item])),
            }),
            _ => false,
        }),
        Condition::Not(conds) => !conds.iter().all(|cond| eval_condition(cond, found)),
    }
}
