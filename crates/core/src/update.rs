//! Typed update operators
//!
//! An [`Update`] is an ordered list of [`UpdateOp`]s. It is produced once,
//! either by the mutation interpreter or by parsing the wire vocabulary
//! (`$set`, `$unset`, `$push` with `$each`/`$position`, `$pull`), and is
//! consumed by exhaustive matching everywhere else: the storage layer applies
//! it, the provenance annotator derives touched fields from it.

use crate::filter::{CompilationError, Filter};
use crate::json::{
    get_at_path_mut, set_at_path, unset_at_path, value_type_name, values_equal, FieldPath,
    JsonPathError,
};
use serde_json::{Map, Value};
use thiserror::Error;

/// Error raised while parsing or applying an update
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// The update document was not an object of operators
    #[error("update must be an object of operators, found {0}")]
    NotAnObject(&'static str),

    /// A top-level key was a plain field name instead of an operator
    #[error("update key '{0}' is not an operator")]
    NotAnOperator(String),

    /// An operator outside `$set/$unset/$push/$pull`
    #[error("unknown update operator {0}")]
    UnknownOperator(String),

    /// An operator received an operand of the wrong shape
    #[error("invalid operand for {operator}: {reason}")]
    InvalidOperand {
        /// The operator
        operator: String,
        /// What was wrong
        reason: String,
    },

    /// An array operator targeted a non-array value
    #[error("cannot apply {operator} to non-array value at '{path}' ({found})")]
    NotAnArray {
        /// The operator
        operator: &'static str,
        /// Target path
        path: String,
        /// Type found at the path
        found: &'static str,
    },

    /// Traversal failed while applying the update
    #[error("path error: {0}")]
    Path(#[from] JsonPathError),

    /// A `$pull` condition failed to compile
    #[error("pull condition: {0}")]
    Condition(#[from] CompilationError),
}

/// Key used to lift a scalar array element into a document for condition tests
const PULL_VALUE_KEY: &str = "value";

/// How `$pull` selects the array elements to remove
#[derive(Debug, Clone)]
pub enum PullCriterion {
    /// Remove elements equal to the value
    Equals(Value),
    /// Remove object elements matching the filter
    Document(Filter),
    /// Remove elements satisfying operator conditions (e.g. `{"$gt": 3}`)
    Condition(Filter),
}

impl PullCriterion {
    fn from_wire(operand: &Value) -> Result<Self, UpdateError> {
        match operand {
            Value::Object(obj) if obj.keys().any(|k| k.starts_with('$')) => {
                let mut lifted = Map::new();
                lifted.insert(PULL_VALUE_KEY.to_string(), operand.clone());
                Ok(PullCriterion::Condition(Filter::compile(&Value::Object(lifted))?))
            }
            Value::Object(_) => Ok(PullCriterion::Document(Filter::compile(operand)?)),
            other => Ok(PullCriterion::Equals(other.clone())),
        }
    }

    /// Check if an array element is selected for removal
    pub fn selects(&self, element: &Value) -> bool {
        match self {
            PullCriterion::Equals(v) => values_equal(element, v),
            PullCriterion::Document(filter) => element.is_object() && filter.matches(element),
            PullCriterion::Condition(filter) => {
                let mut lifted = Map::new();
                lifted.insert(PULL_VALUE_KEY.to_string(), element.clone());
                filter.matches(&Value::Object(lifted))
            }
        }
    }
}

/// A single update operator
#[derive(Debug, Clone)]
pub enum UpdateOp {
    /// Assign a value, creating intermediate objects
    Set {
        /// Target path
        path: FieldPath,
        /// New value
        value: Value,
    },
    /// Remove a field
    Unset {
        /// Target path
        path: FieldPath,
    },
    /// Insert values into an array (created if missing)
    Push {
        /// Array path
        path: FieldPath,
        /// Values to insert, in order
        values: Vec<Value>,
        /// Insert position; `None` appends
        position: Option<usize>,
    },
    /// Remove every array element the criterion selects
    Pull {
        /// Array path
        path: FieldPath,
        /// Element selector
        criterion: PullCriterion,
    },
}

impl UpdateOp {
    /// The path this operator writes to
    pub fn path(&self) -> &FieldPath {
        match self {
            UpdateOp::Set { path, .. }
            | UpdateOp::Unset { path }
            | UpdateOp::Push { path, .. }
            | UpdateOp::Pull { path, .. } => path,
        }
    }

    fn apply(&self, doc: &mut Value) -> Result<(), UpdateError> {
        match self {
            UpdateOp::Set { path, value } => {
                set_at_path(doc, path, value.clone())?;
            }
            UpdateOp::Unset { path } => {
                unset_at_path(doc, path)?;
            }
            UpdateOp::Push {
                path,
                values,
                position,
            } => {
                if get_at_path_mut(doc, path).is_none() {
                    set_at_path(doc, path, Value::Array(Vec::new()))?;
                }
                match get_at_path_mut(doc, path) {
                    Some(Value::Array(arr)) => {
                        let at = position.unwrap_or(arr.len()).min(arr.len());
                        arr.splice(at..at, values.iter().cloned());
                    }
                    Some(other) => {
                        return Err(UpdateError::NotAnArray {
                            operator: "$push",
                            path: path.to_string(),
                            found: value_type_name(other),
                        })
                    }
                    None => {}
                }
            }
            UpdateOp::Pull { path, criterion } => match get_at_path_mut(doc, path) {
                Some(Value::Array(arr)) => arr.retain(|el| !criterion.selects(el)),
                Some(other) => {
                    return Err(UpdateError::NotAnArray {
                        operator: "$pull",
                        path: path.to_string(),
                        found: value_type_name(other),
                    })
                }
                None => {}
            },
        }
        Ok(())
    }
}

/// An ordered list of update operators
#[derive(Debug, Clone, Default)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    /// Create an empty update
    pub fn new() -> Self {
        Update { ops: Vec::new() }
    }

    /// Create an update from operators
    pub fn from_ops(ops: Vec<UpdateOp>) -> Self {
        Update { ops }
    }

    /// Append a `Set` (builder pattern)
    pub fn set(mut self, path: FieldPath, value: Value) -> Self {
        self.ops.push(UpdateOp::Set { path, value });
        self
    }

    /// Append an `Unset` (builder pattern)
    pub fn unset(mut self, path: FieldPath) -> Self {
        self.ops.push(UpdateOp::Unset { path });
        self
    }

    /// Append a `Push` (builder pattern)
    pub fn push(mut self, path: FieldPath, values: Vec<Value>, position: Option<usize>) -> Self {
        self.ops.push(UpdateOp::Push {
            path,
            values,
            position,
        });
        self
    }

    /// Append a `Pull` (builder pattern)
    pub fn pull(mut self, path: FieldPath, criterion: PullCriterion) -> Self {
        self.ops.push(UpdateOp::Pull { path, criterion });
        self
    }

    /// Append an operator
    pub fn push_op(&mut self, op: UpdateOp) {
        self.ops.push(op);
    }

    /// The operators in application order
    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    /// Check if the update has no operators
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Parse the wire vocabulary
    ///
    /// ```
    /// use livedoc_core::update::Update;
    /// use serde_json::json;
    ///
    /// let update = Update::from_wire(&json!({
    ///     "$set": {"title": "x"},
    ///     "$push": {"items": {"$each": [{"_id": "a"}], "$position": 0}},
    /// })).unwrap();
    /// assert_eq!(update.ops().len(), 2);
    /// ```
    pub fn from_wire(update: &Value) -> Result<Self, UpdateError> {
        let obj = update
            .as_object()
            .ok_or(UpdateError::NotAnObject(value_type_name(update)))?;
        let mut ops = Vec::new();
        for (operator, fields) in obj {
            if !operator.starts_with('$') {
                return Err(UpdateError::NotAnOperator(operator.clone()));
            }
            let fields = fields.as_object().ok_or_else(|| UpdateError::InvalidOperand {
                operator: operator.clone(),
                reason: "expected an object of paths".to_string(),
            })?;
            for (key, operand) in fields {
                let path = parse_path(operator, key)?;
                let op = match operator.as_str() {
                    "$set" => UpdateOp::Set {
                        path,
                        value: operand.clone(),
                    },
                    "$unset" => UpdateOp::Unset { path },
                    "$push" => parse_push(path, operand)?,
                    "$pull" => UpdateOp::Pull {
                        path,
                        criterion: PullCriterion::from_wire(operand)?,
                    },
                    other => return Err(UpdateError::UnknownOperator(other.to_string())),
                };
                ops.push(op);
            }
        }
        Ok(Update { ops })
    }

    /// Apply every operator to a document, in order
    ///
    /// Not atomic: on error the document holds the effects of the operators
    /// before the failing one.
    pub fn apply(&self, doc: &mut Value) -> Result<(), UpdateError> {
        for op in &self.ops {
            op.apply(doc)?;
        }
        Ok(())
    }
}

fn parse_path(operator: &str, key: &str) -> Result<FieldPath, UpdateError> {
    key.parse().map_err(|e| UpdateError::InvalidOperand {
        operator: operator.to_string(),
        reason: format!("{}", e),
    })
}

fn parse_push(path: FieldPath, operand: &Value) -> Result<UpdateOp, UpdateError> {
    let invalid = |reason: &str| UpdateError::InvalidOperand {
        operator: "$push".to_string(),
        reason: reason.to_string(),
    };
    match operand {
        Value::Object(obj) if obj.contains_key("$each") => {
            let values = obj
                .get("$each")
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| invalid("$each must be an array"))?;
            let position = match obj.get("$position") {
                None | Some(Value::Null) => None,
                Some(p) => Some(
                    p.as_u64()
                        .ok_or_else(|| invalid("$position must be a non-negative integer"))?
                        as usize,
                ),
            };
            Ok(UpdateOp::Push {
                path,
                values,
                position,
            })
        }
        value => Ok(UpdateOp::Push {
            path,
            values: vec![value.clone()],
            position: None,
        }),
    }
}
