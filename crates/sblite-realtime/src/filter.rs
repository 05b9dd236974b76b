//! Postgres-changes subscription filters: `column=operator.value` matched
//! against the change record with PostgREST-style coercion.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("malformed filter '{0}', expected column=operator.value")]
    Malformed(String),
    #[error("unsupported filter operator '{0}'")]
    UnknownOperator(String),
}

/// A parsed subscription filter.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl ChangeFilter {
    pub fn parse(raw: &str) -> Result<ChangeFilter, FilterError> {
        let (column, rest) = raw
            .split_once('=')
            .ok_or_else(|| FilterError::Malformed(raw.to_string()))?;
        let (op_str, value) = rest
            .split_once('.')
            .ok_or_else(|| FilterError::Malformed(raw.to_string()))?;
        let op = match op_str {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "in" => FilterOp::In,
            other => return Err(FilterError::UnknownOperator(other.to_string())),
        };
        Ok(ChangeFilter {
            column: column.trim().to_string(),
            op,
            value: value.to_string(),
        })
    }

    /// Whether the record satisfies the filter. Numbers compare numerically
    /// when both sides parse; otherwise comparison is textual.
    pub fn matches(&self, record: &Value) -> bool {
        let Some(field) = record.get(&self.column) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => compare(field, &self.value) == Some(std::cmp::Ordering::Equal),
            FilterOp::Neq => {
                matches!(compare(field, &self.value), Some(ord) if ord != std::cmp::Ordering::Equal)
            }
            FilterOp::Gt => compare(field, &self.value) == Some(std::cmp::Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(field, &self.value),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            FilterOp::Lt => compare(field, &self.value) == Some(std::cmp::Ordering::Less),
            FilterOp::Lte => matches!(
                compare(field, &self.value),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            FilterOp::In => {
                let interior = self
                    .value
                    .strip_prefix('(')
                    .and_then(|v| v.strip_suffix(')'))
                    .unwrap_or(&self.value);
                interior.split(',').any(|item| {
                    compare(field, item.trim().trim_matches('"'))
                        == Some(std::cmp::Ordering::Equal)
                })
            }
        }
    }
}

/// Compares a JSON field against a filter operand string.
fn compare(field: &Value, operand: &str) -> Option<std::cmp::Ordering> {
    match field {
        Value::Number(n) => {
            let lhs = n.as_f64()?;
            let rhs: f64 = operand.parse().ok()?;
            lhs.partial_cmp(&rhs)
        }
        Value::String(s) => {
            // Numeric coercion when both sides look like numbers.
            if let (Ok(lhs), Ok(rhs)) = (s.parse::<f64>(), operand.parse::<f64>()) {
                lhs.partial_cmp(&rhs)
            } else {
                Some(s.as_str().cmp(operand))
            }
        }
        Value::Bool(b) => {
            let rhs = match operand {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => return None,
            };
            Some(b.cmp(&rhs))
        }
        Value::Null => None,
        _ => None,
    }
}
