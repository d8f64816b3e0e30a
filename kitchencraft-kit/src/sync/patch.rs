//! Structural patches between snapshots
//!
//! Patches are ordered lists of `add`/`replace`/`remove` operations on JSON
//! pointer paths (the RFC 6902 subset the wire format uses). `diff` produces
//! the operations that turn one snapshot into the next; `apply_patch`
//! replays them on a receiver's cached copy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One structural patch operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Remove { path }
            | PatchOp::Replace { path, .. } => path,
        }
    }
}

/// Errors raised while applying a patch
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PatchError {
    #[error("invalid pointer: {0}")]
    InvalidPointer(String),

    #[error("no value at {0}")]
    MissingTarget(String),

    #[error("index {index} out of bounds at {path}")]
    IndexOutOfBounds { path: String, index: usize },
}

/// Compute the operations that transform `prev` into `next`
///
/// Object members are compared key by key, arrays index by index with
/// trailing elements appended or removed from the end. Anything else that
/// differs is replaced wholesale.
pub fn diff(prev: &Value, next: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    let mut path = String::new();
    diff_into(&mut path, prev, next, &mut ops);
    ops
}

fn diff_into(path: &mut String, prev: &Value, next: &Value, ops: &mut Vec<PatchOp>) {
    if prev == next {
        return;
    }

    match (prev, next) {
        (Value::Object(before), Value::Object(after)) => {
            for (key, old) in before {
                let len = path.len();
                push_token(path, key);
                match after.get(key) {
                    Some(new) => diff_into(path, old, new, ops),
                    None => ops.push(PatchOp::Remove { path: path.clone() }),
                }
                path.truncate(len);
            }
            for (key, new) in after {
                if !before.contains_key(key) {
                    let len = path.len();
                    push_token(path, key);
                    ops.push(PatchOp::Add {
                        path: path.clone(),
                        value: new.clone(),
                    });
                    path.truncate(len);
                }
            }
        }
        (Value::Array(before), Value::Array(after)) => {
            let common = before.len().min(after.len());
            for index in 0..common {
                let len = path.len();
                push_token(path, &index.to_string());
                diff_into(path, &before[index], &after[index], ops);
                path.truncate(len);
            }
            if after.len() > before.len() {
                for (index, value) in after.iter().enumerate().skip(common) {
                    ops.push(PatchOp::Add {
                        path: format!("{path}/{index}"),
                        value: value.clone(),
                    });
                }
            } else {
                // Highest index first so earlier indices stay valid.
                for index in (common..before.len()).rev() {
                    ops.push(PatchOp::Remove {
                        path: format!("{path}/{index}"),
                    });
                }
            }
        }
        _ => ops.push(PatchOp::Replace {
            path: path.clone(),
            value: next.clone(),
        }),
    }
}

fn push_token(path: &mut String, token: &str) {
    path.push('/');
    for ch in token.chars() {
        match ch {
            '~' => path.push_str("~0"),
            '/' => path.push_str("~1"),
            other => path.push(other),
        }
    }
}

fn parse_pointer(pointer: &str) -> Result<Vec<String>, PatchError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let rest = pointer
        .strip_prefix('/')
        .ok_or_else(|| PatchError::InvalidPointer(pointer.to_string()))?;
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn parse_index(token: &str, path: &str) -> Result<usize, PatchError> {
    token
        .parse::<usize>()
        .map_err(|_| PatchError::InvalidPointer(path.to_string()))
}

fn resolve_mut<'a>(
    doc: &'a mut Value,
    tokens: &[String],
    path: &str,
) -> Result<&'a mut Value, PatchError> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| PatchError::MissingTarget(path.to_string()))?,
            Value::Array(items) => {
                let index = parse_index(token, path)?;
                let len = items.len();
                items.get_mut(index).ok_or(PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                    index: index.max(len),
                })?
            }
            _ => return Err(PatchError::MissingTarget(path.to_string())),
        };
    }
    Ok(current)
}

fn apply_one(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let path = op.path();
    let tokens = parse_pointer(path)?;

    let Some((last, parents)) = tokens.split_last() else {
        // Root pointer.
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                *doc = value.clone();
                Ok(())
            }
            PatchOp::Remove { .. } => Err(PatchError::InvalidPointer(path.to_string())),
        };
    };

    let parent = resolve_mut(doc, parents, path)?;
    match (op, parent) {
        (PatchOp::Add { value, .. }, Value::Object(map)) => {
            map.insert(last.clone(), value.clone());
        }
        (PatchOp::Add { value, .. }, Value::Array(items)) => {
            if last == "-" {
                items.push(value.clone());
            } else {
                let index = parse_index(last, path)?;
                if index > items.len() {
                    return Err(PatchError::IndexOutOfBounds {
                        path: path.to_string(),
                        index,
                    });
                }
                items.insert(index, value.clone());
            }
        }
        (PatchOp::Remove { .. }, Value::Object(map)) => {
            map.remove(last)
                .ok_or_else(|| PatchError::MissingTarget(path.to_string()))?;
        }
        (PatchOp::Remove { .. }, Value::Array(items)) => {
            let index = parse_index(last, path)?;
            if index >= items.len() {
                return Err(PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                });
            }
            items.remove(index);
        }
        (PatchOp::Replace { value, .. }, parent) => {
            let target = resolve_mut(parent, std::slice::from_ref(last), path)?;
            *target = value.clone();
        }
        _ => return Err(PatchError::MissingTarget(path.to_string())),
    }
    Ok(())
}

/// Apply `ops` in order to a copy of `doc`
///
/// Either every operation applies and the new value is returned, or the
/// first failure is reported and `doc` is left untouched.
pub fn apply_patch(doc: &Value, ops: &[PatchOp]) -> Result<Value, PatchError> {
    let mut next = doc.clone();
    for op in ops {
        apply_one(&mut next, op)?;
    }
    Ok(next)
}
