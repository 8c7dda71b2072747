// Coarse-grained edit operations over a page's JSON content tree.
//
// Paths are JSON Pointers (RFC 6901). Operations describe *what changed*;
// two writers touching the same field resolve by whichever edit wins the
// version race (last writer wins per field).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A single change to a document snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditOperation {
    /// Create or overwrite the value at `path`, creating parent objects as needed.
    SetField { path: String, value: Value },
    /// Remove the object key or array element at `path`.
    RemoveField { path: String },
    /// Insert `value` into the array at `path` before `index`.
    InsertItem { path: String, index: usize, value: Value },
    /// Remove the element at `index` from the array at `path`.
    RemoveItem { path: String, index: usize },
    /// Replace the whole snapshot.
    ReplaceDocument { value: Value },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("invalid field path `{0}`: must be empty or start with `/`")]
    InvalidPath(String),
    #[error("field path `{0}` does not exist")]
    PathNotFound(String),
    #[error("value at `{0}` is not an object or array")]
    NotAContainer(String),
    #[error("value at `{0}` is not an array")]
    NotAnArray(String),
    #[error("index {index} is out of bounds for `{path}` (len {len})")]
    IndexOutOfBounds { path: String, index: usize, len: usize },
    #[error("the document root cannot be removed")]
    RootNotRemovable,
}

impl EditOperation {
    /// The field path this operation targets (empty for the document root).
    pub fn target_path(&self) -> &str {
        match self {
            Self::SetField { path, .. }
            | Self::RemoveField { path }
            | Self::InsertItem { path, .. }
            | Self::RemoveItem { path, .. } => path,
            Self::ReplaceDocument { .. } => "",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetField { .. } => "set_field",
            Self::RemoveField { .. } => "remove_field",
            Self::InsertItem { .. } => "insert_item",
            Self::RemoveItem { .. } => "remove_item",
            Self::ReplaceDocument { .. } => "replace_document",
        }
    }

    /// Apply this operation to `state` in place.
    ///
    /// On error `state` is left untouched.
    pub fn apply(&self, state: &mut Value) -> Result<(), OperationError> {
        match self {
            Self::SetField { path, value } => {
                let tokens = parse_pointer(path)?;
                let Some((last, parents)) = tokens.split_last() else {
                    *state = value.clone();
                    return Ok(());
                };
                // Validate the whole walk before creating anything.
                check_creatable(state, parents, path)?;
                let parent = walk_creating(state, parents, path)?;
                set_child(parent, last, value.clone(), path)
            }
            Self::RemoveField { path } => {
                let tokens = parse_pointer(path)?;
                let Some((last, parents)) = tokens.split_last() else {
                    return Err(OperationError::RootNotRemovable);
                };
                let parent = walk_existing(state, parents, path)?;
                remove_child(parent, last, path)
            }
            Self::InsertItem { path, index, value } => {
                let tokens = parse_pointer(path)?;
                let target = walk_existing(state, &tokens, path)?;
                let Value::Array(items) = target else {
                    return Err(OperationError::NotAnArray(path.clone()));
                };
                if *index > items.len() {
                    return Err(OperationError::IndexOutOfBounds {
                        path: path.clone(),
                        index: *index,
                        len: items.len(),
                    });
                }
                items.insert(*index, value.clone());
                Ok(())
            }
            Self::RemoveItem { path, index } => {
                let tokens = parse_pointer(path)?;
                let target = walk_existing(state, &tokens, path)?;
                let Value::Array(items) = target else {
                    return Err(OperationError::NotAnArray(path.clone()));
                };
                if *index >= items.len() {
                    return Err(OperationError::IndexOutOfBounds {
                        path: path.clone(),
                        index: *index,
                        len: items.len(),
                    });
                }
                items.remove(*index);
                Ok(())
            }
            Self::ReplaceDocument { value } => {
                *state = value.clone();
                Ok(())
            }
        }
    }
}

/// Replay operations in order, as a lagging client does after `sync`.
pub fn replay<'a>(
    state: &mut Value,
    operations: impl IntoIterator<Item = &'a EditOperation>,
) -> Result<(), OperationError> {
    for operation in operations {
        operation.apply(state)?;
    }
    Ok(())
}

fn parse_pointer(path: &str) -> Result<Vec<String>, OperationError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(OperationError::InvalidPath(path.to_owned()));
    };
    Ok(rest.split('/').map(|token| token.replace("~1", "/").replace("~0", "~")).collect())
}

fn array_index(token: &str, len: usize, path: &str) -> Result<usize, OperationError> {
    let index = token.parse::<usize>().map_err(|_| OperationError::PathNotFound(path.to_owned()))?;
    if index >= len {
        return Err(OperationError::IndexOutOfBounds { path: path.to_owned(), index, len });
    }
    Ok(index)
}

fn walk_existing<'v>(
    mut current: &'v mut Value,
    tokens: &[String],
    path: &str,
) -> Result<&'v mut Value, OperationError> {
    for token in tokens {
        current = match current {
            Value::Object(map) => {
                map.get_mut(token).ok_or_else(|| OperationError::PathNotFound(path.to_owned()))?
            }
            Value::Array(items) => {
                let index = array_index(token, items.len(), path)?;
                &mut items[index]
            }
            _ => return Err(OperationError::NotAContainer(path.to_owned())),
        };
    }
    Ok(current)
}

fn check_creatable(state: &Value, tokens: &[String], path: &str) -> Result<(), OperationError> {
    let mut current = state;
    for token in tokens {
        current = match current {
            Value::Object(map) => match map.get(token) {
                Some(child) => child,
                None => return Ok(()),
            },
            Value::Array(items) => &items[array_index(token, items.len(), path)?],
            _ => return Err(OperationError::NotAContainer(path.to_owned())),
        };
    }
    match current {
        Value::Object(_) | Value::Array(_) => Ok(()),
        _ => Err(OperationError::NotAContainer(path.to_owned())),
    }
}

fn walk_creating<'v>(
    mut current: &'v mut Value,
    tokens: &[String],
    path: &str,
) -> Result<&'v mut Value, OperationError> {
    for token in tokens {
        current = match current {
            Value::Object(map) => {
                map.entry(token.clone()).or_insert_with(|| Value::Object(Map::new()))
            }
            Value::Array(items) => {
                let index = array_index(token, items.len(), path)?;
                &mut items[index]
            }
            _ => return Err(OperationError::NotAContainer(path.to_owned())),
        };
    }
    Ok(current)
}

fn set_child(parent: &mut Value, key: &str, value: Value, path: &str) -> Result<(), OperationError> {
    match parent {
        Value::Object(map) => {
            map.insert(key.to_owned(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(key, items.len(), path)?;
            items[index] = value;
            Ok(())
        }
        _ => Err(OperationError::NotAContainer(path.to_owned())),
    }
}

fn remove_child(parent: &mut Value, key: &str, path: &str) -> Result<(), OperationError> {
    match parent {
        Value::Object(map) => map
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| OperationError::PathNotFound(path.to_owned())),
        Value::Array(items) => {
            let index = array_index(key, items.len(), path)?;
            items.remove(index);
            Ok(())
        }
        _ => Err(OperationError::NotAContainer(path.to_owned())),
    }
}
