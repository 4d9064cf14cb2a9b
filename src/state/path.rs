//! Dot-path addressing into the state document.
//!
//! Segments address record keys; a numeric segment also indexes into a
//! list (`tracks.items.0.title`).

use crate::types::{Error, Result};
use crate::value::{Record, Value};

/// Split a path into segments. The empty path addresses the root.
pub(crate) fn split(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::validation(format!("malformed path '{path}'")));
    }
    Ok(segments)
}

/// Split a path that must name something below the root.
pub(crate) fn split_writable(path: &str) -> Result<Vec<&str>> {
    let segments = split(path)?;
    if segments.is_empty() {
        return Err(Error::validation("cannot write the document root"));
    }
    Ok(segments)
}

/// Bus topic echoing changes of one path: `ui.zoom` -> `state:ui:zoom`.
pub fn derived_topic(path: &str) -> String {
    format!("state:{}", path.replace('.', ":"))
}

fn child<'a>(node: &'a Value, segment: &str) -> Option<&'a Value> {
    match node {
        Value::Record(r) => r.get(segment),
        Value::List(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn child_mut<'a>(node: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match node {
        Value::Record(r) => r.get_mut(segment),
        Value::List(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    }
}

/// Read the value at `segments`, `None` if any segment is missing.
pub(crate) fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |node, segment| child(node, segment))
}

/// Write `value` at `segments`, creating missing intermediate records.
/// Returns the displaced value.
///
/// Fails without modifying anything when an intermediate node is neither a
/// record nor a list, or a list index is out of bounds.
pub(crate) fn write(root: &mut Value, segments: &[&str], value: Value) -> Result<Option<Value>> {
    let Some((last, parents)) = segments.split_last() else {
        return Err(Error::validation("cannot write the document root"));
    };

    check_writable(root, parents, last)?;

    let mut node = root;
    for segment in parents {
        let current = node;
        if let Value::Record(r) = current {
            r.entry((*segment).to_string())
                .or_insert_with(|| Value::Record(Record::new()));
        }
        node = child_mut(current, segment)
            .ok_or_else(|| Error::internal(format!("path segment '{segment}' vanished")))?;
    }

    match node {
        Value::Record(r) => Ok(r.insert((*last).to_string(), value)),
        Value::List(items) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| Error::internal(format!("list index '{last}' vanished")))?;
            Ok(Some(std::mem::replace(slot, value)))
        }
        _ => Err(Error::internal("write target is not a container")),
    }
}

/// Walk the path without mutating, so a failed write leaves the tree alone.
fn check_writable(root: &Value, parents: &[&str], last: &str) -> Result<()> {
    let mut node = Some(root);
    for segment in parents {
        match node {
            // Missing intermediates are created as records.
            None => return Ok(()),
            Some(Value::Record(r)) => node = r.get(*segment),
            Some(Value::List(items)) => {
                let index = parse_index(segment, items.len())?;
                node = items.get(index);
            }
            Some(other) => {
                return Err(Error::validation(format!(
                    "path segment '{segment}' goes through a {}",
                    other.type_name()
                )))
            }
        }
    }
    match node {
        None | Some(Value::Record(_)) => Ok(()),
        Some(Value::List(items)) => parse_index(last, items.len()).map(|_| ()),
        Some(other) => Err(Error::validation(format!(
            "cannot set '{last}' on a {}",
            other.type_name()
        ))),
    }
}

fn parse_index(segment: &str, len: usize) -> Result<usize> {
    match segment.parse::<usize>() {
        Ok(i) if i < len => Ok(i),
        _ => Err(Error::validation(format!(
            "list index '{segment}' out of bounds (len {len})"
        ))),
    }
}

/// Remove the value at `segments`. Only record keys can be removed.
pub(crate) fn remove(root: &mut Value, segments: &[&str]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    let mut node = root;
    for segment in parents {
        node = child_mut(node, segment)?;
    }
    node.as_record_mut().and_then(|r| r.remove(*last))
}
