//! Template references between workflow steps.
//!
//! Config strings may embed `{{steps.<id|index>.<path>}}` (output of an
//! earlier step) or `{{params.<path>}}` (job parameters). Paths are
//! dot-separated; numeric segments index arrays.
//!
//! A string that is exactly one reference is replaced by the referenced
//! value with its JSON type intact. References inside a longer string are
//! interpolated as text.

use serde_json::Value;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("malformed template in '{0}'")]
    Malformed(String),
    #[error("unknown template root in '{0}', expected steps.* or params.*")]
    UnknownRoot(String),
    #[error("'{reference}' refers to step '{step}' which does not run before this one")]
    ForwardReference { reference: String, step: String },
    #[error("'{reference}' refers to unknown step '{step}'")]
    UnknownStep { reference: String, step: String },
    #[error("'{reference}' refers to step '{step}' which did not complete")]
    StepNotCompleted { reference: String, step: String },
    #[error("'{reference}' resolved to nothing")]
    MissingValue { reference: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Root {
    /// Step id or zero-based index
    Step(String),
    Params,
}

/// One parsed `{{...}}` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub raw: String,
    pub root: Root,
    pub path: Vec<String>,
}

impl Reference {
    pub fn parse(expr: &str) -> Result<Self, TemplateError> {
        let raw = expr.trim().to_string();
        let mut segments = raw.split('.');
        let root = match segments.next() {
            Some("steps") => match segments.next() {
                Some(step) if !step.is_empty() => Root::Step(step.to_string()),
                _ => return Err(TemplateError::Malformed(raw)),
            },
            Some("params") => Root::Params,
            _ => return Err(TemplateError::UnknownRoot(raw)),
        };
        let path: Vec<String> = segments.map(str::to_string).collect();
        if path.iter().any(|s| s.is_empty()) {
            return Err(TemplateError::Malformed(raw));
        }
        Ok(Self { raw, root, path })
    }
}

/// What a step is allowed to see while its config is resolved
#[derive(Debug, Clone, Copy)]
pub struct TemplateScope<'a> {
    pub params: &'a Value,
    /// Ids of every step in the workflow, in order
    pub step_ids: &'a [String],
    /// Outputs of completed steps, aligned with `step_ids`
    pub outputs: &'a [Option<Value>],
    /// Index of the step being resolved
    pub current: usize,
}

impl<'a> TemplateScope<'a> {
    fn step_index(&self, reference: &Reference, step: &str) -> Result<usize, TemplateError> {
        let index = match step.parse::<usize>() {
            Ok(i) if i < self.step_ids.len() => Some(i),
            Ok(_) => None,
            Err(_) => self.step_ids.iter().position(|id| id == step),
        };
        let index = index.ok_or_else(|| TemplateError::UnknownStep {
            reference: reference.raw.clone(),
            step: step.to_string(),
        })?;
        if index >= self.current {
            return Err(TemplateError::ForwardReference {
                reference: reference.raw.clone(),
                step: step.to_string(),
            });
        }
        Ok(index)
    }

    /// Check that a reference only points backwards, without needing outputs
    pub fn check(&self, reference: &Reference) -> Result<(), TemplateError> {
        if let Root::Step(step) = &reference.root {
            self.step_index(reference, step)?;
        }
        Ok(())
    }

    pub fn lookup(&self, reference: &Reference) -> Result<&'a Value, TemplateError> {
        let base = match &reference.root {
            Root::Params => self.params,
            Root::Step(step) => {
                let index = self.step_index(reference, step)?;
                self.outputs
                    .get(index)
                    .and_then(Option::as_ref)
                    .ok_or_else(|| TemplateError::StepNotCompleted {
                        reference: reference.raw.clone(),
                        step: step.clone(),
                    })?
            }
        };
        walk(base, &reference.path).ok_or_else(|| TemplateError::MissingValue {
            reference: reference.raw.clone(),
        })
    }
}

fn walk<'v>(mut value: &'v Value, path: &[String]) -> Option<&'v Value> {
    for segment in path {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    // An explicit null is treated as absent
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}

/// Split a string into literal text and reference spans
fn scan(s: &str) -> Result<Vec<Piece<'_>>, TemplateError> {
    let mut pieces = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            pieces.push(Piece::Text(&rest[..start]));
        }
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| TemplateError::Malformed(s.to_string()))?;
        pieces.push(Piece::Ref(&after[..end]));
        rest = &after[end + CLOSE.len()..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

enum Piece<'a> {
    Text(&'a str),
    Ref(&'a str),
}

/// Every reference in a config value, depth first
pub fn references(config: &Value) -> Result<Vec<Reference>, TemplateError> {
    let mut out = Vec::new();
    collect(config, &mut out)?;
    Ok(out)
}

fn collect(value: &Value, out: &mut Vec<Reference>) -> Result<(), TemplateError> {
    match value {
        Value::String(s) => {
            for piece in scan(s)? {
                if let Piece::Ref(expr) = piece {
                    out.push(Reference::parse(expr)?);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Substitute every reference in `config`
pub fn resolve(config: &Value, scope: &TemplateScope<'_>) -> Result<Value, TemplateError> {
    match config {
        Value::String(s) => resolve_str(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve(item, scope)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_str(s: &str, scope: &TemplateScope<'_>) -> Result<Value, TemplateError> {
    let pieces = scan(s)?;
    match pieces.as_slice() {
        [] => Ok(Value::String(String::new())),
        [Piece::Text(text)] => Ok(Value::String((*text).to_string())),
        [Piece::Ref(expr)] => {
            let reference = Reference::parse(expr)?;
            scope.lookup(&reference).cloned()
        }
        _ => {
            let mut out = String::with_capacity(s.len());
            for piece in pieces {
                match piece {
                    Piece::Text(text) => out.push_str(text),
                    Piece::Ref(expr) => {
                        let reference = Reference::parse(expr)?;
                        match scope.lookup(&reference)? {
                            Value::String(v) => out.push_str(v),
                            v => out.push_str(&v.to_string()),
                        }
                    }
                }
            }
            Ok(Value::String(out))
        }
    }
}
