//! Multi-document YAML to untyped object trees.
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure to turn a YAML stream into manifest items.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The stream isn't valid YAML.
    #[error("malformed YAML in document {document}: {message}")]
    MalformedYaml {
        /// Zero-based index of the offending document.
        document: usize,
        /// Parser message.
        message: String,
    },
    /// A document parsed, but isn't a mapping with string keys.
    #[error("document {document} can't be represented as an object: {message}")]
    UnsupportedShape {
        /// Zero-based index of the offending document.
        document: usize,
        /// What was wrong with it.
        message: String,
    },
}

/// Parses a YAML stream into an ordered list of objects.
///
/// Empty, comment-only and `null` documents are skipped, `List` documents are
/// replaced by their items. Either the whole stream converts or nothing does.
pub fn parse_yaml(bytes: &[u8]) -> Result<Vec<Map<String, Value>>, ParseError> {
    let mut items = Vec::new();

    for (document, de) in serde_yaml::Deserializer::from_slice(bytes).enumerate() {
        let yaml = serde_yaml::Value::deserialize(de).map_err(|e| ParseError::MalformedYaml {
            document,
            message: e.to_string(),
        })?;
        if yaml.is_null() {
            continue;
        }

        let json = serde_json::to_value(&yaml).map_err(|e| ParseError::UnsupportedShape {
            document,
            message: e.to_string(),
        })?;
        push_object(&mut items, json, document)?;
    }

    Ok(items)
}

fn push_object(
    items: &mut Vec<Map<String, Value>>,
    value: Value,
    document: usize,
) -> Result<(), ParseError> {
    let object = match value {
        Value::Object(object) => object,
        Value::Null => return Ok(()),
        other => {
            return Err(ParseError::UnsupportedShape {
                document,
                message: format!("expected a mapping, found {}", shape(&other)),
            })
        }
    };
    if object.is_empty() {
        return Ok(());
    }

    if !is_list(&object) {
        items.push(object);
        return Ok(());
    }

    match object.get("items") {
        Some(Value::Array(list)) => {
            for item in list.iter().cloned() {
                push_object(items, item, document)?;
            }
            Ok(())
        }
        None | Some(Value::Null) => Ok(()),
        Some(other) => Err(ParseError::UnsupportedShape {
            document,
            message: format!("list items must be a sequence, found {}", shape(other)),
        }),
    }
}

/// `v1/List`, `meta/v1` lists and friends wrap other objects in `items`.
fn is_list(object: &Map<String, Value>) -> bool {
    let api_version = object
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let kind = object.get("kind").and_then(Value::as_str).unwrap_or_default();

    kind.ends_with("List") && (api_version == "v1" || api_version.contains("meta/v1"))
}

fn shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}
