use derive_more::{Display, Error};
use miette::Diagnostic;
use serde_json::Value;
use std::{collections::HashMap, path::PathBuf};

/// Error type of [`resolve_package_reference`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum PlaceholderError {
    #[display("Reference {value:?} is missing a closing brace")]
    UnclosedPlaceholder { value: String },
    #[display("Malformed package placeholder {placeholder:?}")]
    MalformedPlaceholder { placeholder: String },
    #[display("Reference {value:?} contains more than one placeholder")]
    MultiplePlaceholders { value: String },
    #[display("Reference names unknown package {name:?}")]
    UnknownPackage { name: String },
}

const PLACEHOLDER_OPEN: &str = "${";

/// Resolve a `${packages.<name>}` or `${packages.<subtype>.<name>}`
/// placeholder against `package_paths`, keeping any text around it.
///
/// Strings without a placeholder are returned unchanged. At most one
/// placeholder per value is supported.
pub fn resolve_package_reference(
    value: &str,
    package_paths: &HashMap<String, PathBuf>,
) -> Result<String, PlaceholderError> {
    let Some(open) = value.find(PLACEHOLDER_OPEN) else {
        return Ok(value.to_string());
    };
    let after_open = &value[open + PLACEHOLDER_OPEN.len()..];
    let Some(close) = after_open.find('}') else {
        return Err(PlaceholderError::UnclosedPlaceholder { value: value.to_string() });
    };
    let placeholder = &after_open[..close];
    let rest = &after_open[close + 1..];
    if rest.contains(PLACEHOLDER_OPEN) {
        return Err(PlaceholderError::MultiplePlaceholders { value: value.to_string() });
    }

    let malformed = || PlaceholderError::MalformedPlaceholder { placeholder: placeholder.to_string() };
    let mut segments = placeholder.split('.');
    if segments.next() != Some("packages") {
        return Err(malformed());
    }
    // either `packages.<name>` or `packages.<subtype>.<name>`
    let name = match (segments.next(), segments.next(), segments.next()) {
        (Some(name), None, _) if !name.is_empty() => name,
        (Some(subtype), Some(name), None) if !subtype.is_empty() && !name.is_empty() => name,
        _ => return Err(malformed()),
    };

    let path = package_paths
        .get(name)
        .ok_or_else(|| PlaceholderError::UnknownPackage { name: name.to_string() })?;
    Ok(format!("{prefix}{path}{rest}", prefix = &value[..open], path = path.display()))
}

/// Walk a JSON config value, resolving package placeholders in every string.
///
/// Non-string leaves are left untouched.
pub fn resolve_references_in_value(
    value: &mut Value,
    package_paths: &HashMap<String, PathBuf>,
) -> Result<(), PlaceholderError> {
    match value {
        Value::String(text) => {
            *text = resolve_package_reference(text, package_paths)?;
        }
        Value::Array(items) => {
            for item in items {
                resolve_references_in_value(item, package_paths)?;
            }
        }
        Value::Object(fields) => {
            for (_, field) in fields {
                resolve_references_in_value(field, package_paths)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}
