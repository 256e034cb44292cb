//! Command templates: `zfs set quota={quota_prefixed} {zpath}`.
//!
//! A placeholder names a field of the acting resource (`{name}`) or a field of
//! a related resource one level down (`{skel.config_file}`). `{{` and `}}`
//! produce literal braces.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::fields::FieldMap;

/// Substitute every placeholder in `template` with the matching value of `context`.
///
/// Related resources appear in `context` as nested objects. Strings are
/// inserted verbatim, numbers and booleans in their JSON spelling. A missing or
/// `null` value is an error, so that an incomplete command never runs.
pub fn render(template: &str, context: &FieldMap) -> Result<String> {
    render_with(template, context, Ok)
}

/// Like [`render`], but every substituted value is shell-quoted, so that it
/// stays one argument when the command is split.
pub fn render_command(template: &str, context: &FieldMap) -> Result<String> {
    render_with(template, context, |value| match shlex::try_quote(&value) {
        Ok(quoted) => Ok(quoted.into_owned()),
        Err(e) => bail!("Cannot pass `{}' as a command argument: {}", value, e),
    })
}

fn render_with(
    template: &str,
    context: &FieldMap,
    substitute: impl Fn(String) -> Result<String>,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut path = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => path.push(c),
                        None => bail!("Unterminated placeholder in command template `{}'", template),
                    }
                }
                out.push_str(&substitute(lookup(&path, context, template)?)?);
            }
            '}' => bail!("Unmatched `}}' in command template `{}'", template),
            c => out.push(c),
        }
    }
    Ok(out)
}

fn lookup(path: &str, context: &FieldMap, template: &str) -> Result<String> {
    let mut segments = path.split('.');
    let head = segments.next().unwrap_or_default();
    if head.is_empty() {
        bail!("Empty placeholder in command template `{}'", template);
    }
    let mut value = context.get(head);
    if let Some(field) = segments.next() {
        value = match value {
            Some(Value::Object(related)) => related.get(field),
            Some(Value::Null) | None => bail!(
                "Placeholder {{{}}}: `{}' is not set for this resource",
                path,
                head
            ),
            Some(_) => bail!(
                "Placeholder {{{}}}: `{}' is not a related resource",
                path,
                head
            ),
        };
    }
    if segments.next().is_some() {
        bail!(
            "Placeholder {{{}}} goes deeper than one related resource",
            path
        );
    }
    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(Value::Null) | None => bail!("Placeholder {{{}}} has no value", path),
        Some(other) => bail!(
            "Placeholder {{{}}} refers to a structured value: {}",
            path,
            other
        ),
    }
}
