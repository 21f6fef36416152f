//! Placeholder substitution for URLs, paths and cleaned values
//!
//! Three placeholder styles are understood:
//! - `{{ key }}` / `{{ meta.id }}`: dotted lookup, missing values render empty
//! - `{key}`: strict lookup, a missing key is an error
//! - `%(key)s`: strict lookup, same as `{key}`

use crate::{Data, Result, SumiError};
use serde_json::Value;

/// Renders a string value the way it should appear inside a URL or path
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Looks up a dotted path such as `meta.id` in the data
pub fn lookup<'a>(data: &'a Data, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Renders `{{ path }}` placeholders; unknown paths render as empty strings
///
/// ```
/// use serde_json::json;
/// use sumi_pipeline::helpers::template::render_template;
///
/// let data = json!({"meta": {"id": 7}, "name": "report"});
/// let data = data.as_object().unwrap();
/// assert_eq!(render_template("{{ meta.id }}/{{name}}.pdf", data), "7/report.pdf");
/// ```
pub fn render_template(template: &str, data: &Data) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let key = rest[start + 2..start + 2 + len].trim();
        if let Some(value) = lookup(data, key) {
            out.push_str(&value_to_string(value));
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    out
}

/// Substitutes `{key}` and `%(key)s` placeholders from the data
///
/// `{{` and `}}` are literal braces.
///
/// # Errors
///
/// [`SumiError::MetaData`] when a placeholder names a key absent from the data.
pub fn format_string(template: &str, data: &Data) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let end = template[index..]
                    .find('}')
                    .map(|offset| index + offset)
                    .ok_or_else(|| SumiError::MetaData(format!("Unclosed placeholder in {:?}", template)))?;
                let key = &template[index + 1..end];
                out.push_str(&required(data, key)?);
                while matches!(chars.peek(), Some((i, _)) if *i <= end) {
                    chars.next();
                }
            }
            '%' if template[index..].starts_with("%(") => {
                let Some(close) = template[index..].find(")s").map(|offset| index + offset) else {
                    out.push(c);
                    continue;
                };
                let key = &template[index + 2..close];
                out.push_str(&required(data, key)?);
                while matches!(chars.peek(), Some((i, _)) if *i <= close + 1) {
                    chars.next();
                }
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

fn required(data: &Data, key: &str) -> Result<String> {
    lookup(data, key.trim())
        .map(value_to_string)
        .ok_or_else(|| SumiError::MetaData(format!("Missing template variable: {}", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> Data {
        json!({"id": 42, "slug": "a-b", "meta": {"tags": ["x", "y"]}})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_render_template() {
        let data = data();
        assert_eq!(
            render_template("https://e.com/{{ slug }}/{{meta.tags.1}}", &data),
            "https://e.com/a-b/y"
        );
        assert_eq!(render_template("{{ missing }}-{{id}}", &data), "-42");
        assert_eq!(render_template("no placeholders", &data), "no placeholders");
    }

    #[test]
    fn test_format_string_styles() {
        let data = data();
        assert_eq!(
            format_string("https://e.com/{slug}?id=%(id)s", &data).unwrap(),
            "https://e.com/a-b?id=42"
        );
        assert_eq!(format_string("{{literal}}", &data).unwrap(), "{literal}");
        assert_eq!(format_string("100%", &data).unwrap(), "100%");
    }

    #[test]
    fn test_format_string_missing_key() {
        let data = data();
        assert!(matches!(
            format_string("https://e.com/{nope}", &data),
            Err(SumiError::MetaData(_))
        ));
        assert!(format_string("%(nope)s", &data).is_err());
    }
}
