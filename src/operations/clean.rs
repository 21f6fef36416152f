use crate::context::Context;
use crate::helpers::template::render_template;
use crate::operations::ensure_list;
use crate::pipeline::Operation;
use crate::{Data, Result, SumiError};
use async_trait::async_trait;
use serde_json::Value;

/// Cleans item metadata before it is stored
///
/// Applied in order:
/// - `drop`: keys to remove
/// - `defaults`: `{ key = value }` set where the key is missing
/// - `values`: `{ key = { old = new } }` rewrites a matching value, or
///   `{ key = "{{ template }}" }` renders a new value from the item
/// - `required`: keys that must be present; missing ones are reported as
///   warnings, the item is still passed on
pub struct Clean;

#[async_trait]
impl Operation for Clean {
    async fn execute(&self, ctx: &Context, mut data: Data) -> Result<()> {
        for key in ensure_list(ctx.get("drop")) {
            if let Some(key) = key.as_str() {
                data.remove(key);
            }
        }

        if let Some(Value::Object(defaults)) = ctx.get("defaults") {
            for (key, value) in defaults {
                data.entry(key).or_insert(value);
            }
        }

        if let Some(Value::Object(values)) = ctx.get("values") {
            for (key, rewrite) in values {
                match rewrite {
                    Value::Object(mapping) => {
                        let current = data.get(&key).and_then(|v| match v {
                            Value::String(s) => Some(s.clone()),
                            Value::Number(n) => Some(n.to_string()),
                            Value::Bool(b) => Some(b.to_string()),
                            _ => None,
                        });
                        if let Some(new) = current.and_then(|current| mapping.get(&current)) {
                            data.insert(key, new.clone());
                        }
                    }
                    Value::String(template) => {
                        let rendered = render_template(&template, &data);
                        data.insert(key, Value::String(rendered));
                    }
                    other => ctx.emit_warning(&format!("Ignoring value rewrite for {}: {}", key, other)),
                }
            }
        }

        for key in ensure_list(ctx.get("required")) {
            if let Some(key) = key.as_str() {
                if !data.contains_key(key) {
                    let err = SumiError::MetaData(format!("`{}` required but missing", key));
                    ctx.emit_warning(&err.to_string());
                }
            }
        }

        ctx.emit(data)
    }
}
