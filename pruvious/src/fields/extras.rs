//! Named sanitizers and validators that field declarations opt into with
//! `sanitizers: [...]` / `validators: [...]`.

use super::*;
use regex::Regex;
use std::sync::OnceLock;

pub fn register_extras(registry: &mut FieldRegistry) {
    registry.register_sanitizer("trim", Sanitizer::on(Operations::WRITE, trim));
    registry.register_sanitizer("lowercase", Sanitizer::on(Operations::WRITE, lowercase));
    registry.register_sanitizer("uppercase", Sanitizer::on(Operations::WRITE, uppercase));
    registry.register_sanitizer("collapse", Sanitizer::on(Operations::WRITE, collapse));

    registry.register_validator("email", Validator::always(email));
    registry.register_validator("url", Validator::always(url));
    registry.register_validator("pattern", Validator::always(pattern));
}

fn map_string(value: Value, f: impl Fn(&str) -> String) -> std::result::Result<Value, String> {
    match value {
        Value::String(s) => Ok(Value::String(f(&s))),
        other => Ok(other),
    }
}

fn trim(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    map_string(value, |s| s.trim().to_string())
}

fn lowercase(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    map_string(value, str::to_lowercase)
}

fn uppercase(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    map_string(value, str::to_uppercase)
}

/// Collapse runs of whitespace into single spaces.
fn collapse(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    map_string(value, |s| s.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn email(_ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    match value.as_str() {
        None | Some("") => Ok(()),
        Some(s) => match cached(&EMAIL, r"^[^\s@]+@[^\s@]+\.[^\s@]+$") {
            Some(re) if re.is_match(s) => Ok(()),
            _ => Err("Invalid email address".into()),
        },
    }
}

fn url(_ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    static URL: OnceLock<Option<Regex>> = OnceLock::new();
    match value.as_str() {
        None | Some("") => Ok(()),
        Some(s) => match cached(&URL, r"^(https?://[^\s/$.?#][^\s]*|/[^\s]*|#[^\s]*)$") {
            Some(re) if re.is_match(s) => Ok(()),
            _ => Err("Invalid URL".into()),
        },
    }
}

/// Match against the field's `pattern` option.
fn pattern(ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    let (Some(s), Some(source)) = (value.as_str(), ctx.option_str("pattern")) else {
        return Ok(());
    };
    if s.is_empty() {
        return Ok(());
    }
    let re = Regex::new(source).map_err(|e| format!("Invalid pattern: {e}"))?;
    if re.is_match(s) {
        Ok(())
    } else {
        Err(ctx
            .option_str("patternMessage")
            .unwrap_or("The value does not match the required format")
            .to_string())
    }
}
