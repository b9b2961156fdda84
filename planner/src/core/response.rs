//! Tolerant decoding of loosely structured oracle responses.
//!
//! Strategies, in order:
//! 1. the whole text as JSON,
//! 2. each fenced code block (```` ```json ````),
//! 3. the outermost `{ ... }` substring.
//!
//! A candidate is accepted only if it parses, validates against the response
//! schema, and deserializes into the target type. When every strategy fails
//! the caller gets a [`ParseFailure`] listing what was tried.

use std::sync::LazyLock;

use jsonschema::Validator;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::types::{CompileResponse, GenerateResponse};
use crate::error::ParseFailure;

const COMPILE_RESPONSE_SCHEMA: &str =
    include_str!("../../schemas/compile_response.schema.json");
const GENERATE_RESPONSE_SCHEMA: &str =
    include_str!("../../schemas/generate_response.schema.json");

static COMPILE_VALIDATOR: LazyLock<Validator> =
    LazyLock::new(|| compile_schema(COMPILE_RESPONSE_SCHEMA));
static GENERATE_VALIDATOR: LazyLock<Validator> =
    LazyLock::new(|| compile_schema(GENERATE_RESPONSE_SCHEMA));

static FENCE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)```").expect("fence regex is valid")
});

fn compile_schema(raw: &str) -> Validator {
    let value: Value = serde_json::from_str(raw).expect("embedded schema is valid json");
    jsonschema::validator_for(&value).expect("embedded schema compiles")
}

pub fn parse_compile_response(text: &str) -> Result<CompileResponse, ParseFailure> {
    parse_response(text, &COMPILE_VALIDATOR)
}

pub fn parse_generate_response(text: &str) -> Result<GenerateResponse, ParseFailure> {
    parse_response(text, &GENERATE_VALIDATOR)
}

pub fn parse_response<T: DeserializeOwned>(
    text: &str,
    validator: &Validator,
) -> Result<T, ParseFailure> {
    let mut attempts = Vec::new();

    match decode(text.trim(), validator) {
        Ok(value) => return Ok(value),
        Err(err) => attempts.push(format!("strict: {err}")),
    }

    let mut fenced = 0;
    for caps in FENCE_RE.captures_iter(text) {
        fenced += 1;
        let body = caps.get(1).map_or("", |m| m.as_str());
        match decode(body.trim(), validator) {
            Ok(value) => return Ok(value),
            Err(err) => attempts.push(format!("fenced block {fenced}: {err}")),
        }
    }
    if fenced == 0 {
        attempts.push("fenced: no code block".to_string());
    }

    match outermost_object(text) {
        Some(candidate) => match decode(candidate, validator) {
            Ok(value) => return Ok(value),
            Err(err) => attempts.push(format!("substring: {err}")),
        },
        None => attempts.push("substring: no braces".to_string()),
    }

    Err(ParseFailure { attempts })
}

fn decode<T: DeserializeOwned>(candidate: &str, validator: &Validator) -> Result<T, String> {
    let value: Value = serde_json::from_str(candidate).map_err(|err| err.to_string())?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(format!("schema: {}", messages.join(", ")));
    }
    serde_json::from_value(value).map_err(|err| err.to_string())
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
