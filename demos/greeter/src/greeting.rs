//! The greeting itself, independent of transport and telemetry.
use serde::Deserialize;
use std::borrow::Cow;

const DEFAULT_NAME: &str = "World";

/// Why a JSON greeting request fell back to the default greeting.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DecodeError {
    /// The request body could not be read.
    #[error("failed to read request body: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The body is not a JSON object of the expected shape.
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),

    /// The body parsed but `name` is absent or empty.
    #[error("request body has no name")]
    MissingName,
}

#[derive(Debug, Deserialize)]
struct GreetingRequest {
    #[serde(default)]
    name: Option<String>,
}

/// Greeting for the query-string variant: `Hello, World!\n`, or
/// `Hello, <name>!\n` when a non-empty `name` parameter is present.
///
/// Only the first `name` parameter counts. The name is echoed as given.
pub fn query_greeting(query: Option<&str>) -> String {
    let name = query
        .into_iter()
        .flat_map(|query| url::form_urlencoded::parse(query.as_bytes()))
        .find(|(key, _)| key == "name")
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty());

    match name {
        Some(name) => format!("Hello, {name}!\n"),
        None => format!("Hello, {DEFAULT_NAME}!\n"),
    }
}

/// Reads `name` from a JSON body such as `{"name": "Ada"}`.
pub fn decode_name(body: &[u8]) -> Result<String, DecodeError> {
    let request: GreetingRequest = serde_json::from_slice(body)?;
    match request.name {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(DecodeError::MissingName),
    }
}

/// Greeting for the JSON variant. The name is HTML-escaped because it is
/// reflected back to the caller; `None` yields `Hello, World!`.
pub fn json_greeting(name: Option<&str>) -> String {
    match name {
        Some(name) => format!("Hello, {}!", escape_html(name)),
        None => format!("Hello, {DEFAULT_NAME}!"),
    }
}

/// Replaces `&`, `<`, `>`, `"` and `'` with HTML entities.
pub fn escape_html(input: &str) -> Cow<'_, str> {
    if !input.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(input);
    }
    let mut escaped = String::with_capacity(input.len() + 16);
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_greeting_defaults_to_world() {
        assert_eq!(query_greeting(None), "Hello, World!\n");
        assert_eq!(query_greeting(Some("")), "Hello, World!\n");
        assert_eq!(query_greeting(Some("name=")), "Hello, World!\n");
        assert_eq!(query_greeting(Some("other=Ada")), "Hello, World!\n");
    }

    #[test]
    fn query_greeting_uses_first_name() {
        assert_eq!(query_greeting(Some("name=Ada")), "Hello, Ada!\n");
        assert_eq!(query_greeting(Some("x=1&name=Ada+Lovelace&name=Bob")), "Hello, Ada Lovelace!\n");
        assert_eq!(query_greeting(Some("name=%C3%89mile")), "Hello, Émile!\n");
    }

    #[test]
    fn decode_name_reports_why_it_failed() {
        assert_eq!(decode_name(br#"{"name":"Ada"}"#).unwrap(), "Ada");
        assert!(matches!(decode_name(b"not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode_name(b""), Err(DecodeError::Json(_))));
        assert!(matches!(decode_name(br#"{"name":42}"#), Err(DecodeError::Json(_))));
        assert!(matches!(decode_name(b"{}"), Err(DecodeError::MissingName)));
        assert!(matches!(decode_name(br#"{"name":""}"#), Err(DecodeError::MissingName)));
        assert!(matches!(decode_name(br#"{"name":null}"#), Err(DecodeError::MissingName)));
    }

    #[test]
    fn json_greeting_escapes_name() {
        assert_eq!(json_greeting(None), "Hello, World!");
        assert_eq!(json_greeting(Some("Ada")), "Hello, Ada!");
        assert_eq!(json_greeting(Some("<script>")), "Hello, &lt;script&gt;!");
    }

    #[test]
    fn escape_html_covers_all_special_characters() {
        assert_eq!(escape_html(r#"a&b<c>d"e'f"#), "a&amp;b&lt;c&gt;d&#34;e&#39;f");
        assert!(matches!(escape_html("plain"), Cow::Borrowed("plain")));
    }
}
