//! Command string encode/decode.
//!
//! The wire form is `command?key=value&key=value`. Command and keys are
//! lowercased and percent-encoded reserving no characters. Scalar values
//! carry a type tag (`int:`, `float:`, `bool:True|False`, `NoneType:`;
//! bare for strings) so that typed scalars survive the text round trip.
//! If any value is a nested collection the whole parameter map is emitted
//! as a single `json=` query parameter instead.

use crate::value::{ParamMap, Value, params_from_json, params_to_json};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Everything except ALPHA / DIGIT / `_` `.` `-` `~` is escaped, i.e. no
/// reserved characters survive unescaped.
const ESCAPE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~');

/// Errors raised by the wire layer. Per-message failures: the offending
/// message is dropped and the session continues.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed percent escape in {0:?}")]
    Escape(String),
    #[error("percent-decoded bytes are not valid UTF-8")]
    Utf8,
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("json parameter does not hold a JSON object")]
    JsonNotObject,
    #[error("type-tagged value {0:?} does not parse")]
    TypeTag(String),
    #[error("payload length in {0:?} does not parse")]
    PayloadLength(String),
    #[error("frame header is not valid UTF-8")]
    HeaderUtf8,
}

/// Encode a command and its parameters into one wire line (no terminator).
///
/// The command name and parameter keys are lowercased. An empty parameter
/// map yields just the command with no `?`.
pub fn encode_command_string(command: &str, params: &ParamMap) -> String {
    let path = utf8_percent_encode(&command.to_lowercase(), ESCAPE_SET).to_string();

    if params.is_empty() {
        return path;
    }

    if params.values().any(Value::is_composite) {
        // Nested collections force the JSON wire form.
        return format!("{path}?json={}", params_to_json(params));
    }

    let query = params
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(&k.to_lowercase(), ESCAPE_SET),
                encode_value(v)
            )
        })
        .collect::<Vec<_>>()
        .join("&");

    format!("{path}?{query}")
}

fn encode_value(value: &Value) -> String {
    match value {
        Value::Str(s) => utf8_percent_encode(s, ESCAPE_SET).to_string(),
        Value::Bool(true) => "bool:True".to_owned(),
        Value::Bool(false) => "bool:False".to_owned(),
        Value::Int(i) => format!("int:{}", utf8_percent_encode(&i.to_string(), ESCAPE_SET)),
        Value::Float(f) => format!("float:{}", utf8_percent_encode(&f.to_string(), ESCAPE_SET)),
        Value::Null => "NoneType:".to_owned(),
        Value::Array(_) | Value::Object(_) => {
            unreachable!("composite values take the json= form")
        }
    }
}

/// Decode one wire line (no terminator) into `(command, parameters)`.
///
/// The command and parameter keys come back lowercased; repeated keys keep
/// the first value. A single `json=` parameter supplies the whole map
/// verbatim, with key case preserved as received.
pub fn decode_command_string(line: &str) -> Result<(String, ParamMap), CodecError> {
    let (path, query) = match line.split_once('?') {
        Some((path, query)) => (path, query),
        None => (line, ""),
    };
    let command = path.to_lowercase();

    if query.is_empty() {
        return Ok((command, ParamMap::new()));
    }

    if let Some(json) = query.strip_prefix("json=") {
        let parsed: serde_json::Value = serde_json::from_str(json)?;
        let serde_json::Value::Object(object) = parsed else {
            return Err(CodecError::JsonNotObject);
        };
        return Ok((command, params_from_json(object)));
    }

    let mut params = ParamMap::new();
    for pair in query.split('&') {
        // Bare tokens without `=` carry nothing; skip them.
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = percent_decode(key)?.to_lowercase();
        if params.contains_key(&key) {
            continue;
        }
        params.insert(key, decode_value(value)?);
    }

    Ok((command, params))
}

fn decode_value(token: &str) -> Result<Value, CodecError> {
    if token.eq_ignore_ascii_case("bool:true") {
        return Ok(Value::Bool(true));
    }
    if token.eq_ignore_ascii_case("bool:false") {
        return Ok(Value::Bool(false));
    }
    if token == "NoneType:" {
        return Ok(Value::Null);
    }
    if let Some(body) = token.strip_prefix("int:") {
        return percent_decode(body)?
            .parse()
            .map(Value::Int)
            .map_err(|_| CodecError::TypeTag(token.to_owned()));
    }
    if let Some(body) = token.strip_prefix("float:") {
        return percent_decode(body)?
            .parse()
            .map(Value::Float)
            .map_err(|_| CodecError::TypeTag(token.to_owned()));
    }
    percent_decode(token).map(Value::Str)
}

/// Strict percent decoding: a `%` must be followed by two hex digits, `+`
/// reads as space, and the result must be UTF-8.
fn percent_decode(token: &str) -> Result<String, CodecError> {
    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let escaped = match (bytes.get(i + 1), bytes.get(i + 2)) {
                    (Some(&hi), Some(&lo)) => hex_digit(hi).zip(hex_digit(lo)),
                    _ => None,
                };
                match escaped {
                    Some((hi, lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    None => return Err(CodecError::Escape(token.to_owned())),
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| CodecError::Utf8)
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> ParamMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn encodes_string_params_with_percent_escapes() {
        let line = encode_command_string(
            "trigger",
            &params(&[("name", "hello".into()), ("foo", "Foo Bar".into())]),
        );
        assert_eq!(line, "trigger?foo=Foo%20Bar&name=hello");
    }

    #[test]
    fn decodes_string_params() {
        let (cmd, got) = decode_command_string("trigger?name=hello&foo=Foo%20Bar").unwrap();
        assert_eq!(cmd, "trigger");
        assert_eq!(
            got,
            params(&[("name", "hello".into()), ("foo", "Foo Bar".into())])
        );
    }

    #[test]
    fn encodes_typed_scalars_with_tags() {
        let line = encode_command_string(
            "config",
            &params(&[
                ("volume", Value::Float(0.5)),
                ("muted", Value::Bool(true)),
                ("count", Value::Int(3)),
                ("who", Value::Null),
            ]),
        );
        assert!(line.starts_with("config?"));
        assert!(line.contains("volume=float:0.5"));
        assert!(line.contains("muted=bool:True"));
        assert!(line.contains("count=int:3"));
        assert!(line.contains("who=NoneType:"));
    }

    #[test]
    fn scalar_round_trip_is_lossless() {
        let original = params(&[
            ("a", Value::Str("plain".to_owned())),
            ("b", Value::Str(String::new())),
            ("c", Value::Int(-42)),
            ("d", Value::Float(1.25)),
            ("e", Value::Bool(false)),
            ("f", Value::Null),
            ("g", Value::Str("tricky&things=here?ok".to_owned())),
        ]);
        let line = encode_command_string("Roundtrip", &original);
        let (cmd, decoded) = decode_command_string(&line).unwrap();
        assert_eq!(cmd, "roundtrip");
        assert_eq!(decoded, original);
    }

    #[test]
    fn adversarial_strings_do_not_fake_type_tags() {
        let original = params(&[
            ("a", Value::Str("int:5".to_owned())),
            ("b", Value::Str("NoneType:".to_owned())),
            ("c", Value::Str("bool:true".to_owned())),
        ]);
        let line = encode_command_string("t", &original);
        let (_, decoded) = decode_command_string(&line).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn keys_are_lowercased_both_ways() {
        let line = encode_command_string("T", &params(&[("Name", "X".into())]));
        assert_eq!(line, "t?name=X");
        let (_, decoded) = decode_command_string("t?NAME=X").unwrap();
        assert_eq!(decoded, params(&[("name", "X".into())]));
    }

    #[test]
    fn repeated_keys_keep_the_first_value() {
        let (_, decoded) = decode_command_string("t?k=first&k=second").unwrap();
        assert_eq!(decoded, params(&[("k", "first".into())]));
    }

    #[test]
    fn composite_values_force_the_json_form() {
        let original = params(&[(
            "names",
            Value::Array(vec!["a".into(), "b".into()]),
        )]);
        let line = encode_command_string("set", &original);
        assert_eq!(line, r#"set?json={"names":["a","b"]}"#);
        assert_eq!(line.matches('=').count(), 1, "json= is the sole parameter");

        let (cmd, decoded) = decode_command_string(&line).unwrap();
        assert_eq!(cmd, "set");
        assert_eq!(decoded, original);
    }

    #[test]
    fn json_branch_preserves_key_case() {
        let (_, decoded) = decode_command_string(r#"t?json={"Mixed":1}"#).unwrap();
        assert_eq!(decoded, params(&[("Mixed", Value::Int(1))]));
    }

    #[test]
    fn bool_tags_decode_case_insensitively() {
        let (_, decoded) = decode_command_string("t?a=BOOL:TRUE&b=Bool:False").unwrap();
        assert_eq!(
            decoded,
            params(&[("a", Value::Bool(true)), ("b", Value::Bool(false))])
        );
    }

    #[test]
    fn plus_decodes_as_space() {
        let (_, decoded) = decode_command_string("t?k=a+b").unwrap();
        assert_eq!(decoded, params(&[("k", "a b".into())]));
    }

    #[test]
    fn empty_query_decodes_to_empty_params() {
        let (cmd, decoded) = decode_command_string("hello").unwrap();
        assert_eq!(cmd, "hello");
        assert!(decoded.is_empty());
    }

    #[test]
    fn malformed_type_tag_body_is_rejected() {
        assert!(matches!(
            decode_command_string("t?k=int:abc"),
            Err(CodecError::TypeTag(_))
        ));
        assert!(matches!(
            decode_command_string("t?k=float:1.2.3"),
            Err(CodecError::TypeTag(_))
        ));
    }

    #[test]
    fn malformed_percent_escape_is_rejected() {
        assert!(matches!(
            decode_command_string("t?k=%zz"),
            Err(CodecError::Escape(_))
        ));
        assert!(matches!(
            decode_command_string("t?k=%2"),
            Err(CodecError::Escape(_))
        ));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            decode_command_string("t?json={broken"),
            Err(CodecError::Json(_))
        ));
        assert!(matches!(
            decode_command_string("t?json=[1,2]"),
            Err(CodecError::JsonNotObject)
        ));
    }
}
