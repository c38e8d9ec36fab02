//! Value Serialization
//!
//! Encoder, decoder and grammar sniffing for the textual format values are
//! stored in:
//!
//! ```text
//! N;                      null
//! b:1;                    bool
//! i:42;                   int
//! d:0.5;                  float
//! s:5:"hello";            string (length in bytes)
//! a:1:{i:0;s:1:"x";}      ordered array
//! O:8:"stdClass":1:{...}  object
//! ```
//!
//! `is_serialized` only inspects the header and terminal
//! markers; it decides whether `maybe_serialize` must double-encode a
//! string and whether `maybe_unserialize` should attempt a decode.

use crate::value::{format_float, ArrayKey, Value};

// ============================================
// Classification
// ============================================

/// How strictly `is_serialized` checks terminal markers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffMode {
    /// Terminal `;`/`}` must be the last byte
    Strict,
    /// Markers only need to be present past the header
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Null,
    Bool,
    Int,
    Float,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Array,
    Object,
}

/// Result of sniffing a string for the serialized grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialized {
    NotSerialized,
    Scalar(ScalarKind),
    Container(ContainerKind),
}

impl Serialized {
    pub fn is_serialized(self) -> bool {
        !matches!(self, Serialized::NotSerialized)
    }
}

/// Classify `data` without fully parsing it.
pub fn is_serialized(data: &str, mode: SniffMode) -> Serialized {
    let data = trim_blank(data);
    if data == "N;" {
        return Serialized::Scalar(ScalarKind::Null);
    }

    let bytes = data.as_bytes();
    if bytes.len() < 4 || bytes[1] != b':' {
        return Serialized::NotSerialized;
    }

    let last = bytes[bytes.len() - 1];
    match mode {
        SniffMode::Strict => {
            if last != b';' && last != b'}' {
                return Serialized::NotSerialized;
            }
        }
        SniffMode::Lenient => {
            let semicolon = data.find(';');
            let brace = data.find('}');
            if semicolon.is_none() && brace.is_none() {
                return Serialized::NotSerialized;
            }
            if semicolon.is_some_and(|p| p < 3) || brace.is_some_and(|p| p < 4) {
                return Serialized::NotSerialized;
            }
        }
    }

    let token = bytes[0];
    match token {
        b's' | b'a' | b'O' => {
            if token == b's' {
                let quoted = match mode {
                    SniffMode::Strict => bytes[bytes.len() - 2] == b'"',
                    SniffMode::Lenient => data.contains('"'),
                };
                if !quoted {
                    return Serialized::NotSerialized;
                }
            }
            if !has_length_header(&bytes[2..]) {
                return Serialized::NotSerialized;
            }
            match token {
                b's' => Serialized::Scalar(ScalarKind::String),
                b'a' => Serialized::Container(ContainerKind::Array),
                _ => Serialized::Container(ContainerKind::Object),
            }
        }
        b'b' | b'i' | b'd' => {
            let body = &bytes[2..];
            let run = body
                .iter()
                .take_while(|b| b.is_ascii_digit() || matches!(**b, b'.' | b'E' | b'+' | b'-'))
                .count();
            if run == 0 || body.get(run) != Some(&b';') {
                return Serialized::NotSerialized;
            }
            if mode == SniffMode::Strict && run + 1 != body.len() {
                return Serialized::NotSerialized;
            }
            Serialized::Scalar(match token {
                b'b' => ScalarKind::Bool,
                b'i' => ScalarKind::Int,
                _ => ScalarKind::Float,
            })
        }
        _ => Serialized::NotSerialized,
    }
}

/// Strip the ASCII blanks `" \t\n\r\0\x0B"` from both ends
fn trim_blank(data: &str) -> &str {
    data.trim_matches([' ', '\t', '\n', '\r', '\0', '\x0B'])
}

/// `[0-9]+:` at the start of `body`
fn has_length_header(body: &[u8]) -> bool {
    let digits = body.iter().take_while(|b| b.is_ascii_digit()).count();
    digits > 0 && body.get(digits) == Some(&b':')
}

/// Strict check for a serialized string value
pub fn is_serialized_string(data: &str) -> bool {
    is_serialized(data, SniffMode::Strict) == Serialized::Scalar(ScalarKind::String)
}

// ============================================
// maybe_* helpers
// ============================================

/// Serialize containers, and strings that would otherwise be mistaken for
/// serialized data. Everything else is returned unchanged.
pub fn maybe_serialize(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object { .. } => Value::String(serialize(value)),
        Value::String(s) if is_serialized(s, SniffMode::Lenient).is_serialized() => {
            Value::String(serialize(value))
        }
        other => other.clone(),
    }
}

/// Decode strings that look serialized; a failed decode yields `false`.
pub fn maybe_unserialize(value: &Value) -> Value {
    match value {
        Value::String(s) if is_serialized(s, SniffMode::Strict).is_serialized() => {
            match unserialize(trim_blank(s)) {
                Ok(decoded) => decoded,
                Err(err) => {
                    tracing::debug!("Discarding malformed serialized value: {}", err);
                    Value::Bool(false)
                }
            }
        }
        other => other.clone(),
    }
}

/// Convenience for raw storage strings
pub fn maybe_unserialize_str(raw: &str) -> Value {
    maybe_unserialize(&Value::String(raw.to_string()))
}

/// `maybe_serialize` followed by the storage string cast
pub fn to_storage(value: &Value) -> String {
    maybe_serialize(value).to_db_string()
}

// ============================================
// Encoder
// ============================================

/// Encode a value
pub fn serialize(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("N;"),
        Value::Bool(b) => {
            out.push_str(if *b { "b:1;" } else { "b:0;" });
        }
        Value::Int(n) => {
            out.push_str(&format!("i:{};", n));
        }
        Value::Float(f) => {
            out.push_str(&format!("d:{};", format_float(*f)));
        }
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push_str(&format!("a:{}:{{", items.len()));
            for (key, item) in items {
                match key {
                    ArrayKey::Int(n) => out.push_str(&format!("i:{};", n)),
                    ArrayKey::Str(s) => write_string(out, s),
                }
                write_value(out, item);
            }
            out.push('}');
        }
        Value::Object { class, properties } => {
            out.push_str(&format!(
                "O:{}:\"{}\":{}:{{",
                class.len(),
                class,
                properties.len()
            ));
            for (name, item) in properties {
                write_string(out, name);
                write_value(out, item);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push_str(&format!("s:{}:\"{}\";", s.len(), s));
}

// ============================================
// Decoder
// ============================================

/// Decoding failure with the byte offset it occurred at
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at offset {offset}")]
pub struct UnserializeError {
    pub offset: usize,
    pub message: String,
}

/// Decode a complete serialized value. Trailing bytes are an error.
pub fn unserialize(data: &str) -> Result<Value, UnserializeError> {
    let mut parser = Parser {
        input: data.as_bytes(),
        pos: 0,
    };
    let value = parser.value()?;
    if parser.pos != parser.input.len() {
        return Err(parser.error("unexpected trailing data"));
    }
    Ok(value)
}

/// Deepest container nesting the decoder accepts
pub const MAX_DEPTH: usize = 4096;

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> UnserializeError {
        UnserializeError {
            offset: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), UnserializeError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    /// Read up to (not including) `terminator` and consume it
    fn until(&mut self, terminator: u8) -> Result<&'a str, UnserializeError> {
        let input = self.input;
        let start = self.pos;
        let len = input[start..]
            .iter()
            .position(|b| *b == terminator)
            .ok_or_else(|| self.error(&format!("missing '{}'", terminator as char)))?;
        self.pos = start + len + 1;
        std::str::from_utf8(&input[start..start + len]).map_err(|_| UnserializeError {
            offset: start,
            message: "invalid utf-8".to_string(),
        })
    }

    fn length(&mut self) -> Result<usize, UnserializeError> {
        let start = self.pos;
        self.until(b':')?.parse().map_err(|_| UnserializeError {
            offset: start,
            message: "invalid length".to_string(),
        })
    }

    fn int(&mut self) -> Result<i64, UnserializeError> {
        let start = self.pos;
        self.until(b';')?.parse().map_err(|_| UnserializeError {
            offset: start,
            message: "invalid integer".to_string(),
        })
    }

    fn quoted(&mut self, len: usize) -> Result<String, UnserializeError> {
        self.expect(b'"')?;
        let start = self.pos;
        let end = start + len;
        if end > self.input.len() {
            return Err(self.error("string length exceeds input"));
        }
        let s = std::str::from_utf8(&self.input[start..end])
            .map_err(|_| self.error("invalid utf-8"))?
            .to_string();
        self.pos = end;
        self.expect(b'"')?;
        Ok(s)
    }

    /// Decode one value. Open containers live on an explicit stack capped
    /// at `MAX_DEPTH`.
    fn value(&mut self) -> Result<Value, UnserializeError> {
        let mut stack: Vec<Container> = Vec::new();
        loop {
            let produced = match stack.pop() {
                Some(open) if open.remaining == 0 => {
                    self.expect(b'}')?;
                    open.finish()
                }
                Some(mut open) if open.pending_key.is_none() => {
                    open.pending_key = Some(self.key()?);
                    stack.push(open);
                    continue;
                }
                parent => {
                    stack.extend(parent);
                    match self.token()? {
                        Token::Scalar(value) => value,
                        Token::Open(container) => {
                            if stack.len() >= MAX_DEPTH {
                                return Err(self.error("maximum depth exceeded"));
                            }
                            stack.push(container);
                            continue;
                        }
                    }
                }
            };

            match stack.last_mut() {
                Some(parent) => parent.push(produced),
                None => return Ok(produced),
            }
        }
    }

    /// A scalar, or the header of an array or object up to its `{`
    fn token(&mut self) -> Result<Token, UnserializeError> {
        let tag = self.peek().ok_or_else(|| self.error("unexpected end of input"))?;
        self.pos += 1;
        let scalar = match tag {
            b'N' => {
                self.expect(b';')?;
                Value::Null
            }
            b'b' => {
                self.expect(b':')?;
                match self.int()? {
                    0 => Value::Bool(false),
                    1 => Value::Bool(true),
                    _ => return Err(self.error("invalid boolean")),
                }
            }
            b'i' => {
                self.expect(b':')?;
                Value::Int(self.int()?)
            }
            b'd' => {
                self.expect(b':')?;
                let start = self.pos;
                let text = self.until(b';')?;
                let f = match text {
                    "INF" => f64::INFINITY,
                    "-INF" => f64::NEG_INFINITY,
                    "NAN" => f64::NAN,
                    _ => text.parse().map_err(|_| UnserializeError {
                        offset: start,
                        message: "invalid float".to_string(),
                    })?,
                };
                Value::Float(f)
            }
            b's' => {
                self.expect(b':')?;
                let len = self.length()?;
                let s = self.quoted(len)?;
                self.expect(b';')?;
                Value::String(s)
            }
            b'a' => {
                self.expect(b':')?;
                let count = self.length()?;
                self.expect(b'{')?;
                let items = Vec::with_capacity(count.min(1024));
                return Ok(Token::Open(Container::new(ContainerState::Array(items), count)));
            }
            b'O' => {
                self.expect(b':')?;
                let len = self.length()?;
                let class = self.quoted(len)?;
                self.expect(b':')?;
                let count = self.length()?;
                self.expect(b'{')?;
                let properties = Vec::with_capacity(count.min(1024));
                let state = ContainerState::Object { class, properties };
                return Ok(Token::Open(Container::new(state, count)));
            }
            b'r' | b'R' => return Err(self.error("references are not supported")),
            _ => {
                self.pos -= 1;
                return Err(self.error("unknown type tag"));
            }
        };
        Ok(Token::Scalar(scalar))
    }

    fn key(&mut self) -> Result<ArrayKey, UnserializeError> {
        match self.token()? {
            Token::Scalar(Value::Int(n)) => Ok(ArrayKey::Int(n)),
            Token::Scalar(Value::String(s)) => Ok(ArrayKey::normalized(&s)),
            _ => Err(self.error("invalid array key")),
        }
    }
}

enum Token {
    Scalar(Value),
    Open(Container),
}

enum ContainerState {
    Array(Vec<(ArrayKey, Value)>),
    Object {
        class: String,
        properties: Vec<(String, Value)>,
    },
}

/// An array or object whose members are still being read
struct Container {
    state: ContainerState,
    remaining: usize,
    pending_key: Option<ArrayKey>,
}

impl Container {
    fn new(state: ContainerState, remaining: usize) -> Self {
        Self {
            state,
            remaining,
            pending_key: None,
        }
    }

    fn push(&mut self, item: Value) {
        let key = self.pending_key.take().unwrap_or(ArrayKey::Int(0));
        self.remaining -= 1;
        match &mut self.state {
            ContainerState::Array(items) => {
                // Later duplicates overwrite in place
                match items.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, slot)) => *slot = item,
                    None => items.push((key, item)),
                }
            }
            ContainerState::Object { properties, .. } => {
                let name = match key {
                    ArrayKey::Str(s) => s,
                    ArrayKey::Int(n) => n.to_string(),
                };
                properties.push((name, item));
            }
        }
    }

    fn finish(self) -> Value {
        match self.state {
            ContainerState::Array(items) => Value::Array(items),
            ContainerState::Object { class, properties } => Value::Object { class, properties },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict(data: &str) -> bool {
        is_serialized(data, SniffMode::Strict).is_serialized()
    }

    fn lenient(data: &str) -> bool {
        is_serialized(data, SniffMode::Lenient).is_serialized()
    }

    #[test]
    fn test_sniff_basic() {
        assert!(strict("N;"));
        assert!(!strict("plain string"));
        assert!(strict("a:1:{i:0;s:1:\"x\";}"));
        assert!(strict("  b:1;  "));
        assert!(strict("i:42;"));
        assert!(strict("d:0.5;"));
        assert!(strict("s:3:\"abc\";"));
        assert!(strict("O:8:\"stdClass\":0:{}"));
    }

    #[test]
    fn test_sniff_classification() {
        assert_eq!(
            is_serialized("a:0:{}", SniffMode::Strict),
            Serialized::Container(ContainerKind::Array)
        );
        assert_eq!(
            is_serialized("i:1;", SniffMode::Strict),
            Serialized::Scalar(ScalarKind::Int)
        );
        assert_eq!(
            is_serialized("N;", SniffMode::Lenient),
            Serialized::Scalar(ScalarKind::Null)
        );
    }

    #[test]
    fn test_sniff_strict_vs_lenient() {
        // Trailing text after the terminator
        assert!(!strict("i:5;extra"));
        assert!(lenient("i:5;extra"));
        assert!(!strict("s:3:\"abc\";x"));
        assert!(lenient("s:3:\"abc\";x"));
        // Markers too early
        assert!(!lenient("a:;xxxx"));
        assert!(!lenient("s:}\"xxx"));
        // No quote for strings
        assert!(!lenient("s:3:abc;"));
    }

    #[test]
    fn test_sniff_rejects() {
        assert!(!strict("N"));
        assert!(!strict("abc"));
        assert!(!strict("x:1;"));
        assert!(!strict("i:;"));
        assert!(!strict("i:a;"));
        assert!(!strict("a:b:{}"));
        assert!(!strict("s:1:\"a\"")); // no terminator
        assert!(!strict("http://example.com;"));
    }

    #[test]
    fn test_serialized_string_check() {
        assert!(is_serialized_string("s:1:\"a\";"));
        assert!(!is_serialized_string("i:1;"));
    }

    #[test]
    fn test_encode() {
        assert_eq!(serialize(&Value::Null), "N;");
        assert_eq!(serialize(&Value::Bool(true)), "b:1;");
        assert_eq!(serialize(&Value::Int(-7)), "i:-7;");
        assert_eq!(serialize(&Value::Float(0.5)), "d:0.5;");
        assert_eq!(serialize(&Value::from("héllo")), "s:6:\"héllo\";");
        assert_eq!(
            serialize(&Value::map([("a", Value::Int(1)), ("7", Value::from("b"))])),
            "a:2:{s:1:\"a\";i:1;i:7;s:1:\"b\";}"
        );
        assert_eq!(
            serialize(&Value::object("stdClass", [("x".to_string(), 1i64)])),
            "O:8:\"stdClass\":1:{s:1:\"x\";i:1;}"
        );
    }

    #[test]
    fn test_decode_with_delimiters_in_strings() {
        let v = unserialize("a:1:{s:3:\"k;}\";s:5:\"a\"b;}\";}").unwrap();
        assert_eq!(v, Value::map([("k;}", "a\"b;}")]));
    }

    #[test]
    fn test_decode_errors() {
        assert!(unserialize("s:10:\"short\";").is_err());
        assert!(unserialize("i:1;junk").is_err());
        assert!(unserialize("b:2;").is_err());
        assert!(unserialize("a:1:{i:0;R:1;}").is_err());
        assert!(unserialize("").is_err());
    }

    fn nested_arrays(depth: usize) -> String {
        format!("{}N;{}", "a:1:{i:0;".repeat(depth), "}".repeat(depth))
    }

    #[test]
    fn test_decode_nesting_limit() {
        let decoded = unserialize(&nested_arrays(64)).unwrap();
        assert!(matches!(decoded, Value::Array(ref items) if items.len() == 1));
        assert!(unserialize(&nested_arrays(512)).is_ok());

        let err = unserialize(&nested_arrays(MAX_DEPTH + 1)).unwrap_err();
        assert_eq!(err.message, "maximum depth exceeded");

        // Far past the limit still returns instead of overflowing the stack
        assert_eq!(maybe_unserialize_str(&nested_arrays(200_000)), Value::Bool(false));
    }

    #[test]
    fn test_decode_objects_inside_arrays() {
        let v = unserialize("a:2:{i:0;O:8:\"stdClass\":1:{s:1:\"k\";a:0:{}}i:1;N;}").unwrap();
        assert_eq!(
            v,
            Value::Array(vec![
                (
                    ArrayKey::Int(0),
                    Value::Object {
                        class: "stdClass".into(),
                        properties: vec![("k".into(), Value::Array(vec![]))],
                    },
                ),
                (ArrayKey::Int(1), Value::Null),
            ])
        );
        assert!(unserialize("a:1:{a:0:{}i:1;}").is_err());
    }

    #[test]
    fn test_sniff_trims_ascii_blanks_only() {
        assert!(strict("\0\x0Bi:1;\t\n"));
        assert_eq!(maybe_unserialize_str("\0i:7;\r\n"), Value::Int(7));
        // Non-breaking space is not a blank
        assert!(!strict("\u{a0}i:1;"));
    }

    #[test]
    fn test_decode_special_floats() {
        assert_eq!(unserialize("d:INF;").unwrap(), Value::Float(f64::INFINITY));
        assert_eq!(unserialize("d:1.0E+25;").unwrap(), Value::Float(1e25));
        assert!(matches!(unserialize("d:NAN;").unwrap(), Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_maybe_round_trip() {
        let samples = vec![
            Value::Int(42),
            Value::Float(3.25),
            Value::Bool(false),
            Value::from("hello"),
            Value::list(["a", "b"]),
            Value::map([
                ("outer", Value::map([("inner", Value::list([1i64, 2, 3]))])),
                ("flag", Value::Bool(true)),
            ]),
        ];
        for v in samples {
            assert_eq!(maybe_unserialize(&maybe_serialize(&v)), v);
        }
    }

    #[test]
    fn test_maybe_serialize_double_encodes() {
        let already = Value::from("i:5;");
        let stored = maybe_serialize(&already);
        assert_eq!(stored, Value::from("s:4:\"i:5;\";"));
        assert_eq!(maybe_unserialize(&stored), already);
    }

    #[test]
    fn test_maybe_unserialize_passthrough() {
        assert_eq!(maybe_unserialize(&Value::from("plain")), Value::from("plain"));
        assert_eq!(maybe_unserialize(&Value::Int(3)), Value::Int(3));
        // Looks serialized but does not decode
        assert_eq!(maybe_unserialize(&Value::from("s:9:\"abc\";")), Value::Bool(false));
    }

    #[test]
    fn test_storage_string() {
        assert_eq!(to_storage(&Value::Int(5)), "5");
        assert_eq!(to_storage(&Value::list([1i64])), "a:1:{i:0;i:1;}");
    }
}
