//! Canonical encoding of legacy messages.
//!
//! Legacy messages are signed and hashed over their two-space indented JSON
//! rendering with object keys kept in insertion order and numbers written the
//! way `JSON.stringify` writes them. Hashing additionally
//! uses the V8 "binary" string encoding: every UTF-16 code unit is truncated
//! to its low byte.

use std::io;

use serde::Serialize;
use serde_json::ser::{Formatter, PrettyFormatter, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::MessageError;

/// Render `value` with two-space indentation, keys in insertion order.
pub fn to_canonical_string(value: &Value) -> Result<String, MessageError> {
    let mut buf = Vec::with_capacity(512);
    let formatter = JsFormatter(PrettyFormatter::with_indent(b"  "));
    let mut ser = Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    // serde_json only writes valid UTF-8.
    String::from_utf8(buf).map_err(|e| MessageError::Shape(format!("non UTF-8 output: {e}")))
}

/// Pretty printing with JavaScript number rendering: `1.0` is `1`, `1e21`
/// is `1e+21`.
struct JsFormatter<'a>(PrettyFormatter<'a>);

impl Formatter for JsFormatter<'_> {
    fn write_f32<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f32) -> io::Result<()> {
        writer.write_all(js_number(f64::from(value)).as_bytes())
    }

    fn write_f64<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f64) -> io::Result<()> {
        writer.write_all(js_number(value).as_bytes())
    }

    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_array(writer)
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.0.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object(writer)
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.0.begin_object_key(writer, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object_value(writer)
    }
}

/// ECMAScript `Number.prototype.toString()` for finite values.
fn js_number(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        // JSON has no NaN or infinity; serde_json never hands them over.
        return "0".to_string();
    }
    // `{:e}` yields the shortest round-trip digits, e.g. `1.25e-7`.
    let sci = format!("{:e}", value.abs());
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let k = digits.len() as i32;
    let n = exponent + 1;

    let body = if k <= n && n <= 21 {
        format!("{digits}{}", "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        format!("{int}.{frac}")
    } else if -6 < n && n <= 0 {
        format!("0.{}{digits}", "0".repeat((-n) as usize))
    } else {
        let (first, rest) = digits.split_at(1);
        let sign = if n - 1 < 0 { '-' } else { '+' };
        let exp = (n - 1).abs();
        if rest.is_empty() {
            format!("{first}e{sign}{exp}")
        } else {
            format!("{first}.{rest}e{sign}{exp}")
        }
    };
    if value < 0.0 {
        format!("-{body}")
    } else {
        body
    }
}

/// Number of UTF-16 code units, the length measure legacy size limits use.
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// The V8 "binary" encoding of a string.
pub fn v8_binary(s: &str) -> Vec<u8> {
    s.encode_utf16().map(|unit| (unit & 0xff) as u8).collect()
}

/// SHA-256 over the V8 "binary" encoding of a canonical message string.
pub fn legacy_hash(canonical: &str) -> [u8; 32] {
    Sha256::digest(v8_binary(canonical)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_indentation_and_order() {
        let value: Value = serde_json::from_str(r#"{"b":1,"a":{"c":[1,2]},"d":[],"e":{}}"#).unwrap();
        let s = to_canonical_string(&value).unwrap();
        assert_eq!(
            s,
            "{\n  \"b\": 1,\n  \"a\": {\n    \"c\": [\n      1,\n      2\n    ]\n  },\n  \"d\": [],\n  \"e\": {}\n}"
        );
    }

    #[test]
    fn test_numbers_render_like_javascript() {
        let value: Value = serde_json::from_str(
            r#"{"a":1.0,"b":-2.50,"c":0.1,"d":1e21,"e":123456789012345680000,"f":1e-7,"g":0.000001,"h":1.5e300,"i":42}"#,
        )
        .unwrap();
        let s = to_canonical_string(&value).unwrap();
        assert_eq!(
            s,
            "{\n  \"a\": 1,\n  \"b\": -2.5,\n  \"c\": 0.1,\n  \"d\": 1e+21,\n  \"e\": 123456789012345680000,\n  \"f\": 1e-7,\n  \"g\": 0.000001,\n  \"h\": 1.5e+300,\n  \"i\": 42\n}"
        );
    }

    #[test]
    fn test_v8_binary_truncates_code_units() {
        assert_eq!(v8_binary("ab"), vec![b'a', b'b']);
        // U+00E9 is a single code unit 0x00E9.
        assert_eq!(v8_binary("\u{e9}"), vec![0xe9]);
        // U+1F600 is a surrogate pair D83D DE00.
        assert_eq!(v8_binary("\u{1F600}"), vec![0x3d, 0x00]);
    }

    #[test]
    fn test_utf16_len() {
        assert_eq!(utf16_len("abc"), 3);
        assert_eq!(utf16_len("\u{1F600}"), 2);
    }
}
