//! Exact decoding of decimal columns as they appear in change-stream payloads.
//!
//! A decimal column can arrive as JSON text (`"19.99"`), a JSON number, or a
//! byte sequence. How a byte sequence is read depends on the connector's
//! decimal handling, so it is selected with [`DecimalEncoding`].

use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bigdecimal::{num_bigint::BigInt, BigDecimal};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecimalEncoding {
    /// Bytes carry the ASCII text of the number, e.g. `[49, 46, 53]` is `1.5`.
    #[default]
    AsciiText,
    /// Bytes carry a big-endian two's-complement unscaled integer.
    PackedBinary { scale: i64 },
}

pub fn decode_decimal(value: &Value, encoding: DecimalEncoding) -> Result<BigDecimal, String> {
    match value {
        // With `arbitrary_precision` a number keeps the producer's exact text.
        Value::Number(number) => parse_text(&number.to_string()),
        Value::String(text) => match parse_text(text) {
            Ok(decimal) => Ok(decimal),
            Err(err) => match encoding {
                DecimalEncoding::PackedBinary { scale } => {
                    let bytes = STANDARD
                        .decode(text.trim())
                        .map_err(|_| err.clone())?;
                    unscaled(&bytes, scale)
                }
                DecimalEncoding::AsciiText => Err(err),
            },
        },
        Value::Array(items) => {
            let bytes = byte_sequence(items)?;
            match encoding {
                DecimalEncoding::AsciiText => {
                    let text = std::str::from_utf8(&bytes)
                        .map_err(|e| format!("byte sequence is not valid UTF-8: {}", e))?;
                    parse_text(text)
                }
                DecimalEncoding::PackedBinary { scale } => unscaled(&bytes, scale),
            }
        }
        Value::Object(map) => {
            // Variable-scale form: {"scale": 2, "value": "<base64>"}
            let scale = map
                .get("scale")
                .and_then(Value::as_i64)
                .ok_or_else(|| "decimal object is missing an integer scale".to_string())?;
            let bytes = match map.get("value") {
                Some(Value::String(encoded)) => STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| format!("invalid base64 decimal value: {}", e))?,
                Some(Value::Array(items)) => byte_sequence(items)?,
                _ => return Err("decimal object is missing its value".to_string()),
            };
            unscaled(&bytes, scale)
        }
        Value::Null => Err("decimal value is null".to_string()),
        Value::Bool(_) => Err("boolean is not a decimal".to_string()),
    }
}

fn parse_text(text: &str) -> Result<BigDecimal, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty decimal text".to_string());
    }
    BigDecimal::from_str(trimmed).map_err(|e| format!("invalid decimal text {:?}: {}", trimmed, e))
}

/// Accepts both unsigned (0..=255) and JVM-style signed (-128..=127) octets.
fn byte_sequence(items: &[Value]) -> Result<Vec<u8>, String> {
    items
        .iter()
        .map(|item| match item.as_i64() {
            Some(b) if (-128..=255).contains(&b) => Ok(b as u8),
            _ => Err(format!("{} is not a byte", item)),
        })
        .collect()
}

fn unscaled(bytes: &[u8], scale: i64) -> Result<BigDecimal, String> {
    if bytes.is_empty() {
        return Err("empty byte sequence".to_string());
    }
    Ok(BigDecimal::new(BigInt::from_signed_bytes_be(bytes), scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn decodes_decimal_text() {
        let value = decode_decimal(&json!("19.99"), DecimalEncoding::AsciiText).unwrap();
        assert_eq!(value, dec("19.99"));
    }

    #[test]
    fn decodes_json_number_without_float_drift() {
        let value = decode_decimal(&json!(0.1), DecimalEncoding::AsciiText).unwrap();
        assert_eq!(value, dec("0.1"));

        let value = decode_decimal(&json!(-450), DecimalEncoding::AsciiText).unwrap();
        assert_eq!(value, dec("-450"));
    }

    #[test]
    fn json_number_keeps_every_significant_digit() {
        let value: Value = serde_json::from_str("12345678901234567.89").unwrap();
        let decoded = decode_decimal(&value, DecimalEncoding::AsciiText).unwrap();
        assert_eq!(decoded, dec("12345678901234567.89"));
    }

    #[test]
    fn ascii_bytes_are_read_as_text_not_as_an_integer() {
        let bytes: Vec<u8> = "123.45".bytes().collect();
        let value = decode_decimal(&json!(bytes), DecimalEncoding::AsciiText).unwrap();
        assert_eq!(value, dec("123.45"));
    }

    #[test]
    fn packed_binary_bytes_use_the_configured_scale() {
        // 12345 = 0x3039
        let value = decode_decimal(&json!([0x30, 0x39]), DecimalEncoding::PackedBinary { scale: 2 }).unwrap();
        assert_eq!(value, dec("123.45"));

        // -1 in two's complement, signed octet form
        let value = decode_decimal(&json!([-1]), DecimalEncoding::PackedBinary { scale: 2 }).unwrap();
        assert_eq!(value, dec("-0.01"));
    }

    #[test]
    fn packed_binary_accepts_base64_text() {
        // "MDk=" is [0x30, 0x39]
        let value = decode_decimal(&json!("MDk="), DecimalEncoding::PackedBinary { scale: 2 }).unwrap();
        assert_eq!(value, dec("123.45"));
    }

    #[test]
    fn variable_scale_object_carries_its_own_scale() {
        let value = decode_decimal(
            &json!({"scale": 3, "value": "MDk="}),
            DecimalEncoding::AsciiText,
        )
        .unwrap();
        assert_eq!(value, dec("12.345"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_decimal(&json!("abc"), DecimalEncoding::AsciiText).is_err());
        assert!(decode_decimal(&json!([]), DecimalEncoding::PackedBinary { scale: 2 }).is_err());
        assert!(decode_decimal(&json!([300]), DecimalEncoding::AsciiText).is_err());
        assert!(decode_decimal(&json!(true), DecimalEncoding::AsciiText).is_err());
    }
}
