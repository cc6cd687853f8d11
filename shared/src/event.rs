//! Change events decoded from the transactions change stream.

use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::decimal::{decode_decimal, DecimalEncoding};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unknown operation marker {0:?}")]
    UnknownOperation(String),
}

impl DecodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::MalformedPayload(_) => "malformed_payload",
            DecodeError::UnknownOperation(_) => "unknown_operation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    /// Row emitted by the connector's initial snapshot.
    Read,
    Delete,
}

impl Operation {
    pub fn from_marker(marker: &str) -> Result<Self, DecodeError> {
        match marker {
            "c" => Ok(Operation::Create),
            "u" => Ok(Operation::Update),
            "r" => Ok(Operation::Read),
            "d" => Ok(Operation::Delete),
            other => Err(DecodeError::UnknownOperation(other.to_string())),
        }
    }

    pub fn marker(&self) -> &'static str {
        match self {
            Operation::Create => "c",
            Operation::Update => "u",
            Operation::Read => "r",
            Operation::Delete => "d",
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Read => "read",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Column values carried by a change event.
///
/// Known columns are typed; anything else lands in `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFields {
    pub customer_id: Option<i64>,
    pub product_id: Option<i64>,
    pub store_id: Option<i64>,
    pub transaction_type: Option<String>,
    pub quantity: Option<i32>,
    pub unit_price: Option<BigDecimal>,
    pub total_amount: Option<BigDecimal>,
    pub transaction_date: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub notes: Option<String>,
    pub original_transaction_id: Option<i64>,
    pub extra: Map<String, Value>,
}

impl TransactionFields {
    fn from_row(mut row: Map<String, Value>, encoding: DecimalEncoding) -> Result<Self, DecodeError> {
        let mut fields = TransactionFields {
            customer_id: take_integer(&mut row, "customer_id")?,
            product_id: take_integer(&mut row, "product_id")?,
            store_id: take_integer(&mut row, "store_id")?,
            transaction_type: take_string(&mut row, "transaction_type")?,
            quantity: take_integer(&mut row, "quantity")?
                .map(|q| {
                    i32::try_from(q).map_err(|_| {
                        DecodeError::MalformedPayload(format!("quantity {} is out of range", q))
                    })
                })
                .transpose()?,
            unit_price: take_decimal(&mut row, "unit_price", encoding)?,
            total_amount: take_decimal(&mut row, "total_amount", encoding)?,
            transaction_date: None,
            status: take_string(&mut row, "status")?,
            notes: take_string(&mut row, "notes")?,
            original_transaction_id: take_integer(&mut row, "original_transaction_id")?,
            extra: Map::new(),
        };
        if let Some(raw) = row.remove("transaction_date").filter(|v| !v.is_null()) {
            let parsed = parse_timestamp(&raw).ok_or_else(|| {
                DecodeError::MalformedPayload(format!("unsupported transaction_date {}", raw))
            })?;
            fields.transaction_date = Some(parsed);
        }
        fields.extra = row;
        Ok(fields)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub op: Operation,
    pub id: i64,
    pub fields: TransactionFields,
}

/// Turns raw change-stream record bodies into [`ChangeEvent`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder {
    encoding: DecimalEncoding,
}

impl Decoder {
    pub fn new(encoding: DecimalEncoding) -> Self {
        Self { encoding }
    }

    /// Returns `Ok(None)` for a tombstone: the empty or null-valued record
    /// the connector emits after a delete so the topic can be compacted.
    pub fn decode(&self, body: &[u8]) -> Result<Option<ChangeEvent>, DecodeError> {
        if body.trim_ascii().is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| DecodeError::MalformedPayload(format!("invalid JSON: {}", e)))?;
        let mut envelope = match value {
            Value::Null => return Ok(None),
            Value::Object(envelope) => envelope,
            _ => return Err(DecodeError::MalformedPayload("record body is not an object".to_string())),
        };

        // Converters with schemas enabled wrap the change in {"schema", "payload"}.
        if envelope.contains_key("payload") {
            envelope = match envelope.remove("payload") {
                Some(Value::Null) => return Ok(None),
                Some(Value::Object(payload)) => payload,
                _ => {
                    return Err(DecodeError::MalformedPayload(
                        "payload is missing or not an object".to_string(),
                    ))
                }
            };
        }

        let (op, mut row) = if envelope.contains_key("before") || envelope.contains_key("after") {
            split_standard(envelope)?
        } else {
            split_flattened(envelope)?
        };

        let id = take_integer(&mut row, "id")?
            .ok_or_else(|| DecodeError::MalformedPayload("missing primary key `id`".to_string()))?;

        // Deletes only need the key; the rest of the row image may be partial or absent.
        let fields = if op.is_delete() {
            TransactionFields::default()
        } else {
            TransactionFields::from_row(row, self.encoding)?
        };

        Ok(Some(ChangeEvent { op, id, fields }))
    }
}

/// `{"op": "u", "before": {...}, "after": {...}, "source": {...}}`
fn split_standard(mut envelope: Map<String, Value>) -> Result<(Operation, Map<String, Value>), DecodeError> {
    let marker = match envelope.get("op") {
        Some(Value::String(marker)) => marker.clone(),
        _ => return Err(DecodeError::MalformedPayload("missing operation marker `op`".to_string())),
    };
    let op = Operation::from_marker(&marker)?;
    let image = if op.is_delete() { "before" } else { "after" };
    match envelope.remove(image) {
        Some(Value::Object(row)) => Ok((op, row)),
        _ => Err(DecodeError::MalformedPayload(format!(
            "`{}` row image is missing for {} event",
            image, op
        ))),
    }
}

/// Flattened row with connector metadata in `__`-prefixed fields.
fn split_flattened(mut row: Map<String, Value>) -> Result<(Operation, Map<String, Value>), DecodeError> {
    let marker = match row.remove("__op") {
        Some(Value::String(marker)) => marker,
        _ => return Err(DecodeError::MalformedPayload("missing operation marker `__op`".to_string())),
    };
    let op = Operation::from_marker(&marker)?;
    row.retain(|key, _| !key.starts_with("__"));
    Ok((op, row))
}

fn take_integer(row: &mut Map<String, Value>, field: &str) -> Result<Option<i64>, DecodeError> {
    match row.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
            DecodeError::MalformedPayload(format!("field `{}` is not an integer: {}", field, n))
        }),
        Some(Value::String(s)) => s.trim().parse::<i64>().map(Some).map_err(|_| {
            DecodeError::MalformedPayload(format!("field `{}` is not an integer: {:?}", field, s))
        }),
        Some(other) => Err(DecodeError::MalformedPayload(format!(
            "field `{}` is not an integer: {}",
            field, other
        ))),
    }
}

fn take_string(row: &mut Map<String, Value>, field: &str) -> Result<Option<String>, DecodeError> {
    match row.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(DecodeError::MalformedPayload(format!(
            "field `{}` is not a string: {}",
            field, other
        ))),
    }
}

fn take_decimal(
    row: &mut Map<String, Value>,
    field: &str,
    encoding: DecimalEncoding,
) -> Result<Option<BigDecimal>, DecodeError> {
    match row.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => decode_decimal(&raw, encoding)
            .map(Some)
            .map_err(|reason| DecodeError::MalformedPayload(format!("field `{}`: {}", field, reason))),
    }
}

/// Best-effort timestamp parsing.
///
/// Integers are microseconds since the epoch, which is how the connector
/// encodes `TIMESTAMP` columns by default.
pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_micros),
        Value::String(s) => parse_datetime_text(s),
        _ => None,
    }
}

fn parse_datetime_text(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&ndt));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    fn decode(value: Value) -> Result<ChangeEvent, DecodeError> {
        Decoder::default()
            .decode(value.to_string().as_bytes())
            .map(|event| event.expect("not a tombstone"))
    }

    #[test]
    fn maps_operation_markers() {
        assert_eq!(Operation::from_marker("c"), Ok(Operation::Create));
        assert_eq!(Operation::from_marker("u"), Ok(Operation::Update));
        assert_eq!(Operation::from_marker("r"), Ok(Operation::Read));
        assert_eq!(Operation::from_marker("d"), Ok(Operation::Delete));
        assert_eq!(
            Operation::from_marker("t"),
            Err(DecodeError::UnknownOperation("t".to_string()))
        );
    }

    #[test]
    fn decodes_flattened_create_inside_schema_envelope() {
        let event = decode(json!({
            "schema": {"type": "struct"},
            "payload": {
                "id": 42,
                "customer_id": 3,
                "product_id": 7,
                "store_id": 12,
                "transaction_type": "sale",
                "quantity": 1,
                "unit_price": "19.99",
                "total_amount": "19.99",
                "status": "completed",
                "notes": null,
                "__op": "c",
                "__source_ts_ms": 1700000000000i64,
                "__deleted": "false",
                "loyalty_points": 20
            }
        }))
        .unwrap();

        assert_eq!(event.op, Operation::Create);
        assert_eq!(event.id, 42);
        assert_eq!(event.fields.customer_id, Some(3));
        assert_eq!(event.fields.transaction_type.as_deref(), Some("sale"));
        assert_eq!(event.fields.unit_price, Some(BigDecimal::from_str("19.99").unwrap()));
        assert_eq!(event.fields.notes, None);
        assert_eq!(event.fields.extra.get("loyalty_points"), Some(&json!(20)));
        assert!(!event.fields.extra.contains_key("__deleted"));
    }

    #[test]
    fn byte_encoded_decimal_recovers_the_embedded_text() {
        let bytes: Vec<u8> = "123.45".bytes().collect();
        let event = decode(json!({
            "payload": {"id": 5, "__op": "u", "unit_price": bytes, "total_amount": 123.45}
        }))
        .unwrap();
        let expected = BigDecimal::from_str("123.45").unwrap();
        assert_eq!(event.fields.unit_price, Some(expected.clone()));
        assert_eq!(event.fields.total_amount, Some(expected));
    }

    #[test]
    fn packed_binary_decoder_reads_unscaled_integers() {
        let decoder = Decoder::new(DecimalEncoding::PackedBinary { scale: 2 });
        let body = json!({"id": 9, "__op": "r", "unit_price": "B88="}).to_string();
        let event = decoder.decode(body.as_bytes()).unwrap().unwrap();
        // 0x07CF = 1999
        assert_eq!(event.fields.unit_price, Some(BigDecimal::from_str("19.99").unwrap()));
    }

    #[test]
    fn decodes_standard_envelope_using_the_right_row_image() {
        let update = decode(json!({
            "before": {"id": 8, "status": "pending"},
            "after": {"id": 8, "status": "completed"},
            "op": "u",
            "ts_ms": 1700000000000i64
        }))
        .unwrap();
        assert_eq!(update.fields.status.as_deref(), Some("completed"));

        let delete = decode(json!({
            "payload": {"before": {"id": 8}, "after": null, "op": "d"}
        }))
        .unwrap();
        assert_eq!(delete.op, Operation::Delete);
        assert_eq!(delete.id, 8);
    }

    #[test]
    fn delete_needs_only_the_key() {
        let event = decode(json!({"payload": {"id": 42, "__op": "d", "unit_price": "garbage"}})).unwrap();
        assert_eq!(event.op, Operation::Delete);
        assert_eq!(event.id, 42);
        assert_eq!(event.fields, TransactionFields::default());
    }

    #[test]
    fn unknown_marker_is_reported_before_missing_fields() {
        let err = decode(json!({"payload": {"__op": "x"}})).unwrap_err();
        assert_eq!(err, DecodeError::UnknownOperation("x".to_string()));
        assert_eq!(err.kind(), "unknown_operation");
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        let decoder = Decoder::default();
        for body in [&b"not json"[..], b"[1,2]", b"{\"payload\": 7}"] {
            let err = decoder.decode(body).unwrap_err();
            assert!(matches!(err, DecodeError::MalformedPayload(_)), "{:?}", err);
        }
        let err = decode(json!({"payload": {"__op": "c"}})).unwrap_err();
        assert_eq!(err, DecodeError::MalformedPayload("missing primary key `id`".to_string()));
        let err = decode(json!({"payload": {"id": 1, "__op": "c", "unit_price": "1.2.3"}})).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(_)));
    }

    #[test]
    fn tombstones_decode_to_nothing() {
        let decoder = Decoder::default();
        for body in [&b""[..], b"  ", b"null", b"{\"schema\": null, \"payload\": null}"] {
            assert_eq!(decoder.decode(body), Ok(None), "{:?}", String::from_utf8_lossy(body));
        }
    }

    #[test]
    fn parses_timestamps() {
        let micros = parse_timestamp(&json!(1_700_000_000_123_456i64)).unwrap();
        assert_eq!(micros.timestamp(), 1_700_000_000);
        assert!(parse_timestamp(&json!("2024-10-10T12:34:56Z")).is_some());
        assert!(parse_timestamp(&json!("2024-10-10 12:34:56")).is_some());
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }
}
