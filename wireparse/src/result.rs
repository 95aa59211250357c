//! Parse results and their serialized forms.

use crate::field::{
    bytes_to_hex, hex_to_bytes, FieldData, FieldKind, FieldValue,
};
use crate::Error;
use indexmap::IndexMap;
use serde_json::{json, Value};

/// Outcome of applying a protocol definition to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Success,
    PacketTooShort,
    ProtocolNotFound,
    ValidationError,
    ChecksumError,
    InternalError,
}

impl ParseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseStatus::Success => "success",
            ParseStatus::PacketTooShort => "packet_too_short",
            ParseStatus::ProtocolNotFound => "protocol_not_found",
            ParseStatus::ValidationError => "validation_error",
            ParseStatus::ChecksumError => "checksum_error",
            ParseStatus::InternalError => "internal_error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "success" => ParseStatus::Success,
            "packet_too_short" => ParseStatus::PacketTooShort,
            "protocol_not_found" => ParseStatus::ProtocolNotFound,
            "validation_error" => ParseStatus::ValidationError,
            "checksum_error" => ParseStatus::ChecksumError,
            "internal_error" => ParseStatus::InternalError,
            _ => return None,
        })
    }
}

/// Result of one field-level validation.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub field_name: String,
    pub valid: bool,
    pub message: String,
    pub validation_micros: u64,
}

/// Everything produced by one parse: typed fields in definition order,
/// validation outcomes, timing, and the original bytes for serialization.
#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    pub status: Option<ParseStatus>,
    pub protocol: String,
    pub version: String,
    pub fields: IndexMap<String, FieldValue>,
    pub validations: Vec<ValidationOutcome>,
    pub parse_micros: u64,
    pub validation_micros: u64,
    pub packet_length: usize,
    pub parsed_bytes: usize,
    pub raw: Vec<u8>,
    pub error: Option<String>,
}

impl ParseResult {
    pub fn error(status: ParseStatus, message: &str) -> Self {
        Self {
            status: Some(status),
            error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn status(&self) -> ParseStatus {
        self.status.unwrap_or(ParseStatus::InternalError)
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(ParseStatus::Success)
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// The bytes the result was parsed from, unchanged.
    pub fn serialize(&self) -> Vec<u8> {
        self.raw.clone()
    }

    pub fn to_json_value(&self) -> Value {
        let fields: Vec<Value> = self
            .fields
            .iter()
            .map(|(name, value)| {
                json!({
                    "name": name,
                    "kind": value.data.kind().map(FieldKind::as_str),
                    "value": field_data_to_json(&value.data),
                    "raw_hex": value.raw_hex,
                    "formatted": value.formatted,
                    "valid": value.valid,
                })
            })
            .collect();
        let validations: Vec<Value> = self
            .validations
            .iter()
            .map(|v| {
                json!({
                    "field": v.field_name,
                    "valid": v.valid,
                    "message": v.message,
                })
            })
            .collect();
        json!({
            "protocol": self.protocol,
            "version": self.version,
            "status": self.status().as_str(),
            "packet_length": self.packet_length,
            "parsed_bytes": self.parsed_bytes,
            "fields": fields,
            "validations": validations,
            "error": self.error,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.to_json_value()).unwrap_or_default()
    }

    /// Rebuilds a result from its JSON form. Field names, kinds, values and
    /// ordering survive the round trip; timing and raw bytes do not.
    pub fn from_json(text: &str) -> crate::Result<Self> {
        let doc: Value = serde_json::from_str(text).map_err(|e| Error::Format {
            format: "json",
            reason: e.to_string(),
        })?;
        let bad = |reason: &str| Error::Format {
            format: "json",
            reason: reason.to_string(),
        };

        let mut result = ParseResult {
            protocol: doc["protocol"].as_str().unwrap_or_default().to_string(),
            version: doc["version"].as_str().unwrap_or_default().to_string(),
            status: doc["status"]
                .as_str()
                .and_then(ParseStatus::from_str)
                .or(Some(ParseStatus::InternalError)),
            packet_length: doc["packet_length"].as_u64().unwrap_or(0) as usize,
            parsed_bytes: doc["parsed_bytes"].as_u64().unwrap_or(0) as usize,
            error: doc["error"].as_str().map(str::to_string),
            ..Self::default()
        };

        let fields = doc["fields"].as_array().ok_or_else(|| bad("missing fields"))?;
        for entry in fields {
            let name = entry["name"]
                .as_str()
                .ok_or_else(|| bad("field without name"))?
                .to_string();
            let kind = entry["kind"].as_str().and_then(FieldKind::from_str);
            let data = field_data_from_json(kind, &entry["value"])
                .ok_or_else(|| bad("unreadable field value"))?;
            result.fields.insert(
                name,
                FieldValue {
                    data,
                    valid: entry["valid"].as_bool().unwrap_or(false),
                    raw_hex: entry["raw_hex"].as_str().unwrap_or_default().to_string(),
                    formatted: entry["formatted"].as_str().map(str::to_string),
                    extract_micros: 0,
                },
            );
        }

        if let Some(validations) = doc["validations"].as_array() {
            for entry in validations {
                result.validations.push(ValidationOutcome {
                    field_name: entry["field"].as_str().unwrap_or_default().to_string(),
                    valid: entry["valid"].as_bool().unwrap_or(false),
                    message: entry["message"].as_str().unwrap_or_default().to_string(),
                    validation_micros: 0,
                });
            }
        }

        Ok(result)
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(&format!(
            "<parse_result protocol=\"{}\" version=\"{}\" status=\"{}\">\n",
            xml_escape(&self.protocol),
            xml_escape(&self.version),
            self.status().as_str()
        ));
        out.push_str(&format!(
            "  <packet length=\"{}\" parsed=\"{}\"/>\n",
            self.packet_length, self.parsed_bytes
        ));
        out.push_str("  <fields>\n");
        for (name, value) in &self.fields {
            out.push_str(&format!(
                "    <field name=\"{}\" kind=\"{}\" valid=\"{}\" raw=\"{}\">{}</field>\n",
                xml_escape(name),
                value.data.kind().map(FieldKind::as_str).unwrap_or("none"),
                value.valid,
                value.raw_hex,
                xml_escape(&value.display())
            ));
        }
        out.push_str("  </fields>\n");
        out.push_str("</parse_result>\n");
        out
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from("field,kind,value,raw_hex,valid\n");
        for (name, value) in &self.fields {
            out.push_str(&format!(
                "{},{},{},{},{}\n",
                csv_escape(name),
                value.data.kind().map(FieldKind::as_str).unwrap_or("none"),
                csv_escape(&value.display()),
                value.raw_hex,
                value.valid
            ));
        }
        out
    }

    pub fn to_human(&self) -> String {
        let mut out = format!(
            "{} v{} [{}] {} of {} bytes parsed\n",
            self.protocol,
            self.version,
            self.status().as_str(),
            self.parsed_bytes,
            self.packet_length
        );
        for (name, value) in &self.fields {
            out.push_str(&format!(
                "  {:<24} {:<20} ({})\n",
                name,
                value.display(),
                value.raw_hex
            ));
        }
        for v in &self.validations {
            if !v.valid {
                out.push_str(&format!("  ! {}: {}\n", v.field_name, v.message));
            }
        }
        if let Some(ref err) = self.error {
            out.push_str(&format!("  error: {err}\n"));
        }
        out
    }
}

fn field_data_to_json(data: &FieldData) -> Value {
    match data {
        FieldData::U8(v) => json!(v),
        FieldData::U16(v) => json!(v),
        FieldData::U32(v) => json!(v),
        FieldData::U64(v) => json!(v),
        FieldData::I8(v) => json!(v),
        FieldData::I16(v) => json!(v),
        FieldData::I32(v) => json!(v),
        FieldData::I64(v) => json!(v),
        FieldData::F32(v) => json!(*v as f64),
        FieldData::F64(v) => json!(v),
        FieldData::Bytes(b) => json!(bytes_to_hex(b)),
        FieldData::Str(s) => json!(s),
        FieldData::Bool(v) => json!(v),
        FieldData::Mac(b) => json!(bytes_to_hex(b)),
        FieldData::Ipv4(b) => json!(bytes_to_hex(b)),
        FieldData::Ipv6(b) => json!(bytes_to_hex(b)),
        FieldData::Timestamp(v) => json!(v),
        FieldData::None => Value::Null,
    }
}

fn field_data_from_json(kind: Option<FieldKind>, value: &Value) -> Option<FieldData> {
    let kind = match kind {
        Some(kind) => kind,
        None => return Some(FieldData::None),
    };
    Some(match kind {
        FieldKind::U8 => FieldData::U8(value.as_u64()? as u8),
        FieldKind::U16 => FieldData::U16(value.as_u64()? as u16),
        FieldKind::U32 => FieldData::U32(value.as_u64()? as u32),
        FieldKind::U64 => FieldData::U64(value.as_u64()?),
        FieldKind::I8 => FieldData::I8(value.as_i64()? as i8),
        FieldKind::I16 => FieldData::I16(value.as_i64()? as i16),
        FieldKind::I32 => FieldData::I32(value.as_i64()? as i32),
        FieldKind::I64 => FieldData::I64(value.as_i64()?),
        FieldKind::F32 => FieldData::F32(value.as_f64()? as f32),
        FieldKind::F64 => FieldData::F64(value.as_f64()?),
        FieldKind::Bytes | FieldKind::Custom => FieldData::Bytes(hex_to_bytes(value.as_str()?)?),
        FieldKind::Str => FieldData::Str(value.as_str()?.to_string()),
        FieldKind::Bool => FieldData::Bool(value.as_bool()?),
        FieldKind::Mac => FieldData::Mac(hex_to_bytes(value.as_str()?)?),
        FieldKind::Ipv4 => FieldData::Ipv4(hex_to_bytes(value.as_str()?)?),
        FieldKind::Ipv6 => FieldData::Ipv6(hex_to_bytes(value.as_str()?)?),
        FieldKind::Timestamp => FieldData::Timestamp(value.as_u64()?),
    })
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParseResult {
        let mut result = ParseResult {
            status: Some(ParseStatus::Success),
            protocol: "demo".to_string(),
            version: "1.0".to_string(),
            packet_length: 4,
            parsed_bytes: 4,
            raw: vec![0x12, 0x34, 0xab, 0xcd],
            ..Default::default()
        };
        result.fields.insert(
            "word".to_string(),
            FieldValue {
                data: FieldData::U16(0x1234),
                valid: true,
                raw_hex: "1234".to_string(),
                formatted: None,
                extract_micros: 3,
            },
        );
        result.fields.insert(
            "tail".to_string(),
            FieldValue {
                data: FieldData::Bytes(vec![0xab, 0xcd]),
                valid: true,
                raw_hex: "abcd".to_string(),
                formatted: None,
                extract_micros: 1,
            },
        );
        result
    }

    #[test]
    fn test_json_round_trip_preserves_fields() {
        let original = sample();
        let rebuilt = ParseResult::from_json(&original.to_json()).unwrap();

        assert_eq!(rebuilt.protocol, original.protocol);
        assert_eq!(rebuilt.status(), original.status());
        assert_eq!(rebuilt.fields.len(), original.fields.len());
        for ((name_a, value_a), (name_b, value_b)) in
            original.fields.iter().zip(rebuilt.fields.iter())
        {
            assert_eq!(name_a, name_b);
            assert_eq!(value_a.data, value_b.data);
            assert_eq!(value_a.raw_hex, value_b.raw_hex);
        }
    }

    #[test]
    fn test_csv_has_row_per_field() {
        let csv = sample().to_csv();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.lines().nth(1).unwrap().starts_with("word,u16,4660"));
    }

    #[test]
    fn test_xml_contains_fields() {
        let xml = sample().to_xml();
        assert!(xml.contains("<field name=\"word\""));
        assert!(xml.contains("status=\"success\""));
    }

    #[test]
    fn test_serialize_returns_original_bytes() {
        assert_eq!(sample().serialize(), vec![0x12, 0x34, 0xab, 0xcd]);
    }
}
