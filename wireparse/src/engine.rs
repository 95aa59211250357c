//! The parse engine: applies protocol definitions to byte buffers,
//! producing typed field maps with validation, statistics and an optional
//! field-value cache.

use crate::field::{extract, FieldValue, ProtocolDefinition};
use crate::result::{ParseResult, ParseStatus, ValidationOutcome};
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

/// Custom whole-packet validator: bytes plus the parsed result.
pub type CustomValidator = Arc<dyn Fn(&[u8], &ParseResult) -> bool + Send + Sync>;
/// Custom result formatter.
pub type CustomFormatter = Arc<dyn Fn(&ParseResult) -> String + Send + Sync>;

/// Engine feature toggles. Each is independent.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Evaluate field constraints and the required-field rule.
    pub validation: bool,
    /// Run the protocol's checksum validator when it defines one. Built-in
    /// TCP/UDP definitions define none (their checksums need the IP pseudo
    /// header), so for them this flag is a no-op.
    pub checksum_validation: bool,
    /// Honor per-field constraints (subset of `validation`).
    pub field_constraints: bool,
    /// Run validators registered with `add_custom_validator`.
    pub custom_validators: bool,
    /// Maintain `ParserStats`.
    pub performance_metrics: bool,
    /// Cache extracted field vectors keyed by (protocol, buffer digest).
    pub field_caching: bool,
    /// Cache capacity; half the entries are evicted when full.
    pub max_cache_entries: usize,
    /// Cap on recorded validation outcomes per parse.
    pub max_validation_errors: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            validation: true,
            checksum_validation: false,
            field_constraints: true,
            custom_validators: true,
            performance_metrics: true,
            field_caching: false,
            max_cache_entries: 1024,
            max_validation_errors: 64,
        }
    }
}

/// Aggregate and per-protocol parse statistics.
#[derive(Debug, Clone)]
pub struct ParserStats {
    pub total_packets_parsed: u64,
    pub successful_parses: u64,
    pub failed_parses: u64,
    pub total_parse_micros: u64,
    pub total_validation_micros: u64,
    pub min_parse_micros: u64,
    pub max_parse_micros: u64,
    pub avg_parse_micros: u64,
    pub avg_validation_micros: u64,
    pub protocol_usage: HashMap<String, u64>,
}

impl Default for ParserStats {
    fn default() -> Self {
        Self {
            total_packets_parsed: 0,
            successful_parses: 0,
            failed_parses: 0,
            total_parse_micros: 0,
            total_validation_micros: 0,
            min_parse_micros: u64::MAX,
            max_parse_micros: 0,
            avg_parse_micros: 0,
            avg_validation_micros: 0,
            protocol_usage: HashMap::new(),
        }
    }
}

type CacheKey = (String, [u8; 32]);

/// Table-driven protocol parser.
///
/// Holds its own set of registered protocols (typically copied out of a
/// [`crate::ProtocolRegistry`]); `parse` calls may run concurrently,
/// registration is exclusive.
pub struct ProtocolParser {
    protocols: RwLock<IndexMap<String, ProtocolDefinition>>,
    config: ParserConfig,
    stats: Mutex<ParserStats>,
    cache: Mutex<HashMap<CacheKey, Vec<(String, FieldValue)>>>,
    custom_validators: RwLock<HashMap<String, CustomValidator>>,
    custom_formatters: RwLock<HashMap<String, CustomFormatter>>,
    profiling: AtomicBool,
}

impl ProtocolParser {
    pub fn new(config: ParserConfig) -> Self {
        let profiling = config.performance_metrics;
        Self {
            protocols: RwLock::new(IndexMap::new()),
            config,
            stats: Mutex::new(ParserStats::default()),
            cache: Mutex::new(HashMap::new()),
            custom_validators: RwLock::new(HashMap::new()),
            custom_formatters: RwLock::new(HashMap::new()),
            profiling: AtomicBool::new(profiling),
        }
    }

    /// Parser preloaded with every built-in protocol.
    pub fn with_builtins(config: ParserConfig) -> Self {
        let parser = Self::new(config);
        for protocol in crate::builtins::all() {
            let _ = parser.register_protocol(protocol);
        }
        parser
    }

    /// Returns false if the name is taken.
    pub fn register_protocol(&self, protocol: ProtocolDefinition) -> bool {
        let mut protocols = self.protocols.write().unwrap();
        if protocols.contains_key(&protocol.name) {
            return false;
        }
        protocols.insert(protocol.name.clone(), protocol);
        true
    }

    pub fn unregister_protocol(&self, name: &str) -> bool {
        self.protocols.write().unwrap().shift_remove(name).is_some()
    }

    pub fn has_protocol(&self, name: &str) -> bool {
        self.protocols.read().unwrap().contains_key(name)
    }

    pub fn supported_protocols(&self) -> Vec<String> {
        self.protocols.read().unwrap().keys().cloned().collect()
    }

    pub fn supported_formats(&self) -> &'static [&'static str] {
        &["json", "xml", "csv", "human"]
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn enable_profiling(&self, enable: bool) {
        self.profiling.store(enable, Ordering::Relaxed);
    }

    pub fn is_profiling_enabled(&self) -> bool {
        self.profiling.load(Ordering::Relaxed)
    }

    /// Parses `buffer` with a registered protocol. An empty name applies
    /// every registered protocol and returns the first result.
    pub fn parse(&self, buffer: &[u8], protocol_name: &str) -> ParseResult {
        if protocol_name.is_empty() {
            return self.parse_all(buffer).into_iter().next().unwrap_or_else(|| {
                ParseResult::error(ParseStatus::ProtocolNotFound, "no protocols registered")
            });
        }
        let definition = {
            let protocols = self.protocols.read().unwrap();
            match protocols.get(protocol_name) {
                Some(definition) => definition.clone(),
                None => {
                    let result = ParseResult::error(
                        ParseStatus::ProtocolNotFound,
                        &format!("protocol not found: {protocol_name}"),
                    );
                    self.record(&result, 0);
                    return result;
                }
            }
        };
        self.parse_with(buffer, &definition)
    }

    /// Parses `buffer` with an explicit definition.
    pub fn parse_with(&self, buffer: &[u8], definition: &ProtocolDefinition) -> ParseResult {
        let started = Instant::now();
        let mut result = self.parse_inner(buffer, definition);
        result.parse_micros = started.elapsed().as_micros() as u64;
        self.record(&result, result.parse_micros);
        result
    }

    /// Applies every registered protocol to the buffer, in registration
    /// order. For callers with no a-priori protocol identity.
    pub fn parse_all(&self, buffer: &[u8]) -> Vec<ParseResult> {
        let definitions: Vec<ProtocolDefinition> = {
            let protocols = self.protocols.read().unwrap();
            protocols.values().cloned().collect()
        };
        definitions
            .iter()
            .map(|definition| self.parse_with(buffer, definition))
            .collect()
    }

    pub fn validate(&self, buffer: &[u8], protocol_name: &str) -> bool {
        self.parse(buffer, protocol_name).is_success()
    }

    /// Formats a result as `json`, `xml`, `csv` or `human` (the default).
    pub fn format(&self, result: &ParseResult, format: &str) -> String {
        match format {
            "json" => result.to_json(),
            "xml" => result.to_xml(),
            "csv" => result.to_csv(),
            _ => result.to_human(),
        }
    }

    /// Runs the custom formatter registered for the result's protocol.
    pub fn format_custom(&self, result: &ParseResult) -> Option<String> {
        let formatters = self.custom_formatters.read().unwrap();
        formatters.get(&result.protocol).map(|f| f(result))
    }

    pub fn add_custom_validator(&self, protocol_name: &str, validator: CustomValidator) -> bool {
        if !self.has_protocol(protocol_name) {
            return false;
        }
        self.custom_validators
            .write()
            .unwrap()
            .insert(protocol_name.to_string(), validator);
        true
    }

    pub fn add_custom_formatter(&self, protocol_name: &str, formatter: CustomFormatter) -> bool {
        if !self.has_protocol(protocol_name) {
            return false;
        }
        self.custom_formatters
            .write()
            .unwrap()
            .insert(protocol_name.to_string(), formatter);
        true
    }

    pub fn stats(&self) -> ParserStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap() = ParserStats::default();
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    fn parse_inner(&self, buffer: &[u8], definition: &ProtocolDefinition) -> ParseResult {
        let mut result = ParseResult {
            status: Some(ParseStatus::Success),
            protocol: definition.name.clone(),
            version: definition.version.clone(),
            packet_length: buffer.len(),
            raw: buffer.to_vec(),
            ..ParseResult::default()
        };

        if buffer.len() < definition.total_length() {
            result.status = Some(ParseStatus::PacketTooShort);
            result.error = Some(format!(
                "buffer is {} bytes, protocol {} spans {}",
                buffer.len(),
                definition.name,
                definition.total_length()
            ));
            return result;
        }

        let cache_key = if self.config.field_caching {
            let key = (definition.name.clone(), digest(buffer));
            if let Some(fields) = self.cache.lock().unwrap().get(&key) {
                for (name, value) in fields {
                    result.fields.insert(name.clone(), value.clone());
                }
                result.parsed_bytes = definition
                    .fields()
                    .iter()
                    .filter(|f| result.fields.contains_key(&f.name))
                    .map(|f| f.offset + f.length)
                    .max()
                    .unwrap_or(0);
                self.validate_result(buffer, definition, &mut result);
                return result;
            }
            Some(key)
        } else {
            None
        };

        let mut parsed_bytes = 0usize;
        for field in definition.fields() {
            if field.offset + field.length > buffer.len() {
                continue;
            }

            let field_started = Instant::now();
            let mut value = extract(buffer, field);
            value.extract_micros = field_started.elapsed().as_micros() as u64;
            result.fields.insert(field.name.clone(), value);
            parsed_bytes = parsed_bytes.max(field.offset + field.length);
        }
        result.parsed_bytes = parsed_bytes;

        if let Some(key) = cache_key {
            let fields: Vec<(String, FieldValue)> = result
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            let mut cache = self.cache.lock().unwrap();
            if cache.len() >= self.config.max_cache_entries {
                evict_half(&mut cache);
            }
            cache.insert(key, fields);
        }

        self.validate_result(buffer, definition, &mut result);
        result
    }

    fn validate_result(
        &self,
        buffer: &[u8],
        definition: &ProtocolDefinition,
        result: &mut ParseResult,
    ) {
        if self.config.validation {
            let started = Instant::now();
            for field in definition.fields() {
                if result.validations.len() >= self.config.max_validation_errors {
                    break;
                }
                let value = result.fields.get(&field.name);
                let (valid, message) = match value {
                    None if field.required => (false, "required field absent".to_string()),
                    None => continue,
                    Some(value) => {
                        if !value.valid {
                            (false, "extraction failed".to_string())
                        } else if self.config.field_constraints {
                            match check_constraint(buffer, field, value) {
                                Ok(()) => continue,
                                Err(message) => (false, message),
                            }
                        } else {
                            continue;
                        }
                    }
                };
                result.validations.push(ValidationOutcome {
                    field_name: field.name.clone(),
                    valid,
                    message,
                    validation_micros: started.elapsed().as_micros() as u64,
                });
                if field.required {
                    result.status = Some(ParseStatus::ValidationError);
                }
            }
            result.validation_micros = started.elapsed().as_micros() as u64;
        }

        if self.config.checksum_validation && result.is_success() {
            if let Some(ref validator) = definition.validator {
                if !validator(buffer) {
                    result.status = Some(ParseStatus::ChecksumError);
                    result.error = Some("checksum validation failed".to_string());
                }
            }
        }

        if self.config.custom_validators && result.is_success() {
            let validator = {
                let validators = self.custom_validators.read().unwrap();
                validators.get(&definition.name).cloned()
            };
            if let Some(validator) = validator {
                if !validator(buffer, result) {
                    result.status = Some(ParseStatus::ValidationError);
                    result.error = Some("custom validator rejected packet".to_string());
                }
            }
        }
    }

    fn record(&self, result: &ParseResult, parse_micros: u64) {
        if !self.profiling.load(Ordering::Relaxed) {
            return;
        }
        let mut stats = self.stats.lock().unwrap();
        stats.total_packets_parsed += 1;
        if result.is_success() {
            stats.successful_parses += 1;
        } else {
            stats.failed_parses += 1;
        }
        stats.total_parse_micros += parse_micros;
        stats.total_validation_micros += result.validation_micros;
        stats.min_parse_micros = stats.min_parse_micros.min(parse_micros);
        stats.max_parse_micros = stats.max_parse_micros.max(parse_micros);
        let denominator = stats.total_packets_parsed.max(1);
        stats.avg_parse_micros = stats.total_parse_micros / denominator;
        stats.avg_validation_micros = stats.total_validation_micros / denominator;
        if !result.protocol.is_empty() {
            *stats.protocol_usage.entry(result.protocol.clone()).or_insert(0) += 1;
        } else {
            debug!("parse result without protocol name, not counted per-protocol");
        }
    }
}

fn check_constraint(
    buffer: &[u8],
    field: &crate::field::FieldDefinition,
    value: &FieldValue,
) -> Result<(), String> {
    let constraint = match &field.constraint {
        Some(constraint) => constraint,
        None => return Ok(()),
    };

    if constraint.min.is_some() || constraint.max.is_some() || !constraint.allowed.is_empty() {
        let numeric = value
            .data
            .as_u64()
            .ok_or_else(|| "constraint needs a numeric value".to_string())?;
        if let Some(min) = constraint.min {
            if numeric < min {
                return Err(format!("{numeric} below minimum {min}"));
            }
        }
        if let Some(max) = constraint.max {
            if numeric > max {
                return Err(format!("{numeric} above maximum {max}"));
            }
        }
        if !constraint.allowed.is_empty() && !constraint.allowed.contains(&numeric) {
            return Err(format!("{numeric} not in allowed set"));
        }
    }

    if let Some(ref pattern) = constraint.pattern {
        if !value.display().contains(pattern.as_str()) {
            return Err(format!("display form does not contain {pattern:?}"));
        }
    }

    if let Some(ref predicate) = constraint.predicate {
        let end = field.offset + field.length;
        if end > buffer.len() || !predicate(&buffer[field.offset..end]) {
            return Err("predicate rejected field bytes".to_string());
        }
    }

    Ok(())
}

fn digest(buffer: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(buffer);
    hasher.finalize().into()
}

/// Bulk eviction: drop half the entries when the cache is full.
fn evict_half(cache: &mut HashMap<CacheKey, Vec<(String, FieldValue)>>) {
    let target = cache.len() / 2;
    let keys: Vec<CacheKey> = cache.keys().take(target).cloned().collect();
    if !keys.is_empty() {
        warn!(evicted = keys.len(), "parser field cache full, evicting");
    }
    for key in keys {
        cache.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldData, FieldDefinition};
    use std::sync::Arc;

    fn custom_proto() -> ProtocolDefinition {
        ProtocolDefinition::new("custom17", "1.0")
            .with_field(FieldDefinition::u32("header", 0))
            .with_field(FieldDefinition::u8("version", 4))
            .with_field(FieldDefinition::u16("length", 5))
            .with_field(FieldDefinition::bytes("data", 7, 10))
    }

    const SAMPLE: [u8; 17] = [
        0x12, 0x34, 0x56, 0x78, 0x01, 0x00, 0x0a, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x11, 0x22,
        0x33, 0x44,
    ];

    #[test]
    fn test_parse_custom_protocol() {
        let parser = ProtocolParser::new(ParserConfig::default());
        assert!(parser.register_protocol(custom_proto()));

        let result = parser.parse(&SAMPLE, "custom17");
        assert!(result.is_success());
        assert_eq!(result.field("header").unwrap().data, FieldData::U32(0x1234_5678));
        assert_eq!(result.field("version").unwrap().data, FieldData::U8(1));
        assert_eq!(result.field("length").unwrap().data, FieldData::U16(10));
        assert_eq!(
            result.field("data").unwrap().data,
            FieldData::Bytes(SAMPLE[7..].to_vec())
        );
        assert_eq!(result.parsed_bytes, 17);
        assert_eq!(result.packet_length, 17);
    }

    #[test]
    fn test_short_buffer_yields_too_short_and_no_fields() {
        let parser = ProtocolParser::new(ParserConfig::default());
        parser.register_protocol(custom_proto());

        let result = parser.parse(&SAMPLE[..5], "custom17");
        assert_eq!(result.status(), ParseStatus::PacketTooShort);
        assert!(result.fields.is_empty());
    }

    #[test]
    fn test_unknown_protocol() {
        let parser = ProtocolParser::new(ParserConfig::default());
        let result = parser.parse(&SAMPLE, "nope");
        assert_eq!(result.status(), ParseStatus::ProtocolNotFound);
    }

    #[test]
    fn test_parse_all_returns_result_per_protocol() {
        let parser = ProtocolParser::new(ParserConfig::default());
        parser.register_protocol(custom_proto());
        parser.register_protocol(crate::builtins::ethernet());

        let results = parser.parse_all(&SAMPLE);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].protocol, "custom17");
        assert_eq!(results[1].protocol, "ethernet");
    }

    #[test]
    fn test_stats_accumulate() {
        let parser = ProtocolParser::new(ParserConfig::default());
        parser.register_protocol(custom_proto());

        let n = 5;
        for _ in 0..n {
            assert!(parser.parse(&SAMPLE, "custom17").is_success());
        }

        let stats = parser.stats();
        assert_eq!(stats.total_packets_parsed, n);
        assert_eq!(stats.successful_parses, n);
        assert_eq!(stats.failed_parses, 0);
        assert_eq!(stats.protocol_usage["custom17"], n);
        assert!(stats.min_parse_micros <= stats.max_parse_micros);
        assert!(stats.avg_parse_micros >= stats.min_parse_micros / n.max(1));
        assert!(stats.avg_parse_micros <= stats.max_parse_micros);
    }

    #[test]
    fn test_required_field_invalid_extraction_fails_parse() {
        // Width mismatch on a fixed kind makes the extraction invalid; a
        // required field that fails to extract must fail the parse.
        let proto = ProtocolDefinition::new("strict", "1.0")
            .with_field(FieldDefinition::new("head", 0, 3, crate::field::FieldKind::U32));
        let parser = ProtocolParser::new(ParserConfig::default());
        parser.register_protocol(proto);

        let result = parser.parse(&[1, 2, 3, 4], "strict");
        assert_eq!(result.status(), ParseStatus::ValidationError);
        assert!(result.validations.iter().any(|v| !v.valid));
    }

    #[test]
    fn test_constraint_violation_fails_required_field() {
        let proto = ProtocolDefinition::new("ranged", "1.0").with_field(
            FieldDefinition::u8("op", 0).constrain(crate::field::FieldConstraint::range(1, 2)),
        );
        let parser = ProtocolParser::new(ParserConfig::default());
        parser.register_protocol(proto);

        assert!(parser.parse(&[1], "ranged").is_success());
        let bad = parser.parse(&[9], "ranged");
        assert_eq!(bad.status(), ParseStatus::ValidationError);
        assert!(!bad.validations.is_empty());
    }

    #[test]
    fn test_checksum_flag_gates_validator() {
        let always_fail = ProtocolDefinition::new("sum", "1.0")
            .with_field(FieldDefinition::u8("x", 0))
            .with_validator(Arc::new(|_| false));

        let parser = ProtocolParser::new(ParserConfig::default());
        parser.register_protocol(always_fail.clone());
        assert!(parser.parse(&[0], "sum").is_success());

        let parser = ProtocolParser::new(ParserConfig {
            checksum_validation: true,
            ..ParserConfig::default()
        });
        parser.register_protocol(always_fail);
        assert_eq!(parser.parse(&[0], "sum").status(), ParseStatus::ChecksumError);
    }

    #[test]
    fn test_cache_hit_produces_identical_fields() {
        let parser = ProtocolParser::new(ParserConfig {
            field_caching: true,
            ..ParserConfig::default()
        });
        parser.register_protocol(custom_proto());

        let first = parser.parse(&SAMPLE, "custom17");
        assert_eq!(parser.cache_len(), 1);
        let second = parser.parse(&SAMPLE, "custom17");
        assert_eq!(first.fields, second.fields);
        assert_eq!(second.parsed_bytes, 17);
    }

    #[test]
    fn test_cache_eviction_bulk_half() {
        let parser = ProtocolParser::new(ParserConfig {
            field_caching: true,
            max_cache_entries: 4,
            ..ParserConfig::default()
        });
        let proto = ProtocolDefinition::new("b", "1.0").with_field(FieldDefinition::u8("x", 0));
        parser.register_protocol(proto);

        for i in 0..4u8 {
            parser.parse(&[i], "b");
        }
        assert_eq!(parser.cache_len(), 4);
        parser.parse(&[200], "b");
        assert!(parser.cache_len() <= 3);
    }

    #[test]
    fn test_custom_validator_and_formatter() {
        let parser = ProtocolParser::new(ParserConfig::default());
        parser.register_protocol(custom_proto());

        assert!(parser.add_custom_validator(
            "custom17",
            Arc::new(|bytes, _| bytes[4] == 0x01),
        ));
        assert!(parser.parse(&SAMPLE, "custom17").is_success());

        let mut bad = SAMPLE;
        bad[4] = 2;
        assert_eq!(
            parser.parse(&bad, "custom17").status(),
            ParseStatus::ValidationError
        );

        assert!(parser.add_custom_formatter(
            "custom17",
            Arc::new(|result| format!("fields={}", result.fields.len())),
        ));
        let result = parser.parse(&SAMPLE, "custom17");
        assert_eq!(parser.format_custom(&result).unwrap(), "fields=4");
    }

    #[test]
    fn test_json_format_round_trip_structural() {
        let parser = ProtocolParser::new(ParserConfig::default());
        parser.register_protocol(custom_proto());
        let result = parser.parse(&SAMPLE, "custom17");

        let rebuilt = ParseResult::from_json(&parser.format(&result, "json")).unwrap();
        assert_eq!(rebuilt.protocol, result.protocol);
        let names_a: Vec<_> = result.fields.keys().collect();
        let names_b: Vec<_> = rebuilt.fields.keys().collect();
        assert_eq!(names_a, names_b);
        for name in result.fields.keys() {
            assert_eq!(result.fields[name].data, rebuilt.fields[name].data);
        }
    }
}
