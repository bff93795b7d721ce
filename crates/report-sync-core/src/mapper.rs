//! Document metadata to remote property payloads.
//!
//! Every emitted property is checked against the discovered schema: a field
//! is only sent when the schema declares a compatible property type, and an
//! `Unknown` property is never written.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::blocks::{rich_text, validate_blocks, Block};
use crate::document::Document;
use crate::schema::{PropertyType, RemoteSchema};

/// Upper bound on emitted tags.
pub const MAX_TAGS: usize = 15;

/// Title property used when the schema does not advertise one.
pub const DEFAULT_TITLE_PROPERTY: &str = "Name";

/// Status written on publish when the document does not name one.
pub const DEFAULT_PUBLISHED_STATUS: &str = "Published";

/// Date formats accepted besides ISO-8601.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d.%m.%Y",
    "%Y%m%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
];

/// Property payload keyed by remote property name.
pub type PropertyPayload = BTreeMap<String, PropertyValue>;

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Title(String),
    RichText(String),
    Select(String),
    Status(String),
    MultiSelect(Vec<String>),
    /// `YYYY-MM-DD`
    Date(String),
    Relation(Vec<String>),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyType {
        match self {
            PropertyValue::Title(_) => PropertyType::Title,
            PropertyValue::RichText(_) => PropertyType::RichText,
            PropertyValue::Select(_) => PropertyType::Select,
            PropertyValue::Status(_) => PropertyType::Status,
            PropertyValue::MultiSelect(_) => PropertyType::MultiSelect,
            PropertyValue::Date(_) => PropertyType::Date,
            PropertyValue::Relation(_) => PropertyType::Relation,
        }
    }

    /// The single option this value selects, for enumerated single choices.
    pub fn selected_option(&self) -> Option<&str> {
        match self {
            PropertyValue::Select(v) | PropertyValue::Status(v) => Some(v),
            _ => None,
        }
    }

    /// Re-express the value as `kind`, when the two are interchangeable.
    pub fn reshape(&self, kind: PropertyType) -> Option<PropertyValue> {
        let text = match self {
            PropertyValue::Select(v) | PropertyValue::Status(v) | PropertyValue::RichText(v) => {
                v.clone()
            }
            PropertyValue::MultiSelect(v) if v.len() == 1 => v[0].clone(),
            _ => return None,
        };
        match kind {
            PropertyType::Select => Some(PropertyValue::Select(text)),
            PropertyType::Status => Some(PropertyValue::Status(text)),
            PropertyType::RichText => Some(PropertyValue::RichText(text)),
            PropertyType::MultiSelect => Some(PropertyValue::MultiSelect(vec![text])),
            _ => None,
        }
    }

    /// Remote wire representation.
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Title(text) => json!({ "title": rich_text(text) }),
            PropertyValue::RichText(text) => json!({ "rich_text": rich_text(text) }),
            PropertyValue::Select(name) => json!({ "select": { "name": name } }),
            PropertyValue::Status(name) => json!({ "status": { "name": name } }),
            PropertyValue::MultiSelect(names) => {
                let items: Vec<Value> = names.iter().map(|n| json!({ "name": n })).collect();
                json!({ "multi_select": items })
            }
            PropertyValue::Date(start) => json!({ "date": { "start": start } }),
            PropertyValue::Relation(ids) => {
                let items: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
                json!({ "relation": items })
            }
        }
    }
}

/// Serialize a payload into the remote `properties` object.
pub fn payload_to_json(payload: &PropertyPayload) -> Value {
    let map: Map<String, Value> = payload
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect();
    Value::Object(map)
}

/// Remote property names for each semantic field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyNames {
    pub doc_type: String,
    pub date: String,
    pub tags: String,
    pub status: String,
    pub bias: String,
    pub relations: String,
    pub content_hash: String,
    pub source: String,
}

impl Default for PropertyNames {
    fn default() -> Self {
        Self {
            doc_type: "Type".to_string(),
            date: "Date".to_string(),
            tags: "Tags".to_string(),
            status: "Status".to_string(),
            bias: "Bias".to_string(),
            relations: "Related".to_string(),
            content_hash: "Content Hash".to_string(),
            source: "Source".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// A problem found while normalizing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationNote {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationNote {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

/// An enumerated option the payload needs but the schema lacks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MissingOption {
    pub property: String,
    pub option: String,
}

/// Output of [`PropertyMapper::map`].
#[derive(Debug, Clone, PartialEq)]
pub struct MappedProperties {
    pub payload: PropertyPayload,
    pub title_property: String,
    pub tags: Vec<String>,
    pub doc_type: Option<String>,
    pub notes: Vec<ValidationNote>,
    pub missing_options: Vec<MissingOption>,
}

/// Result of a dry-run validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Metadata normalized independently of any schema.
#[derive(Debug, Clone, Default, PartialEq)]
struct NormalizedFields {
    doc_type: Option<String>,
    date: Option<String>,
    tags: Vec<String>,
    status: String,
    bias: Option<String>,
    relations: Vec<String>,
}

/// Maps document metadata onto a discovered schema.
#[derive(Debug, Clone, Default)]
pub struct PropertyMapper {
    names: PropertyNames,
}

impl PropertyMapper {
    pub fn new(names: PropertyNames) -> Self {
        Self { names }
    }

    pub fn names(&self) -> &PropertyNames {
        &self.names
    }

    /// Build the full property payload for `doc`.
    pub fn map(&self, doc: &Document, fingerprint: &str, schema: &RemoteSchema) -> MappedProperties {
        let (fields, mut notes) = self.normalize(doc);
        let title_property = schema
            .title_property()
            .unwrap_or(DEFAULT_TITLE_PROPERTY)
            .to_string();

        let mut payload = PropertyPayload::new();
        let mut missing_options = Vec::new();
        payload.insert(title_property.clone(), PropertyValue::Title(doc.title.clone()));

        if let Some(doc_type) = &fields.doc_type {
            self.emit_choice(
                schema,
                &self.names.doc_type,
                doc_type,
                &[
                    PropertyType::Select,
                    PropertyType::Status,
                    PropertyType::MultiSelect,
                    PropertyType::RichText,
                ],
                &mut payload,
                &mut missing_options,
                &mut notes,
            );
        }

        self.emit_choice(
            schema,
            &self.names.status,
            &fields.status,
            &[PropertyType::Status, PropertyType::Select],
            &mut payload,
            &mut missing_options,
            &mut notes,
        );

        if let Some(bias) = &fields.bias {
            self.emit_choice(
                schema,
                &self.names.bias,
                bias,
                &[PropertyType::Select, PropertyType::RichText],
                &mut payload,
                &mut missing_options,
                &mut notes,
            );
        }

        if let Some(date) = &fields.date {
            if declares(schema, &self.names.date, &[PropertyType::Date], &mut notes) {
                payload.insert(self.names.date.clone(), PropertyValue::Date(date.clone()));
            }
        }

        if !fields.tags.is_empty()
            && declares(schema, &self.names.tags, &[PropertyType::MultiSelect], &mut notes)
        {
            payload.insert(
                self.names.tags.clone(),
                PropertyValue::MultiSelect(fields.tags.clone()),
            );
        }

        if !fields.relations.is_empty()
            && declares(schema, &self.names.relations, &[PropertyType::Relation], &mut notes)
        {
            payload.insert(
                self.names.relations.clone(),
                PropertyValue::Relation(fields.relations.clone()),
            );
        }

        // Bookkeeping properties are only written when the schema has them.
        if is_kind(schema, &self.names.content_hash, PropertyType::RichText) {
            payload.insert(
                self.names.content_hash.clone(),
                PropertyValue::RichText(fingerprint.to_string()),
            );
        }
        if is_kind(schema, &self.names.source, PropertyType::RichText) {
            payload.insert(self.names.source.clone(), PropertyValue::RichText(doc.key()));
        }

        MappedProperties {
            payload,
            title_property,
            tags: fields.tags,
            doc_type: fields.doc_type,
            notes,
            missing_options,
        }
    }

    /// Title-only payload for the degraded last-resort attempt.
    pub fn minimal(&self, doc: &Document, schema: &RemoteSchema) -> PropertyPayload {
        let title_property = schema.title_property().unwrap_or(DEFAULT_TITLE_PROPERTY);
        let mut payload = PropertyPayload::new();
        payload.insert(title_property.to_string(), PropertyValue::Title(doc.title.clone()));
        payload
    }

    /// Check a document and its rendered blocks without touching the network.
    ///
    /// With a cached `schema`, incompatible or missing-option properties are
    /// reported as warnings too; without one only local checks run.
    pub fn validate(
        &self,
        doc: &Document,
        blocks: &[Block],
        schema: Option<&RemoteSchema>,
    ) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Some(e) = &doc.front_matter_error {
            errors.push(e.clone());
        }

        let (_, notes) = self.normalize(doc);
        for note in notes {
            let line = format!("{}: {}", note.field, note.message);
            match note.severity {
                Severity::Error => errors.push(line),
                Severity::Warning => warnings.push(line),
            }
        }

        if let Some(schema) = schema {
            let mapped = self.map(doc, "", schema);
            for note in mapped.notes {
                let line = format!("{}: {}", note.field, note.message);
                if note.severity == Severity::Warning && !warnings.contains(&line) {
                    warnings.push(line);
                }
            }
            for missing in mapped.missing_options {
                warnings.push(format!(
                    "{}: option '{}' does not exist yet and will be added",
                    missing.property, missing.option
                ));
            }
        }

        errors.extend(validate_blocks(blocks));

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_choice(
        &self,
        schema: &RemoteSchema,
        property: &str,
        wanted: &str,
        accepted: &[PropertyType],
        payload: &mut PropertyPayload,
        missing: &mut Vec<MissingOption>,
        notes: &mut Vec<ValidationNote>,
    ) {
        if !declares(schema, property, accepted, notes) {
            return;
        }
        let Some(spec) = schema.get(property) else {
            return;
        };

        let option = spec.find_option(wanted).unwrap_or(wanted).to_string();
        if matches!(spec.kind, PropertyType::Select | PropertyType::Status)
            && spec.find_option(wanted).is_none()
        {
            missing.push(MissingOption {
                property: property.to_string(),
                option: option.clone(),
            });
        }

        let value = match spec.kind {
            PropertyType::Select => PropertyValue::Select(option),
            PropertyType::Status => PropertyValue::Status(option),
            PropertyType::MultiSelect => PropertyValue::MultiSelect(vec![option]),
            PropertyType::RichText => PropertyValue::RichText(option),
            _ => return,
        };
        payload.insert(property.to_string(), value);
    }

    fn normalize(&self, doc: &Document) -> (NormalizedFields, Vec<ValidationNote>) {
        let mut notes = Vec::new();
        let mut fields = NormalizedFields {
            doc_type: doc.doc_type(),
            bias: doc.meta_str("bias").map(|b| title_case(&b)),
            ..Default::default()
        };

        if let Some(raw) = doc.metadata.get("date") {
            let text = match raw {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            match normalize_date(&text) {
                Some(date) => fields.date = Some(date),
                None => notes.push(ValidationNote::error(
                    "date",
                    format!("unrecognized date '{}', dropped", text),
                )),
            }
        }

        if let Some(raw) = doc.metadata.get("tags") {
            let raw_tags = tag_values(raw);
            let (tags, capped) = normalize_tags(&raw_tags);
            if capped {
                notes.push(ValidationNote::warning(
                    "tags",
                    format!("more than {} tags, extra tags dropped", MAX_TAGS),
                ));
            }
            if tags.is_empty() && !raw_tags.is_empty() {
                notes.push(ValidationNote::warning("tags", "no usable tags after cleanup"));
            }
            fields.tags = tags;
        }

        fields.status = match doc.status() {
            Some(s) if !matches!(s.to_lowercase().as_str(), "ready" | "final" | "done") => {
                title_case(&s)
            }
            _ => DEFAULT_PUBLISHED_STATUS.to_string(),
        };

        for key in ["related", "relations"] {
            if let Some(Value::Array(items)) = doc.metadata.get(key) {
                let before = fields.relations.len();
                fields
                    .relations
                    .extend(items.iter().filter_map(normalize_relation_id));
                let dropped = items.len() - (fields.relations.len() - before);
                if dropped > 0 {
                    notes.push(ValidationNote::warning(
                        key,
                        format!("{} malformed relation entr(y/ies) dropped", dropped),
                    ));
                }
            }
        }
        let mut seen = HashSet::new();
        fields.relations.retain(|id| seen.insert(id.clone()));

        (fields, notes)
    }
}

fn declares(
    schema: &RemoteSchema,
    property: &str,
    accepted: &[PropertyType],
    notes: &mut Vec<ValidationNote>,
) -> bool {
    match schema.get(property) {
        Some(spec) if accepted.contains(&spec.kind) => true,
        Some(spec) => {
            notes.push(ValidationNote::warning(
                property,
                format!("remote property has incompatible type {}, skipped", spec.kind),
            ));
            false
        }
        None => false,
    }
}

fn is_kind(schema: &RemoteSchema, property: &str, kind: PropertyType) -> bool {
    schema.get(property).is_some_and(|spec| spec.kind == kind)
}

/// Normalize a date to `YYYY-MM-DD`; `None` when it cannot be parsed.
pub fn normalize_date(raw: &str) -> Option<String> {
    let raw = raw.trim().trim_matches('"');
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive().format("%Y-%m-%d").to_string());
    }
    // ISO datetime without offset: keep only the date portion
    if let Some((date, _time)) = raw.split_once('T') {
        if let Ok(d) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            return Some(d.format("%Y-%m-%d").to_string());
        }
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .map(|d| d.format("%Y-%m-%d").to_string())
}

fn tag_values(raw: &Value) -> Vec<String> {
    match raw {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Clean, case-normalize, dedupe and cap tags.
///
/// Returns the tags and whether the cap dropped any.
pub fn normalize_tags(raw: &[String]) -> (Vec<String>, bool) {
    let mut seen = HashSet::new();
    let mut tags = Vec::new();
    let mut capped = false;

    for tag in raw {
        let cleaned: String = tag
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || matches!(c, '-' | '_' | '/' | '&' | '.') {
                    c
                } else {
                    ' '
                }
            })
            .collect();
        let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        let cleaned = cleaned.trim_matches(|c: char| matches!(c, '-' | '_' | '/' | '.'));
        if cleaned.is_empty() {
            continue;
        }

        let normalized = if is_ticker_like(cleaned) {
            cleaned.to_uppercase()
        } else {
            title_case(cleaned)
        };

        if !seen.insert(normalized.to_lowercase()) {
            continue;
        }
        if tags.len() == MAX_TAGS {
            capped = true;
            break;
        }
        tags.push(normalized);
    }

    (tags, capped)
}

fn is_ticker_like(token: &str) -> bool {
    let len = token.chars().count();
    (1..=6).contains(&len) && token.chars().all(|c| c.is_ascii_alphanumeric())
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Accept a raw id or an object with an `id` field; `None` when malformed.
pub fn normalize_relation_id(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("id")?.as_str()?,
        _ => return None,
    };
    let hex: String = raw.trim().chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let hex = hex.to_lowercase();
    Some(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}
