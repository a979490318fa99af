//! Structured output parsing.
//!
//! A [`Schema`] is an explicit table of field descriptors. The
//! [`StructuredParser`] renders it as format instructions for the prompt,
//! and turns a raw completion into a [`StructuredRecord`] that satisfies
//! every descriptor, or rejects it.

use std::fmt::{self, Display};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").unwrap());

/// A check run on a present, well-typed field value.
pub type Validator = fn(&Value) -> Result<(), String>;

/// The JSON type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// A JSON string.
    String,
    /// A JSON number without a fractional part.
    Integer,
    /// Any JSON number.
    Number,
    /// `true` or `false`.
    Boolean,
    /// An array of strings.
    StringList,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
        }
    }

    fn json_schema(self) -> Value {
        match self {
            FieldType::String => json!({ "type": "string" }),
            FieldType::Integer => json!({ "type": "integer" }),
            FieldType::Number => json!({ "type": "number" }),
            FieldType::Boolean => json!({ "type": "boolean" }),
            FieldType::StringList => {
                json!({ "type": "array", "items": { "type": "string" } })
            }
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::StringList => "list of strings",
        })
    }
}

/// Describes one field of a structured record.
#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    /// Key of the field in the JSON object.
    pub name: String,
    /// Human-readable description shown to the model.
    pub description: String,
    /// Expected JSON type.
    pub ty: FieldType,
    /// Whether the key must be present.
    pub required: bool,
    /// Value used when an optional key is absent.
    pub default: Option<Value>,
    /// Extra check run after the type check.
    pub validator: Option<Validator>,
}

impl FieldDescriptor {
    /// Creates a required field.
    pub fn required<N, D>(name: N, ty: FieldType, description: D) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Self {
            name: name.into(),
            description: description.into(),
            ty,
            required: true,
            default: None,
            validator: None,
        }
    }

    /// Creates an optional field. `default` is used only when the key is
    /// absent.
    pub fn optional<N, D>(
        name: N,
        ty: FieldType,
        description: D,
        default: Option<Value>,
    ) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Self {
            required: false,
            default,
            ..Self::required(name, ty, description)
        }
    }

    /// Attaches a validator.
    #[inline]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    fn check(&self, value: &Value) -> Result<(), ValidationError> {
        if value.is_null() {
            return Err(ValidationError::new(&self.name, "must not be null"));
        }
        if !self.ty.matches(value) {
            return Err(ValidationError::new(
                &self.name,
                format!("expected {}, got `{value}`", self.ty),
            ));
        }
        if let Some(validator) = self.validator {
            validator(value).map_err(|reason| ValidationError::new(&self.name, reason))?;
        }
        Ok(())
    }
}

/// An ordered table of field descriptors.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    title: Option<String>,
    fields: Vec<FieldDescriptor>,
}

impl Schema {
    /// Creates an empty schema.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the title shown in the JSON schema.
    #[inline]
    pub fn with_title<S: Into<String>>(mut self, title: S) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Appends a field. A later field with the same name replaces the
    /// earlier one.
    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.retain(|existing| existing.name != field.name);
        self.fields.push(field);
        self
    }

    /// Returns the fields in declaration order.
    #[inline]
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Renders the schema as a JSON schema object.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let mut property = field.ty.json_schema();
            if let Value::Object(object) = &mut property {
                object.insert("description".to_owned(), field.description.clone().into());
                if let Some(default) = &field.default {
                    object.insert("default".to_owned(), default.clone());
                }
            }
            properties.insert(field.name.clone(), property);
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| field.required)
            .map(|field| field.name.as_str())
            .collect();

        let mut schema = json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });
        if let (Some(title), Value::Object(object)) = (&self.title, &mut schema) {
            object.insert("title".to_owned(), title.clone().into());
        }
        schema
    }
}

/// A field that did not satisfy its descriptor.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid field `{field}`: {reason}")]
pub struct ValidationError {
    /// Name of the offending field.
    pub field: String,
    /// What was wrong with it.
    pub reason: String,
}

impl ValidationError {
    fn new<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// An error from the structured parser.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// No JSON object could be read from the completion.
    #[error("malformed output: {0}")]
    Malformed(String),
    /// The JSON object did not satisfy the schema.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A validated record did not fit the requested type.
    #[error("failed to deserialize record: {0}")]
    Deserialize(#[from] serde_json::Error),
}

/// A JSON object accepted by a [`Schema`].
#[derive(Clone, Debug)]
pub struct StructuredRecord {
    fields: Map<String, Value>,
    schema: Arc<Schema>,
}

impl StructuredRecord {
    /// Returns the value of a field.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns the schema that accepted this record.
    #[inline]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Returns the record fields.
    #[inline]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Converts the record into a JSON object.
    #[inline]
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Converts the record into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ParseError> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

/// Parses completions into records of one schema.
#[derive(Clone, Debug)]
pub struct StructuredParser {
    schema: Arc<Schema>,
}

impl StructuredParser {
    /// Creates a parser for `schema`.
    #[inline]
    pub fn new(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
        }
    }

    /// Returns the schema.
    #[inline]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Returns instructions telling the model how to format its output.
    pub fn format_instructions(&self) -> String {
        format!(
            "The output must be a JSON object that conforms to the JSON schema \
             below. Do not add fields that are not listed in `properties`.\n\n\
             For example, for the schema {{\"properties\": {{\"foo\": {{\"type\": \
             \"array\", \"items\": {{\"type\": \"string\"}}}}}}, \"required\": \
             [\"foo\"]}} the object {{\"foo\": [\"bar\", \"baz\"]}} is valid, \
             while {{\"properties\": {{\"foo\": [\"bar\", \"baz\"]}}}} is not.\n\n\
             Here is the output schema:\n```\n{}\n```",
            self.schema.to_json_schema()
        )
    }

    /// Parses and validates a raw completion.
    ///
    /// The JSON object is taken from a markdown code fence when present,
    /// otherwise from the outermost pair of braces. Keys not declared in
    /// the schema are dropped.
    pub fn parse(&self, raw: &str) -> Result<StructuredRecord, ParseError> {
        let text = extract_json(raw)
            .ok_or_else(|| ParseError::Malformed("no JSON object found".to_owned()))?;
        let value: Value = serde_json::from_str(text)
            .map_err(|err| ParseError::Malformed(format!("invalid JSON: {err}")))?;
        let Value::Object(mut object) = value else {
            return Err(ParseError::Malformed("expected a JSON object".to_owned()));
        };
        trace!("parsed output with {} keys", object.len());

        let mut fields = Map::new();
        for field in self.schema.fields() {
            match object.remove(&field.name) {
                Some(value) => {
                    field.check(&value)?;
                    fields.insert(field.name.clone(), value);
                }
                None if field.required => {
                    return Err(ValidationError::new(&field.name, "field is required").into());
                }
                None => {
                    if let Some(default) = &field.default {
                        fields.insert(field.name.clone(), default.clone());
                    }
                }
            }
        }
        if !object.is_empty() {
            debug!(
                "dropping undeclared fields: {:?}",
                object.keys().collect::<Vec<_>>()
            );
        }

        Ok(StructuredRecord {
            fields,
            schema: Arc::clone(&self.schema),
        })
    }
}

fn extract_json(raw: &str) -> Option<&str> {
    if let Some(caps) = FENCED_JSON.captures(raw) {
        return caps.get(1).map(|m| m.as_str());
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    fn non_negative(value: &Value) -> Result<(), String> {
        match value.as_i64() {
            Some(age) if age >= 0 => Ok(()),
            _ => Err("must be a non-negative integer".to_owned()),
        }
    }

    fn patient_parser() -> StructuredParser {
        StructuredParser::new(
            Schema::new()
                .with_title("PatientRecord")
                .with_field(FieldDescriptor::required("name", FieldType::String, "患者姓名"))
                .with_field(
                    FieldDescriptor::required("age", FieldType::Integer, "患者年龄")
                        .with_validator(non_negative),
                )
                .with_field(FieldDescriptor::required(
                    "symptoms",
                    FieldType::StringList,
                    "症状列表",
                ))
                .with_field(FieldDescriptor::required("diagnosis", FieldType::String, "诊断"))
                .with_field(FieldDescriptor::optional(
                    "is_urgent",
                    FieldType::Boolean,
                    "是否加急",
                    Some(Value::Bool(false)),
                )),
        )
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Patient {
        name: String,
        age: u32,
        symptoms: Vec<String>,
        diagnosis: String,
        is_urgent: bool,
    }

    #[test]
    fn test_accepts_fenced_output() {
        let raw = "好的：\n```json\n{\"name\": \"赵敏\", \"age\": 30, \"symptoms\": [\"头晕\", \"恶心\"], \"diagnosis\": \"低血压\", \"extra\": 1}\n```";
        let record = patient_parser().parse(raw).unwrap();
        // Absent optional field falls back to its default.
        assert_eq!(record.get("is_urgent"), Some(&Value::Bool(false)));
        assert!(record.get("extra").is_none());
        assert_eq!(
            record.deserialize::<Patient>().unwrap(),
            Patient {
                name: "赵敏".into(),
                age: 30,
                symptoms: vec!["头晕".into(), "恶心".into()],
                diagnosis: "低血压".into(),
                is_urgent: false,
            }
        );
    }

    #[test]
    fn test_accepts_bare_braces() {
        let raw = "输出：{\"name\": \"张三\", \"age\": 45, \"symptoms\": [], \"diagnosis\": \"心绞痛\", \"is_urgent\": true} 以上";
        let record = patient_parser().parse(raw).unwrap();
        assert_eq!(record.get("is_urgent"), Some(&Value::Bool(true)));
        assert_eq!(record.schema().fields().len(), 5);
    }

    fn validation_field(raw: &str) -> String {
        match patient_parser().parse(raw) {
            Err(ParseError::Validation(err)) => err.field,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_errors() {
        assert_eq!(
            validation_field(r#"{"age": 30, "symptoms": [], "diagnosis": "x"}"#),
            "name"
        );
        assert_eq!(
            validation_field(r#"{"name": "a", "age": -1, "symptoms": [], "diagnosis": "x"}"#),
            "age"
        );
        // Integers are strict.
        for age in ["30.0", "\"30\"", "\"三十\""] {
            let raw = format!(
                r#"{{"name": "a", "age": {age}, "symptoms": [], "diagnosis": "x"}}"#
            );
            assert_eq!(validation_field(&raw), "age");
        }
        // Present but null is not absent.
        assert_eq!(
            validation_field(
                r#"{"name": "a", "age": 1, "symptoms": [], "diagnosis": "x", "is_urgent": null}"#
            ),
            "is_urgent"
        );
        assert_eq!(
            validation_field(r#"{"name": "a", "age": 1, "symptoms": "头痛", "diagnosis": "x"}"#),
            "symptoms"
        );
    }

    #[test]
    fn test_malformed_output() {
        let parser = patient_parser();
        for raw in ["无法提取", "{\"name\": ", "} {"] {
            assert!(matches!(parser.parse(raw), Err(ParseError::Malformed(_))), "{raw}");
        }
    }

    #[test]
    fn test_format_instructions() {
        let parser = patient_parser();
        let instructions = parser.format_instructions();
        assert!(instructions.contains("\"title\":\"PatientRecord\""));

        let schema = parser.schema().to_json_schema();
        assert_eq!(
            schema["required"],
            serde_json::json!(["name", "age", "symptoms", "diagnosis"])
        );
        assert_eq!(schema["properties"]["symptoms"]["items"]["type"], "string");
        assert_eq!(schema["properties"]["is_urgent"]["default"], false);
    }
}
