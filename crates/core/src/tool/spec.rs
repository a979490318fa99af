use std::collections::HashSet;

use schemars::JsonSchema;
use serde_json::{Map, Value, json};

use super::Error;

/// Primitive type of a tool parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParameterType {
    /// A JSON string.
    String,
    /// A JSON number without fractional part.
    Integer,
    /// Any JSON number.
    Number,
    /// A JSON boolean.
    Boolean,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
}

impl ParameterType {
    fn from_schema_name(name: &str) -> Option<Self> {
        Some(match name {
            "string" => ParameterType::String,
            "integer" => ParameterType::Integer,
            "number" => ParameterType::Number,
            "boolean" => ParameterType::Boolean,
            "array" => ParameterType::Array,
            "object" => ParameterType::Object,
            _ => return None,
        })
    }

    fn schema_name(self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Array => value.is_array(),
            ParameterType::Object => value.is_object(),
        }
    }
}

/// A declared parameter of a tool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParameterSpec {
    /// Name of the parameter.
    pub name: String,
    /// Expected type.
    pub ty: ParameterType,
    /// Description shown to the model.
    pub description: String,
    /// Whether the model must provide this parameter.
    pub required: bool,
}

impl ParameterSpec {
    /// Declares a required parameter.
    #[inline]
    pub fn required<S1, S2>(name: S1, ty: ParameterType, description: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            name: name.into(),
            ty,
            description: description.into(),
            required: true,
        }
    }

    /// Declares an optional parameter.
    #[inline]
    pub fn optional<S1, S2>(name: S1, ty: ParameterType, description: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            required: false,
            ..Self::required(name, ty, description)
        }
    }
}

/// The advertised signature of a tool.
///
/// A spec is used both to describe the tool to the model and to check
/// the arguments the model sends back.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ToolSpec {
    /// Name of the tool, unique within a registry.
    pub name: String,
    /// Description of the tool.
    pub description: String,
    /// Parameters in declaration order.
    pub parameters: Vec<ParameterSpec>,
}

impl ToolSpec {
    /// Creates a spec without parameters.
    #[inline]
    pub fn new<S1: Into<String>, S2: Into<String>>(
        name: S1,
        description: S2,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: vec![],
        }
    }

    /// Adds a parameter.
    #[inline]
    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Creates a spec from an object JSON schema.
    ///
    /// Each property becomes a parameter. A property typed as a list
    /// takes its first non-null type, which is how optional fields
    /// appear in generated schemas.
    pub fn from_schema<S1: Into<String>, S2: Into<String>>(
        name: S1,
        description: S2,
        schema: &Value,
    ) -> Result<Self, Error> {
        let required: HashSet<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut spec = Self::new(name, description);
        let Some(properties) = schema.get("properties") else {
            return Ok(spec);
        };
        let properties = properties.as_object().ok_or_else(|| {
            Error::registration().with_reason("`properties` is not an object")
        })?;
        for (param_name, property) in properties {
            let ty = property_type(property).ok_or_else(|| {
                Error::registration().with_reason(format!(
                    "parameter `{param_name}` has no supported type"
                ))
            })?;
            let description = property
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            spec.parameters.push(ParameterSpec {
                name: param_name.clone(),
                ty,
                description: description.to_owned(),
                required: required.contains(param_name.as_str()),
            });
        }
        Ok(spec)
    }

    /// Creates a spec from the schema generated for `T`.
    pub fn for_input<T: JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, Error> {
        let schema = schemars::schema_for!(T);
        let schema = serde_json::to_value(&schema)
            .map_err(|err| Error::registration().with_reason(format!("{err}")))?;
        Self::from_schema(name, description, &schema)
    }

    /// Checks the name and parameters are well formed.
    pub fn validate(&self) -> Result<(), Error> {
        let valid_name = !self.name.is_empty()
            && self.name.len() <= 64
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(Error::registration()
                .with_reason(format!("invalid tool name `{}`", self.name)));
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if param.name.is_empty() {
                return Err(Error::registration().with_reason(format!(
                    "tool `{}` has an unnamed parameter",
                    self.name
                )));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(Error::registration().with_reason(format!(
                    "tool `{}` declares `{}` twice",
                    self.name, param.name
                )));
            }
        }
        Ok(())
    }

    /// Renders the parameters as an object JSON schema.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.parameters {
            let mut property = json!({ "type": param.ty.schema_name() });
            if !param.description.is_empty() {
                property["description"] = param.description.clone().into();
            }
            properties.insert(param.name.clone(), property);
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Checks `arguments` against the declared parameters.
    ///
    /// Undeclared keys are left for the tool's own deserialization to
    /// accept or reject. `null` counts as absent.
    pub fn check_arguments(&self, arguments: &Value) -> Result<(), Error> {
        let Some(object) = arguments.as_object() else {
            return Err(Error::invalid_arguments().with_reason(format!(
                "expected a JSON object, got `{arguments}`"
            )));
        };
        for param in &self.parameters {
            match object.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(Error::invalid_arguments().with_reason(format!(
                        "missing required parameter `{}`",
                        param.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) if !param.ty.matches(value) => {
                    return Err(Error::invalid_arguments().with_reason(format!(
                        "parameter `{}` must be of type {}",
                        param.name,
                        param.ty.schema_name()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn property_type(property: &Value) -> Option<ParameterType> {
    match property.get("type")? {
        Value::String(name) => ParameterType::from_schema_name(name),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .find(|name| *name != "null")
            .and_then(ParameterType::from_schema_name),
        _ => None,
    }
}
