use arbor_tree::FileRef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Input values keyed by variable name, as sent in the request payload.
pub type InputValues = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputKind {
    #[serde(rename = "text-input")]
    TextInput,
    #[serde(rename = "paragraph")]
    Paragraph,
    #[serde(rename = "select")]
    Select,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "checkbox")]
    Checkbox,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "file-list")]
    FileList,
    #[serde(rename = "json_object")]
    JsonObject,
}

impl InputKind {
    pub fn is_file(self) -> bool {
        matches!(self, Self::File | Self::FileList)
    }
}

/// One field of the conversation input form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    pub variable: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub kind: InputKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub hide: bool,
}

impl InputField {
    pub fn new(variable: impl Into<String>, kind: InputKind) -> Self {
        Self {
            variable: variable.into(),
            label: String::new(),
            kind,
            required: false,
            hide: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hide = true;
        self
    }
}

/// Absent, null, blank strings and empty file lists count as empty. Booleans and
/// numbers are always present.
pub fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Bool(_) | Value::Number(_) | Value::Object(_)) => false,
    }
}

/// File references held by a file or file-list value; entries that do not decode are
/// skipped.
pub fn files_in(value: &Value) -> Vec<FileRef> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        Value::Object(_) => serde_json::from_value(value.clone()).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Coerces checkbox fields to real booleans so the server never sees `"true"` or `1`.
pub fn normalize_inputs(schema: &[InputField], values: &InputValues) -> InputValues {
    let mut normalized = values.clone();
    for field in schema.iter().filter(|field| field.kind == InputKind::Checkbox) {
        let coerced = match values.get(&field.variable) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => {
                matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
            }
            Some(Value::Number(number)) => number.as_f64().is_some_and(|raw| raw != 0.0),
            Some(_) | None => false,
        };
        normalized.insert(field.variable.clone(), Value::Bool(coerced));
    }
    normalized
}
