use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jsonschema::JSONSchema;
use schemars::{JsonSchema, schema_for};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::parser::{ResponseFormat, ValidationIssue, ValidationResult};

pub const EXAMPLE_SCHEMA_SUFFIX: &str = ".schema.txt";
pub const JSON_SCHEMA_SUFFIX: &str = ".schema.json";

#[derive(Debug, Error)]
pub enum SchemaStoreError {
    #[error("failed to read schema directory {path}: {source}")]
    ReadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid schema for '{name}': {message}")]
    InvalidSchema { name: String, message: String },
}

/// A compiled JSON Schema together with its source document.
#[derive(Clone)]
pub struct StructuredSchema {
    document: Value,
    validator: Arc<JSONSchema>,
}

impl StructuredSchema {
    pub fn compile(name: &str, document: Value) -> Result<Self, SchemaStoreError> {
        let validator =
            JSONSchema::compile(&document).map_err(|err| SchemaStoreError::InvalidSchema {
                name: name.to_string(),
                message: err.to_string(),
            })?;

        Ok(Self {
            document,
            validator: Arc::new(validator),
        })
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    fn violations(&self, data: &Value) -> Vec<ValidationIssue> {
        match self.validator.validate(data) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|err| ValidationIssue {
                    path: err.instance_path.to_string(),
                    message: err.to_string(),
                    value: Some(err.instance.into_owned()),
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for StructuredSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructuredSchema")
            .field("document", &self.document)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum SchemaDocument {
    /// Literal JSON/YAML text shown to the model as a formatting guide.
    Example(String),
    Structured(StructuredSchema),
}

impl SchemaDocument {
    /// Text embedded into augmented prompts.
    pub fn prompt_text(&self) -> String {
        match self {
            Self::Example(text) => text.clone(),
            Self::Structured(schema) => serde_json::to_string_pretty(schema.document())
                .unwrap_or_else(|_| schema.document().to_string()),
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }
}

/// Named schemas keyed by prompt name. Reads are concurrent; writes take the
/// exclusive lock and replace any existing entry.
#[derive(Debug, Default)]
pub struct SchemaStore {
    schemas: RwLock<BTreeMap<String, Arc<SchemaDocument>>>,
}

impl SchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.schema.txt` and `*.schema.json` file in `directory`.
    ///
    /// Unreadable, empty, or malformed files are logged and skipped. A missing
    /// directory loads nothing. Returns the number of schemas loaded.
    pub fn load(&self, directory: &Path) -> Result<usize, SchemaStoreError> {
        if !directory.exists() {
            warn!(path = %directory.display(), "schema folder not found");
            return Ok(0);
        }

        let entries = fs::read_dir(directory).map_err(|source| SchemaStoreError::ReadDir {
            path: directory.display().to_string(),
            source,
        })?;

        let mut files = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        files.sort();

        let mut loaded = 0usize;
        for path in files {
            match load_schema_file(&path) {
                Some((name, document)) => {
                    debug!(schema = %name, "loaded schema");
                    self.insert(name, document);
                    loaded += 1;
                }
                None => continue,
            }
        }

        info!(count = loaded, path = %directory.display(), "loaded schemas");
        Ok(loaded)
    }

    pub fn has(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<SchemaDocument>> {
        self.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Registers a JSON Schema after checking that it compiles.
    pub fn add(&self, name: &str, schema: Value) -> Result<(), SchemaStoreError> {
        let compiled = StructuredSchema::compile(name, schema).inspect_err(|err| {
            warn!(schema = %name, "rejected schema: {err}");
        })?;
        self.insert(name.to_string(), SchemaDocument::Structured(compiled));
        debug!(schema = %name, "added schema");
        Ok(())
    }

    pub fn add_example(&self, name: &str, example: impl Into<String>) {
        self.insert(name.to_string(), SchemaDocument::Example(example.into()));
        debug!(schema = %name, "added example schema");
    }

    /// Registers the JSON Schema generated for `T`.
    pub fn add_contract<T: JsonSchema>(&self, name: &str) -> Result<(), SchemaStoreError> {
        let document =
            serde_json::to_value(schema_for!(T)).map_err(|err| SchemaStoreError::InvalidSchema {
                name: name.to_string(),
                message: err.to_string(),
            })?;
        self.add(name, document)
    }

    /// Checks `data` against the schema registered under `name`.
    ///
    /// Example schemas only guide formatting, so any data passes them. No text
    /// is parsed here: `format` is always `Unknown` and `sanitized_text` empty.
    pub fn validate(&self, data: &Value, name: &str) -> ValidationResult {
        let Some(schema) = self.get(name) else {
            return ValidationResult {
                valid: false,
                format: ResponseFormat::Unknown,
                data: Some(data.clone()),
                errors: vec![ValidationIssue::message(format!(
                    "Schema '{name}' not found"
                ))],
                sanitized_text: String::new(),
            };
        };

        let errors = match schema.as_ref() {
            SchemaDocument::Example(_) => Vec::new(),
            SchemaDocument::Structured(structured) => structured.violations(data),
        };

        ValidationResult {
            valid: errors.is_empty(),
            format: ResponseFormat::Unknown,
            data: Some(data.clone()),
            errors,
            sanitized_text: String::new(),
        }
    }

    fn insert(&self, name: String, document: SchemaDocument) {
        self.write().insert(name, Arc::new(document));
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<SchemaDocument>>> {
        match self.schemas.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<SchemaDocument>>> {
        match self.schemas.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn load_schema_file(path: &Path) -> Option<(String, SchemaDocument)> {
    let file_name = path.file_name()?.to_str()?;
    let (name, structured) = if let Some(name) = file_name.strip_suffix(EXAMPLE_SCHEMA_SUFFIX) {
        (name, false)
    } else if let Some(name) = file_name.strip_suffix(JSON_SCHEMA_SUFFIX) {
        (name, true)
    } else {
        return None;
    };

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(path = %path.display(), "failed to read schema file: {err}");
            return None;
        }
    };
    let content = content.trim();
    if content.is_empty() {
        warn!(path = %path.display(), "skipping empty schema file");
        return None;
    }

    if !structured {
        return Some((name.to_string(), SchemaDocument::Example(content.to_string())));
    }

    let document = match serde_json::from_str::<Value>(content) {
        Ok(document) => document,
        Err(err) => {
            warn!(path = %path.display(), "schema file is not valid JSON: {err}");
            return None;
        }
    };
    match StructuredSchema::compile(name, document) {
        Ok(schema) => Some((name.to_string(), SchemaDocument::Structured(schema))),
        Err(err) => {
            warn!(path = %path.display(), "skipping schema file: {err}");
            None
        }
    }
}
