//! Parser contracts and the suffix dispatch registry.
//!
//! Two parser shapes exist.  A [`SnapshotParser`] consumes a path and re-reads
//! the whole file; a [`DeltaParser`] consumes only the text appended since the
//! previous read.  Both return an extras map (merged into record metadata) and
//! one or more payload maps.  Parsers never touch monitor state; they signal
//! failure through `Err`, which the owning worker stores as a worker failure.
//!
//! Snapshot dispatch order: explicit file-type override, then the custom
//! parser handle, then suffix lookup in the built-in registry, then "no parser
//! available".  Delta dispatch is simpler: the custom handle if present,
//! otherwise the plain line parser which emits one `{"message": <line>}`
//! payload per complete line.

use fnv::FnvHashMap;
use lazy_static::lazy_static;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// A single-level (or nested, when the format nests) mapping from string keys
/// to values.  Both record payloads and parser extras use this shape.
pub type Payload = serde_json::Map<String, Value>;

/// Error returned by a parser invocation.
#[derive(Debug)]
pub enum ParseError {
    /// The file could not be read.
    Io(io::Error),
    /// The content did not parse under the expected format.
    Syntax(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Io(err) => write!(f, "{err}"),
            ParseError::Syntax(msg) => f.write_str(msg),
        }
    }
}

impl Error for ParseError {}

impl From<io::Error> for ParseError {
    fn from(err: io::Error) -> Self {
        ParseError::Io(err)
    }
}

/// Result of a snapshot parse: metadata extras plus the payload mapping.
#[derive(Debug, Default, Clone)]
pub struct Parsed {
    /// Parser-supplied additions to the record metadata.
    pub extras: Payload,
    /// The extracted key-value data.
    pub data: Payload,
}

/// Result of a delta parse: extras plus one payload per independent record
/// found in the delta.  Workers invoke the callback once per payload, in
/// order.
#[derive(Debug, Default, Clone)]
pub struct DeltaParsed {
    /// Parser-supplied additions to the record metadata.
    pub extras: Payload,
    /// One mapping per record contained in the delta.
    pub payloads: Vec<Payload>,
}

/// A parser that re-reads a whole file on every observed change.
pub trait SnapshotParser: Send + Sync {
    /// Parse the file at `path`.  `args` carries the static keyword arguments
    /// configured on the observation request.
    fn parse_file(&self, path: &Path, args: &Payload) -> Result<Parsed, ParseError>;
}

impl<F> SnapshotParser for F
where
    F: Fn(&Path, &Payload) -> Result<Parsed, ParseError> + Send + Sync,
{
    fn parse_file(&self, path: &Path, args: &Payload) -> Result<Parsed, ParseError> {
        self(path, args)
    }
}

/// A parser that consumes only the bytes appended since the previous read.
pub trait DeltaParser: Send + Sync {
    /// Parse `text`, the newline-joined complete lines read this tick.
    fn parse_delta(&self, text: &str, args: &Payload) -> Result<DeltaParsed, ParseError>;
}

impl<F> DeltaParser for F
where
    F: Fn(&str, &Payload) -> Result<DeltaParsed, ParseError> + Send + Sync,
{
    fn parse_delta(&self, text: &str, args: &Payload) -> Result<DeltaParsed, ParseError> {
        self(text, args)
    }
}

/// Built-in snapshot formats, used for suffix dispatch and for the explicit
/// file-type override on track requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    /// JSON documents with an object root.
    Json,
    /// TOML documents.
    Toml,
    /// YAML documents with a mapping root.
    Yaml,
    /// Delimited files; each column becomes a key mapping to the column's
    /// values.
    Csv,
}

impl FileFormat {
    /// Look up the format registered for a file suffix, if any.
    #[must_use]
    pub fn from_suffix(suffix: &str) -> Option<FileFormat> {
        SUFFIXES.get(suffix).copied()
    }

    /// The built-in parser for this format.
    #[must_use]
    pub fn parser(self) -> &'static dyn SnapshotParser {
        match self {
            FileFormat::Json => &JsonFile,
            FileFormat::Toml => &TomlFile,
            FileFormat::Yaml => &YamlFile,
            FileFormat::Csv => &CsvFile,
        }
    }
}

lazy_static! {
    static ref SUFFIXES: FnvHashMap<&'static str, FileFormat> = {
        let mut map = FnvHashMap::default();
        map.insert("json", FileFormat::Json);
        map.insert("toml", FileFormat::Toml);
        map.insert("yaml", FileFormat::Yaml);
        map.insert("yml", FileFormat::Yaml);
        map.insert("csv", FileFormat::Csv);
        map
    };
}

/// Resolve the built-in parser for `path` by its suffix.
#[must_use]
pub fn for_path(path: &Path) -> Option<&'static dyn SnapshotParser> {
    let suffix = path.extension()?.to_str()?;
    Some(FileFormat::from_suffix(suffix)?.parser())
}

fn require_object(value: Value, what: &str) -> Result<Payload, ParseError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ParseError::Syntax(format!(
            "expected a {what} mapping at the document root, found {other}"
        ))),
    }
}

struct JsonFile;

impl SnapshotParser for JsonFile {
    fn parse_file(&self, path: &Path, _args: &Payload) -> Result<Parsed, ParseError> {
        let text = fs::read_to_string(path)?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| ParseError::Syntax(e.to_string()))?;
        Ok(Parsed {
            extras: Payload::new(),
            data: require_object(value, "JSON")?,
        })
    }
}

struct TomlFile;

impl SnapshotParser for TomlFile {
    fn parse_file(&self, path: &Path, _args: &Payload) -> Result<Parsed, ParseError> {
        let text = fs::read_to_string(path)?;
        let value: Value = toml::from_str(&text).map_err(|e| ParseError::Syntax(e.to_string()))?;
        Ok(Parsed {
            extras: Payload::new(),
            data: require_object(value, "TOML")?,
        })
    }
}

struct YamlFile;

impl SnapshotParser for YamlFile {
    fn parse_file(&self, path: &Path, _args: &Payload) -> Result<Parsed, ParseError> {
        let text = fs::read_to_string(path)?;
        let value: Value =
            serde_yaml::from_str(&text).map_err(|e| ParseError::Syntax(e.to_string()))?;
        Ok(Parsed {
            extras: Payload::new(),
            data: require_object(value, "YAML")?,
        })
    }
}

struct CsvFile;

impl SnapshotParser for CsvFile {
    fn parse_file(&self, path: &Path, _args: &Payload) -> Result<Parsed, ParseError> {
        let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(str::to_owned)
            .collect();
        let mut columns: Vec<Vec<Value>> = vec![Vec::new(); headers.len()];
        let mut rows = 0usize;
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            for (index, field) in record.iter().enumerate() {
                if index < columns.len() {
                    columns[index].push(coerce_scalar(field));
                }
            }
            rows += 1;
        }
        let mut data = Payload::new();
        for (header, column) in headers.into_iter().zip(columns) {
            data.insert(header, Value::Array(column));
        }
        let mut extras = Payload::new();
        extras.insert("rows".into(), Value::from(rows));
        Ok(Parsed { extras, data })
    }
}

fn csv_error(err: csv::Error) -> ParseError {
    ParseError::Syntax(err.to_string())
}

/// Interpret a CSV field as a number or boolean when it reads as one.
fn coerce_scalar(field: &str) -> Value {
    if let Ok(int) = field.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = field.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    match field {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(field.to_owned()),
    }
}

/// The default delta parser: one payload per line, the line stored under
/// `message`.  Tracked-value patterns are applied to that string by the
/// extractor.
pub struct PlainLines;

impl DeltaParser for PlainLines {
    fn parse_delta(&self, text: &str, _args: &Payload) -> Result<DeltaParsed, ParseError> {
        let payloads = text
            .lines()
            .map(|line| {
                let mut data = Payload::new();
                data.insert("message".into(), Value::String(line.to_owned()));
                data
            })
            .collect();
        Ok(DeltaParsed {
            extras: Payload::new(),
            payloads,
        })
    }
}
