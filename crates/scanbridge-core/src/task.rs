//! Task tree and builder
//!
//! A task is parsed once into an immutable tree:
//! Action → Stream → Source → PixelFormat → Attribute → Value.
//! Every node carries its resolved exception policy, its vendor owner and the
//! JSON path it was read from, so the negotiation walker never has to look
//! back up the tree.

use serde_json::{Map, Value as JsonValue};
use std::fmt;
use tracing::debug;

use crate::error::TaskError;
use crate::vendor::{Owner, VendorIdentity};

/// Attribute name used when a task omits one; no device accepts it
pub const UNSPECIFIED_ATTRIBUTE: &str = "unspecifiedAttribute";

/// Failure policy of a task node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exception {
    /// Keep the current device value and continue
    Ignore,
    /// Abort the whole task
    Fail,
    /// Abandon the current stream and try the next one
    NextStream,
    /// Anything else; consulted as `Ignore`
    Unrecognized(String),
}

impl Exception {
    pub fn parse(s: &str) -> Self {
        match s {
            "ignore" => Exception::Ignore,
            "fail" => Exception::Fail,
            "nextStream" => Exception::NextStream,
            other => Exception::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Exception::Ignore => "ignore",
            Exception::Fail => "fail",
            Exception::NextStream => "nextStream",
            Exception::Unrecognized(s) => s,
        }
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Exception::Fail)
    }

    pub fn is_next_stream(&self) -> bool {
        matches!(self, Exception::NextStream)
    }
}

impl Default for Exception {
    fn default() -> Self {
        Exception::Ignore
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every task node
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Failure policy after inheritance
    pub exception: Exception,
    /// Raw vendor tag after inheritance
    pub vendor: Option<String>,
    pub owner: Owner,
    /// JSON path of this node inside the task
    pub json_key: String,
}

impl Node {
    pub fn is_foreign(&self) -> bool {
        self.owner.is_foreign()
    }

    /// JSON path of one of this node's keys
    pub fn key(&self, name: &str) -> String {
        join_key(&self.json_key, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Configure,
    Scan,
    Other(String),
}

impl ActionKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "configure" => ActionKind::Configure,
            "scan" => ActionKind::Scan,
            other => ActionKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::Configure => "configure",
            ActionKind::Scan => "scan",
            ActionKind::Other(s) => s,
        }
    }
}

/// A parsed task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Task {
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub node: Node,
    pub streams: Vec<Stream>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    pub name: String,
    pub node: Node,
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub name: String,
    /// Requested surface: `any`, `feeder`, `feederFront`, `flatbed` or a vendor value
    pub source: String,
    pub node: Node,
    pub pixel_formats: Vec<PixelFormat>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PixelFormat {
    pub name: String,
    /// Requested color mode: `bw1`, `gray8`, `rgb24` or a vendor value
    pub pixel_format: String,
    pub node: Node,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub attribute: String,
    pub node: Node,
    pub values: Vec<Value>,
}

/// One candidate value of an attribute
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    /// The value exactly as the task wrote it
    pub value: JsonValue,
    pub node: Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Task,
    Action,
    Stream,
    Source,
    PixelFormat,
    Attribute,
    Value,
}

const LEVELS: [Level; 7] = [
    Level::Task,
    Level::Action,
    Level::Stream,
    Level::Source,
    Level::PixelFormat,
    Level::Attribute,
    Level::Value,
];

impl Level {
    fn keys(self) -> &'static [&'static str] {
        match self {
            Level::Task => &["actions"],
            Level::Action => &["action", "exception", "vendor", "streams"],
            Level::Stream => &["name", "exception", "vendor", "sources"],
            Level::Source => &["name", "source", "exception", "vendor", "pixelFormats"],
            Level::PixelFormat => &["name", "pixelFormat", "exception", "vendor", "attributes"],
            Level::Attribute => &["attribute", "exception", "vendor", "values"],
            Level::Value => &["value", "exception", "vendor"],
        }
    }
}

/// Reject keys that belong to another level. Keys no level knows are left
/// alone so newer tasks still parse.
fn check_topology(level: Level, object: &Map<String, JsonValue>, path: &str) -> Result<(), TaskError> {
    for key in object.keys() {
        if level.keys().contains(&key.as_str()) {
            continue;
        }
        if LEVELS.iter().any(|other| other.keys().contains(&key.as_str())) {
            return Err(TaskError::Invalid {
                json_key: join_key(path, key),
                reason: format!("'{}' is not allowed at this level", key),
            });
        }
    }
    Ok(())
}

fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

/// Builds [`Task`] trees from task JSON
#[derive(Debug, Clone, Default)]
pub struct TaskBuilder {
    identity: VendorIdentity,
}

/// What a child inherits from its parent
struct Inherited {
    exception: Exception,
    vendor: Option<String>,
}

impl TaskBuilder {
    pub fn new(identity: VendorIdentity) -> Self {
        Self { identity }
    }

    /// Parse task text
    pub fn parse(&self, text: &str) -> Result<Task, TaskError> {
        let root: JsonValue =
            serde_json::from_str(text).map_err(|e| TaskError::InvalidJson(e.to_string()))?;
        self.build(&root)
    }

    /// Build a task from an already-parsed JSON document
    pub fn build(&self, root: &JsonValue) -> Result<Task, TaskError> {
        let object = root.as_object().ok_or_else(|| TaskError::Invalid {
            json_key: String::new(),
            reason: "task must be a JSON object".to_string(),
        })?;
        check_topology(Level::Task, object, "")?;

        let mut actions = Vec::new();
        for (i, item) in children(object, "actions", "")?.iter().enumerate() {
            let path = format!("actions[{}]", i);
            actions.push(self.build_action(item, path)?);
        }

        debug!(actions = actions.len(), "Built task tree");
        Ok(Task { actions })
    }

    fn node(
        &self,
        level: Level,
        object: &Map<String, JsonValue>,
        path: String,
        inherited: Inherited,
    ) -> Result<Node, TaskError> {
        let vendor = match object.get("vendor") {
            Some(JsonValue::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => inherited.vendor,
        };
        let owner = self.identity.owner_of(vendor.as_deref());

        // Foreign nodes may use whatever layout their vendor likes
        if !owner.is_foreign() {
            check_topology(level, object, &path)?;
        }

        let exception = match object.get("exception") {
            Some(JsonValue::String(s)) => Exception::parse(s),
            Some(other) => Exception::Unrecognized(other.to_string()),
            None => inherited.exception,
        };

        Ok(Node {
            exception,
            vendor,
            owner,
            json_key: path,
        })
    }

    fn build_action(&self, item: &JsonValue, path: String) -> Result<Action, TaskError> {
        let object = as_object(item, &path)?;
        let node = self.node(
            Level::Action,
            object,
            path,
            Inherited {
                exception: Exception::Ignore,
                vendor: None,
            },
        )?;
        let kind = ActionKind::parse(string_or(object, "action", "configure"));

        let mut streams = Vec::new();
        if !node.is_foreign() {
            let items = children(object, "streams", &node.json_key)?;
            let count = items.len();
            for (i, item) in items.iter().enumerate() {
                // An action that ignores failures lets every stream but the
                // last fall through to the next one
                let exception = match &node.exception {
                    Exception::Ignore if i + 1 < count => Exception::NextStream,
                    other => other.clone(),
                };
                let path = format!("{}.streams[{}]", node.json_key, i);
                streams.push(self.build_stream(
                    item,
                    path,
                    i,
                    Inherited {
                        exception,
                        vendor: node.vendor.clone(),
                    },
                )?);
            }
        }

        Ok(Action {
            kind,
            node,
            streams,
        })
    }

    fn build_stream(
        &self,
        item: &JsonValue,
        path: String,
        index: usize,
        inherited: Inherited,
    ) -> Result<Stream, TaskError> {
        let object = as_object(item, &path)?;
        let node = self.node(Level::Stream, object, path, inherited)?;
        let name = name_or(object, || format!("stream{}", index));

        let mut sources = Vec::new();
        if !node.is_foreign() {
            for (i, item) in children(object, "sources", &node.json_key)?.iter().enumerate() {
                let path = format!("{}.sources[{}]", node.json_key, i);
                sources.push(self.build_source(item, path, i, inherit(&node))?);
            }
        }

        Ok(Stream {
            name,
            node,
            sources,
        })
    }

    fn build_source(
        &self,
        item: &JsonValue,
        path: String,
        index: usize,
        inherited: Inherited,
    ) -> Result<Source, TaskError> {
        let object = as_object(item, &path)?;
        let node = self.node(Level::Source, object, path, inherited)?;
        let name = name_or(object, || format!("source{}", index));
        let source = string_or(object, "source", "any").to_string();

        let mut pixel_formats = Vec::new();
        if !node.is_foreign() {
            for (i, item) in children(object, "pixelFormats", &node.json_key)?
                .iter()
                .enumerate()
            {
                let path = format!("{}.pixelFormats[{}]", node.json_key, i);
                pixel_formats.push(self.build_pixel_format(item, path, i, inherit(&node))?);
            }
        }

        Ok(Source {
            name,
            source,
            node,
            pixel_formats,
        })
    }

    fn build_pixel_format(
        &self,
        item: &JsonValue,
        path: String,
        index: usize,
        inherited: Inherited,
    ) -> Result<PixelFormat, TaskError> {
        let object = as_object(item, &path)?;
        let node = self.node(Level::PixelFormat, object, path, inherited)?;
        let name = name_or(object, || format!("pixelFormat{}", index));
        let pixel_format = string_or(object, "pixelFormat", "rgb24").to_string();

        let mut attributes = Vec::new();
        if !node.is_foreign() {
            for (i, item) in children(object, "attributes", &node.json_key)?
                .iter()
                .enumerate()
            {
                let path = format!("{}.attributes[{}]", node.json_key, i);
                attributes.push(self.build_attribute(item, path, inherit(&node))?);
            }
        }

        Ok(PixelFormat {
            name,
            pixel_format,
            node,
            attributes,
        })
    }

    fn build_attribute(
        &self,
        item: &JsonValue,
        path: String,
        inherited: Inherited,
    ) -> Result<Attribute, TaskError> {
        let object = as_object(item, &path)?;
        let node = self.node(Level::Attribute, object, path, inherited)?;
        let attribute = string_or(object, "attribute", UNSPECIFIED_ATTRIBUTE).to_string();

        let mut values = Vec::new();
        if !node.is_foreign() {
            for (i, item) in children(object, "values", &node.json_key)?.iter().enumerate() {
                let path = format!("{}.values[{}]", node.json_key, i);
                let object = as_object(item, &path)?;
                let value_node = self.node(Level::Value, object, path, inherit(&node))?;
                values.push(Value {
                    value: object.get("value").cloned().unwrap_or(JsonValue::Null),
                    node: value_node,
                });
            }
        }

        Ok(Attribute {
            attribute,
            node,
            values,
        })
    }
}

fn inherit(node: &Node) -> Inherited {
    Inherited {
        exception: node.exception.clone(),
        vendor: node.vendor.clone(),
    }
}

fn as_object<'a>(item: &'a JsonValue, path: &str) -> Result<&'a Map<String, JsonValue>, TaskError> {
    item.as_object().ok_or_else(|| TaskError::Invalid {
        json_key: path.to_string(),
        reason: "expected an object".to_string(),
    })
}

fn children<'a>(
    object: &'a Map<String, JsonValue>,
    key: &str,
    path: &str,
) -> Result<&'a [JsonValue], TaskError> {
    match object.get(key) {
        None => Ok(&[]),
        Some(JsonValue::Array(items)) => Ok(items),
        Some(_) => Err(TaskError::Invalid {
            json_key: join_key(path, key),
            reason: format!("'{}' must be an array", key),
        }),
    }
}

fn string_or<'a>(object: &'a Map<String, JsonValue>, key: &str, default: &'a str) -> &'a str {
    object.get(key).and_then(JsonValue::as_str).unwrap_or(default)
}

fn name_or(object: &Map<String, JsonValue>, default: impl FnOnce() -> String) -> String {
    object
        .get("name")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(default)
}
