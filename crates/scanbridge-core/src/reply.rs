//! Typed task reply
//!
//! The reply mirrors what the device actually accepted. It is built up node by
//! node during negotiation and serialized once.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::TaskError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskReply {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionReply>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReply {
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamReply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ActionResults>,
}

/// Outcome of an action that did not succeed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResults {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_key: Option<String>,
    /// Value the device refused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamReply {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceReply>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReply {
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pixel_formats: Vec<PixelFormatReply>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelFormatReply {
    pub pixel_format: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<AttributeReply>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeReply {
    pub attribute: String,
    pub values: Vec<ValueReply>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueReply {
    pub value: JsonValue,
}

impl TaskReply {
    /// Reply for a task whose negotiation failed
    pub fn failure(action: &str, err: &TaskError) -> Self {
        Self {
            actions: vec![ActionReply {
                action: action.to_string(),
                streams: Vec::new(),
                results: Some(ActionResults {
                    success: false,
                    exception: Some(err.exception().to_string()),
                    json_key: err.json_key().map(str::to_string),
                    value: err.value().map(str::to_string),
                }),
            }],
        }
    }

    pub fn is_success(&self) -> bool {
        self.actions
            .iter()
            .all(|a| a.results.as_ref().map_or(true, |r| r.success))
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

impl ActionReply {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            streams: Vec::new(),
            results: None,
        }
    }
}

impl SourceReply {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            pixel_formats: Vec::new(),
        }
    }
}

impl PixelFormatReply {
    pub fn new(pixel_format: impl Into<String>) -> Self {
        Self {
            pixel_format: pixel_format.into(),
            attributes: Vec::new(),
        }
    }

    /// Record the value the device accepted for an attribute
    pub fn accept(&mut self, attribute: impl Into<String>, value: JsonValue) {
        self.attributes.push(AttributeReply {
            attribute: attribute.into(),
            values: vec![ValueReply { value }],
        });
    }

    pub fn attribute(&self, name: &str) -> Option<&JsonValue> {
        self.attributes
            .iter()
            .find(|a| a.attribute == name)
            .and_then(|a| a.values.first())
            .map(|v| &v.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_reply_serializes_to_empty_object() {
        assert_eq!(TaskReply::default().to_json(), json!({}));
    }

    #[test]
    fn test_configured_reply_shape() {
        let mut format = PixelFormatReply::new("bw1");
        format.accept("resolution", json!(200));
        let mut source = SourceReply::new("flatbed");
        source.pixel_formats.push(format);
        let mut action = ActionReply::new("configure");
        action.streams.push(StreamReply {
            sources: vec![source],
        });
        let reply = TaskReply {
            actions: vec![action],
        };

        assert_eq!(
            reply.to_json(),
            json!({"actions":[{"action":"configure","streams":[{"sources":[{
                "source":"flatbed",
                "pixelFormats":[{"pixelFormat":"bw1","attributes":[
                    {"attribute":"resolution","values":[{"value":200}]}
                ]}]
            }]}]}]})
        );
        assert!(reply.is_success());
    }

    #[test]
    fn test_failure_reply() {
        let err = TaskError::Rejected {
            json_key: "actions[0].streams[0].sources[0].source".to_string(),
            value: None,
        };
        let reply = TaskReply::failure("configure", &err);

        assert!(!reply.is_success());
        assert_eq!(
            reply.to_json()["actions"][0]["results"],
            json!({"success":false,"exception":"fail","jsonKey":"actions[0].streams[0].sources[0].source"})
        );
    }

    #[test]
    fn test_failure_reply_carries_refused_value() {
        let json_key = "actions[0].streams[0].sources[0].pixelFormats[0].attributes[0].values[0]";
        let err = TaskError::Rejected {
            json_key: json_key.to_string(),
            value: Some("42".to_string()),
        };
        let reply = TaskReply::failure("configure", &err);

        assert_eq!(
            reply.to_json()["actions"][0]["results"],
            json!({"success":false,"exception":"fail","jsonKey":json_key,"value":"42"})
        );
    }
}
