//! Task vocabulary to native capability values

use serde_json::Value as JsonValue;

use crate::capability::{CapValue, Capability, INVALID_VALUE};

/// Physical settings behind a task source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapping {
    pub automatic_sense_medium: CapValue,
    pub duplex_enabled: CapValue,
    pub feeder_enabled: CapValue,
}

impl SourceMapping {
    /// Mapping for a source we do not recognize; every value gets rejected
    pub const UNKNOWN: SourceMapping = SourceMapping {
        automatic_sense_medium: INVALID_VALUE,
        duplex_enabled: INVALID_VALUE,
        feeder_enabled: INVALID_VALUE,
    };
}

pub fn source_mapping(source: &str) -> Option<SourceMapping> {
    let (automatic_sense_medium, duplex_enabled, feeder_enabled) = match source {
        "any" => (1, 1, 1),
        "feeder" => (0, 1, 1),
        "feederFront" => (0, 0, 1),
        "flatbed" => (0, 0, 0),
        _ => return None,
    };
    Some(SourceMapping {
        automatic_sense_medium,
        duplex_enabled,
        feeder_enabled,
    })
}

const PIXEL_TYPES: [(&str, CapValue); 3] = [("bw1", 0), ("gray8", 1), ("rgb24", 2)];

const COMPRESSIONS: [(&str, CapValue); 3] = [("none", 0), ("group4", 5), ("jpeg", 6)];

pub fn pixel_type(name: &str) -> Option<CapValue> {
    PIXEL_TYPES.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

pub fn pixel_format_name(value: CapValue) -> Option<&'static str> {
    PIXEL_TYPES.iter().find(|(_, v)| *v == value).map(|(n, _)| *n)
}

pub fn compression(name: &str) -> Option<CapValue> {
    COMPRESSIONS.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

pub fn compression_name(value: CapValue) -> Option<&'static str> {
    COMPRESSIONS.iter().find(|(_, v)| *v == value).map(|(n, _)| *n)
}

/// Attributes the engine knows how to negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Resolution,
    Compression,
    ImageCount,
    AutoCrop,
    AutoDeskew,
    Brightness,
    Contrast,
}

impl AttributeKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "resolution" => Some(AttributeKind::Resolution),
            "compression" => Some(AttributeKind::Compression),
            "imagecount" => Some(AttributeKind::ImageCount),
            "autocrop" => Some(AttributeKind::AutoCrop),
            "autodeskew" => Some(AttributeKind::AutoDeskew),
            "brightness" => Some(AttributeKind::Brightness),
            "contrast" => Some(AttributeKind::Contrast),
            _ => None,
        }
    }

    pub fn capability(self) -> Capability {
        match self {
            AttributeKind::Resolution => Capability::XResolution,
            AttributeKind::Compression => Capability::Compression,
            AttributeKind::ImageCount => Capability::XferCount,
            AttributeKind::AutoCrop => Capability::AutomaticBorderDetection,
            AttributeKind::AutoDeskew => Capability::AutomaticDeskew,
            AttributeKind::Brightness => Capability::Brightness,
            AttributeKind::Contrast => Capability::Contrast,
        }
    }

    /// Position in the canonical order: resolution, compression, image
    /// count, then everything else in task order. Pixel type always precedes
    /// all of them.
    pub fn rank(self) -> u8 {
        match self {
            AttributeKind::Resolution => 0,
            AttributeKind::Compression => 1,
            AttributeKind::ImageCount => 2,
            _ => 3,
        }
    }

    /// Native value for a task value, or [`INVALID_VALUE`] if it has none
    pub fn to_cap_value(self, value: &JsonValue) -> CapValue {
        let mapped = match self {
            AttributeKind::Resolution | AttributeKind::Brightness | AttributeKind::Contrast => {
                number(value)
            }
            AttributeKind::ImageCount => number(value).map(|n| if n == 0 { -1 } else { n }),
            AttributeKind::Compression => value.as_str().and_then(compression),
            AttributeKind::AutoCrop | AttributeKind::AutoDeskew => yes_no(value),
        };
        mapped.unwrap_or(INVALID_VALUE)
    }
}

/// Rank used to order attributes we do not recognize
pub const UNKNOWN_ATTRIBUTE_RANK: u8 = 3;

fn number(value: &JsonValue) -> Option<CapValue> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .and_then(|n| CapValue::try_from(n).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn yes_no(value: &JsonValue) -> Option<CapValue> {
    match value {
        JsonValue::String(s) if s == "yes" => Some(1),
        JsonValue::String(s) if s == "no" => Some(0),
        JsonValue::Bool(b) => Some(CapValue::from(*b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_mapping() {
        let flatbed = source_mapping("flatbed").unwrap();
        assert_eq!(flatbed.feeder_enabled, 0);
        assert_eq!(source_mapping("feederFront").unwrap().duplex_enabled, 0);
        assert_eq!(source_mapping("any").unwrap().automatic_sense_medium, 1);
        assert!(source_mapping("microfilm").is_none());
    }

    #[test]
    fn test_attribute_values() {
        assert_eq!(AttributeKind::Resolution.to_cap_value(&json!(300)), 300);
        assert_eq!(AttributeKind::Resolution.to_cap_value(&json!("150")), 150);
        assert_eq!(AttributeKind::ImageCount.to_cap_value(&json!(0)), -1);
        assert_eq!(AttributeKind::ImageCount.to_cap_value(&json!(4)), 4);
        assert_eq!(AttributeKind::Compression.to_cap_value(&json!("group4")), 5);
        assert_eq!(AttributeKind::Compression.to_cap_value(&json!("lzw")), INVALID_VALUE);
        assert_eq!(AttributeKind::AutoCrop.to_cap_value(&json!("yes")), 1);
        assert_eq!(AttributeKind::AutoDeskew.to_cap_value(&json!("maybe")), INVALID_VALUE);
        assert_eq!(AttributeKind::Brightness.to_cap_value(&json!(-250)), -250);
    }

    #[test]
    fn test_names_round_trip() {
        assert_eq!(pixel_type("gray8"), Some(1));
        assert_eq!(pixel_format_name(2), Some("rgb24"));
        assert_eq!(compression_name(6), Some("jpeg"));
        assert_eq!(pixel_type("cmyk"), None);
    }
}
