//! Image-block metadata
//!
//! Per-image addressing facts (image, sheet and part numbers) only live here,
//! so a client must always end up with the metadata of every block it keeps.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlockMetadata {
    pub status: MetadataStatus,
    pub address: ImageAddress,
    pub image: ImageInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataStatus {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAddress {
    pub image_number: u64,
    pub image_part: u32,
    pub more_parts: MoreParts,
    pub sheet_number: u64,
    pub source: ImageSource,
    pub stream_name: String,
    pub source_name: String,
    pub pixel_format_name: String,
}

/// Whether an image continues in later blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MoreParts {
    LastPartInFile,
    MorePartsPending,
    LastPartInFileMorePartsPending,
}

/// Physical side an image was captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageSource {
    Flatbed,
    FeederFront,
    FeederRear,
}

impl ImageSource {
    /// Label an image from the negotiated surface. Duplex images alternate
    /// front and rear, starting with the front at image 1.
    pub fn label(flatbed: bool, duplex: bool, image_number: u64) -> Self {
        if flatbed {
            ImageSource::Flatbed
        } else if duplex && image_number % 2 == 0 {
            ImageSource::FeederRear
        } else {
            ImageSource::FeederFront
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub compression: String,
    pub pixel_format: String,
    pub pixel_height: u32,
    pub pixel_width: u32,
    pub pixel_offset_x: u32,
    pub pixel_offset_y: u32,
    pub resolution: u32,
    /// Size of the image payload in bytes
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_source_label() {
        assert_eq!(ImageSource::label(true, true, 2), ImageSource::Flatbed);
        assert_eq!(ImageSource::label(false, false, 2), ImageSource::FeederFront);
        assert_eq!(ImageSource::label(false, true, 1), ImageSource::FeederFront);
        assert_eq!(ImageSource::label(false, true, 2), ImageSource::FeederRear);
    }

    #[test]
    fn test_metadata_field_names() {
        let metadata = ImageBlockMetadata {
            status: MetadataStatus { success: true },
            address: ImageAddress {
                image_number: 3,
                image_part: 1,
                more_parts: MoreParts::LastPartInFile,
                sheet_number: 2,
                source: ImageSource::FeederFront,
                stream_name: "stream0".to_string(),
                source_name: "source0".to_string(),
                pixel_format_name: "pixelFormat0".to_string(),
            },
            image: ImageInfo {
                compression: "none".to_string(),
                pixel_format: "gray8".to_string(),
                pixel_height: 2200,
                pixel_width: 1700,
                pixel_offset_x: 0,
                pixel_offset_y: 0,
                resolution: 200,
                size: 4096,
            },
        };

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["address"]["imageNumber"], 3);
        assert_eq!(json["address"]["moreParts"], "lastPartInFile");
        assert_eq!(json["address"]["source"], "feederFront");
        assert_eq!(json["image"]["pixelFormat"], "gray8");
        assert_eq!(json["image"]["pixelOffsetX"], 0);
    }
}
