//! Structured metadata about a source image.
//!
//! An [`Info`] is produced once per identifier, either by a processor or from
//! a cache, and is never mutated afterward. It is serialized as JSON by the
//! persistent caches.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Format, Identifier};
use crate::error::{CacheError, ValidationError};

/// Version of the serialized [`Info`] layout.
///
/// Records written with an older version are ignored by the cache
/// short-circuit because they may lack a source format.
pub const INFO_SERIALIZATION_VERSION: u32 = 2;

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimension {
    pub width: u32,
    pub height: u32,
}

impl Dimension {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Scale both sides by `factor`, rounding and keeping at least one pixel.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            width: ((self.width as f64 * factor).round() as u32).max(1),
            height: ((self.height as f64 * factor).round() as u32).max(1),
        }
    }

    /// Dimensions with width and height exchanged.
    pub const fn transposed(&self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Orientation recorded in the source's embedded metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Rotate0,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Orientation {
    /// Clockwise rotation needed to display the image upright.
    pub const fn degrees(&self) -> u32 {
        match self {
            Orientation::Rotate0 => 0,
            Orientation::Rotate90 => 90,
            Orientation::Rotate180 => 180,
            Orientation::Rotate270 => 270,
        }
    }

    /// Map an EXIF orientation tag value. Mirrored variants map to their
    /// rotation component.
    pub const fn from_exif(value: u16) -> Self {
        match value {
            3 | 4 => Orientation::Rotate180,
            5 | 6 => Orientation::Rotate90,
            7 | 8 => Orientation::Rotate270,
            _ => Orientation::Rotate0,
        }
    }
}

/// Metadata embedded in the source image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exif: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iptc: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xmp: Option<String>,

    #[serde(default)]
    pub orientation: Orientation,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.exif.is_none() && self.iptc.is_none() && self.xmp.is_none()
    }
}

/// One page (or sub-image) of a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl ImageInfo {
    /// An untiled image, reported with a single tile covering it.
    pub const fn untiled(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tile_width: width,
            tile_height: height,
        }
    }

    pub const fn size(&self) -> Dimension {
        Dimension::new(self.width, self.height)
    }

    pub const fn tile_size(&self) -> Dimension {
        Dimension::new(self.tile_width, self.tile_height)
    }
}

/// Metadata record for one source image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    #[serde(default)]
    pub identifier: Option<Identifier>,

    #[serde(default)]
    pub media_type: Option<String>,

    /// Format the image was actually read as. Absent in records written by
    /// older serialization versions.
    #[serde(default)]
    pub source_format: Option<Format>,

    pub images: Vec<ImageInfo>,

    #[serde(default = "default_num_resolutions")]
    pub num_resolutions: u32,

    #[serde(default)]
    pub metadata: Metadata,

    #[serde(default)]
    pub serialization_version: u32,
}

fn default_num_resolutions() -> u32 {
    1
}

impl Info {
    /// Create a record for an image read as `source_format`.
    pub fn new(source_format: Format, images: Vec<ImageInfo>) -> Self {
        Self {
            identifier: None,
            media_type: Some(source_format.preferred_media_type().to_string()),
            source_format: Some(source_format),
            images,
            num_resolutions: 1,
            metadata: Metadata::default(),
            serialization_version: INFO_SERIALIZATION_VERSION,
        }
    }

    pub fn with_identifier(mut self, identifier: Identifier) -> Self {
        self.identifier = Some(identifier);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_num_resolutions(mut self, num_resolutions: u32) -> Self {
        self.num_resolutions = num_resolutions;
        self
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.images.len()
    }

    /// Size of the given page.
    pub fn size(&self, page: usize) -> Result<Dimension, ValidationError> {
        self.images
            .get(page)
            .map(ImageInfo::size)
            .ok_or(ValidationError::PageOutOfRange {
                page,
                count: self.images.len(),
            })
    }

    /// Source format, or `Unknown` when absent.
    pub fn source_format(&self) -> Format {
        self.source_format.unwrap_or(Format::Unknown)
    }

    /// Whether this record names a known source format and is recent enough
    /// to be trusted without touching the source.
    pub fn is_complete(&self) -> bool {
        !self.source_format().is_unknown()
            && self.serialization_version >= INFO_SERIALIZATION_VERSION
    }

    pub fn to_json(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        Ok(serde_json::from_str(json)?)
    }
}
