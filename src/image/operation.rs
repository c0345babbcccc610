//! Individual transform operations.
//!
//! Every operation can compute the size it produces from an input size,
//! tell whether it changes anything for that size, validate itself against
//! it, and render a canonical string used in cache fingerprints.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Dimension, Format, Metadata};
use crate::error::ValidationError;

/// Rectangle in source pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn size(&self) -> Dimension {
        Dimension::new(self.width, self.height)
    }
}

/// Rational reduction applied to the whole source through its
/// meta-identifier (e.g. `cat.jpg;1:2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaleConstraint {
    numerator: u32,
    denominator: u32,
}

impl ScaleConstraint {
    pub fn new(numerator: u32, denominator: u32) -> Result<Self, ValidationError> {
        if numerator == 0 || denominator == 0 || numerator > denominator {
            return Err(ValidationError::InvalidScale(format!(
                "scale constraint {}:{} must be a fraction in (0, 1]",
                numerator, denominator
            )));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub const fn numerator(&self) -> u32 {
        self.numerator
    }

    pub const fn denominator(&self) -> u32 {
        self.denominator
    }

    pub fn rational(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    pub const fn has_effect(&self) -> bool {
        self.numerator != self.denominator
    }

    /// Size of the virtual image seen through this constraint.
    pub fn constrained_size(&self, full_size: Dimension) -> Dimension {
        if self.has_effect() {
            full_size.scaled(self.rational())
        } else {
            full_size
        }
    }
}

impl Default for ScaleConstraint {
    fn default() -> Self {
        Self {
            numerator: 1,
            denominator: 1,
        }
    }
}

impl fmt::Display for ScaleConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.numerator, self.denominator)
    }
}

/// Region selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Crop {
    Full,
    /// Largest centered square
    Square,
    Pixels {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    /// Fractions of the full size, each in `[0, 1]`
    Percent {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
}

impl Crop {
    /// The region this crop selects, clipped to `full_size`.
    pub fn region(&self, full_size: Dimension) -> Rect {
        let Dimension { width, height } = full_size;
        match *self {
            Crop::Full => Rect {
                x: 0,
                y: 0,
                width,
                height,
            },
            Crop::Square => {
                let side = width.min(height);
                Rect {
                    x: (width - side) / 2,
                    y: (height - side) / 2,
                    width: side,
                    height: side,
                }
            }
            Crop::Pixels {
                x,
                y,
                width: w,
                height: h,
            } => clip(x, y, w, h, full_size),
            Crop::Percent {
                x,
                y,
                width: w,
                height: h,
            } => clip(
                (x * width as f64).round() as u32,
                (y * height as f64).round() as u32,
                (w * width as f64).round() as u32,
                (h * height as f64).round() as u32,
                full_size,
            ),
        }
    }

    pub fn has_effect(&self, full_size: Dimension) -> bool {
        match self {
            Crop::Full => false,
            _ => self.region(full_size).size() != full_size,
        }
    }

    pub fn resulting_size(&self, full_size: Dimension) -> Dimension {
        self.region(full_size).size()
    }

    pub fn validate(&self, full_size: Dimension) -> Result<(), ValidationError> {
        let origin = match *self {
            Crop::Pixels {
                x,
                y,
                width,
                height,
            } => {
                if width == 0 || height == 0 {
                    return Err(ValidationError::EmptyRegion);
                }
                (x, y)
            }
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => {
                if width <= 0.0 || height <= 0.0 || x < 0.0 || y < 0.0 {
                    return Err(ValidationError::EmptyRegion);
                }
                (
                    (x * full_size.width as f64).round() as u32,
                    (y * full_size.height as f64).round() as u32,
                )
            }
            Crop::Full | Crop::Square => (0, 0),
        };
        if origin.0 >= full_size.width || origin.1 >= full_size.height {
            return Err(ValidationError::CropOutOfBounds {
                x: origin.0,
                y: origin.1,
                width: full_size.width,
                height: full_size.height,
            });
        }
        if self.region(full_size).size().is_empty() {
            return Err(ValidationError::EmptyRegion);
        }
        Ok(())
    }
}

fn clip(x: u32, y: u32, width: u32, height: u32, full_size: Dimension) -> Rect {
    let x = x.min(full_size.width);
    let y = y.min(full_size.height);
    Rect {
        x,
        y,
        width: width.min(full_size.width - x),
        height: height.min(full_size.height - y),
    }
}

impl fmt::Display for Crop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crop::Full => f.write_str("crop:full"),
            Crop::Square => f.write_str("crop:square"),
            Crop::Pixels {
                x,
                y,
                width,
                height,
            } => write!(f, "crop:{},{},{},{}", x, y, width, height),
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => write!(f, "crop:pct:{},{},{},{}", x, y, width, height),
        }
    }
}

/// Output size selection, applied after cropping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scale {
    /// Largest size allowed by the scale constraint
    Max,
    /// Fraction of the constrained size
    Percent(f64),
    /// Width in pixels, height follows the aspect ratio
    Width(u32),
    /// Height in pixels, width follows the aspect ratio
    Height(u32),
    /// Largest size fitting inside the box, aspect ratio preserved
    AspectFit { width: u32, height: u32 },
    /// Exactly this size, aspect ratio ignored
    NonAspectFill { width: u32, height: u32 },
}

impl Scale {
    pub fn resulting_size(&self, size: Dimension, constraint: ScaleConstraint) -> Dimension {
        if size.is_empty() {
            return size;
        }
        let ratio = |target: u32, side: u32| target as f64 / side as f64;
        match *self {
            Scale::Max => constraint.constrained_size(size),
            Scale::Percent(pct) => size.scaled(pct * constraint.rational()),
            Scale::Width(width) => Dimension::new(
                width,
                ((size.height as f64 * ratio(width, size.width)).round() as u32).max(1),
            ),
            Scale::Height(height) => Dimension::new(
                ((size.width as f64 * ratio(height, size.height)).round() as u32).max(1),
                height,
            ),
            Scale::AspectFit { width, height } => {
                let factor = ratio(width, size.width).min(ratio(height, size.height));
                size.scaled(factor)
            }
            Scale::NonAspectFill { width, height } => Dimension::new(width, height),
        }
    }

    pub fn has_effect(&self, size: Dimension, constraint: ScaleConstraint) -> bool {
        self.resulting_size(size, constraint) != size
    }

    pub fn validate(&self, size: Dimension, constraint: ScaleConstraint) -> Result<(), ValidationError> {
        match *self {
            Scale::Percent(pct) if pct <= 0.0 || !pct.is_finite() => {
                return Err(ValidationError::InvalidScale(format!("{} percent", pct * 100.0)));
            }
            Scale::Width(0) | Scale::Height(0) => {
                return Err(ValidationError::InvalidScale("zero length side".to_string()));
            }
            Scale::AspectFit { width, height } | Scale::NonAspectFill { width, height }
                if width == 0 || height == 0 =>
            {
                return Err(ValidationError::InvalidScale("zero length side".to_string()));
            }
            _ => {}
        }
        if self.resulting_size(size, constraint).is_empty() {
            return Err(ValidationError::InvalidScale(format!(
                "{} scales {} to nothing",
                self, size
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scale::Max => f.write_str("scale:max"),
            Scale::Percent(pct) => write!(f, "scale:pct:{}", pct),
            Scale::Width(w) => write!(f, "scale:{},", w),
            Scale::Height(h) => write!(f, "scale:,{}", h),
            Scale::AspectFit { width, height } => write!(f, "scale:!{},{}", width, height),
            Scale::NonAspectFill { width, height } => write!(f, "scale:{},{}", width, height),
        }
    }
}

/// Clockwise rotation, optionally preceded by a horizontal mirror.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotate {
    degrees: f64,
    mirror: bool,
}

impl Rotate {
    pub fn new(degrees: f64) -> Self {
        Self {
            degrees: normalize_degrees(degrees),
            mirror: false,
        }
    }

    pub fn mirrored(degrees: f64) -> Self {
        Self {
            degrees: normalize_degrees(degrees),
            mirror: true,
        }
    }

    pub const fn degrees(&self) -> f64 {
        self.degrees
    }

    pub const fn is_mirrored(&self) -> bool {
        self.mirror
    }

    pub fn add_degrees(&mut self, degrees: f64) {
        self.degrees = normalize_degrees(self.degrees + degrees);
    }

    pub fn is_right_angle(&self) -> bool {
        self.degrees % 90.0 == 0.0
    }

    pub fn has_effect(&self) -> bool {
        self.mirror || self.degrees != 0.0
    }

    /// Bounding box of the rotated input.
    pub fn resulting_size(&self, size: Dimension) -> Dimension {
        if self.degrees == 90.0 || self.degrees == 270.0 {
            return size.transposed();
        }
        if self.is_right_angle() {
            return size;
        }
        let radians = self.degrees.to_radians();
        let (sin, cos) = (radians.sin().abs(), radians.cos().abs());
        let w = size.width as f64;
        let h = size.height as f64;
        Dimension::new(
            (w * cos + h * sin).round() as u32,
            (h * cos + w * sin).round() as u32,
        )
    }
}

fn normalize_degrees(degrees: f64) -> f64 {
    let d = degrees % 360.0;
    if d < 0.0 {
        d + 360.0
    } else {
        d
    }
}

impl fmt::Display for Rotate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mirror {
            write!(f, "rotate:!{}", self.degrees)
        } else {
            write!(f, "rotate:{}", self.degrees)
        }
    }
}

/// Opaque RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Color = Color {
        r: 255,
        g: 255,
        b: 255,
    };

    /// Parse `#rrggbb` or `rrggbb`.
    pub fn parse(value: &str) -> Option<Self> {
        let hex = value.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        Some(Self {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
        })
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Output encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Encode {
    pub format: Format,
    pub quality: Option<u8>,
    /// Fill for transparent pixels when the output format has no alpha
    pub background: Option<Color>,
    /// XMP packet to embed in the output
    pub xmp: Option<String>,
    /// Source metadata to carry into the output
    pub metadata: Option<Metadata>,
}

impl Encode {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            quality: None,
            background: None,
            xmp: None,
            metadata: None,
        }
    }

    /// Whether the output carries anything the verbatim source would not.
    pub fn embeds_metadata(&self) -> bool {
        self.xmp.is_some()
    }
}

impl fmt::Display for Encode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "encode:{}", self.format.preferred_extension())?;
        if let Some(q) = self.quality {
            write!(f, ":q{}", q)?;
        }
        if let Some(bg) = self.background {
            write!(f, ":bg{}", bg)?;
        }
        if let Some(ref xmp) = self.xmp {
            write!(f, ":xmp{}", xmp.len())?;
        }
        if self.metadata.is_some() {
            f.write_str(":meta")?;
        }
        Ok(())
    }
}

/// One step of an operation list.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Crop(Crop),
    Scale(Scale),
    Rotate(Rotate),
    Encode(Encode),
    /// Copy the source's embedded metadata into the output
    MetadataCopy,
}

impl Operation {
    pub const fn name(&self) -> &'static str {
        match self {
            Operation::Crop(_) => "crop",
            Operation::Scale(_) => "scale",
            Operation::Rotate(_) => "rotate",
            Operation::Encode(_) => "encode",
            Operation::MetadataCopy => "copymetadata",
        }
    }

    /// Whether this operation changes an input of `size`.
    ///
    /// `Encode` reports only metadata embedding here; a format change is
    /// decided by the operation list against the source format.
    pub fn has_effect(&self, size: Dimension, constraint: ScaleConstraint) -> bool {
        match self {
            Operation::Crop(crop) => crop.has_effect(size),
            Operation::Scale(scale) => scale.has_effect(size, constraint),
            Operation::Rotate(rotate) => rotate.has_effect(),
            Operation::Encode(encode) => encode.embeds_metadata(),
            Operation::MetadataCopy => false,
        }
    }

    pub fn resulting_size(&self, size: Dimension, constraint: ScaleConstraint) -> Dimension {
        match self {
            Operation::Crop(crop) => crop.resulting_size(size),
            Operation::Scale(scale) => scale.resulting_size(size, constraint),
            Operation::Rotate(rotate) => rotate.resulting_size(size),
            Operation::Encode(_) | Operation::MetadataCopy => size,
        }
    }

    pub fn validate(&self, size: Dimension, constraint: ScaleConstraint) -> Result<(), ValidationError> {
        match self {
            Operation::Crop(crop) => crop.validate(size),
            Operation::Scale(scale) => scale.validate(size, constraint),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Crop(op) => op.fmt(f),
            Operation::Scale(op) => op.fmt(f),
            Operation::Rotate(op) => op.fmt(f),
            Operation::Encode(op) => op.fmt(f),
            Operation::MetadataCopy => f.write_str("copymetadata"),
        }
    }
}
