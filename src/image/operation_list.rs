//! Ordered list of operations applied to one page of one source image.
//!
//! A list is mutable until [`OperationList::freeze`] is called; after that
//! every mutator returns [`OperationError::Frozen`] and the list's canonical
//! string ([`OperationList::fingerprint`]) can be used as a cache key.

use std::fmt;

use super::operation::{Color, Encode, Operation, Rotate, Scale, ScaleConstraint};
use super::{Dimension, Format, Identifier, Info};
use crate::error::{OperationError, ValidationError};

/// Server-side defaults applied to the `Encode` operation.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeDefaults {
    pub jpeg_quality: u8,
    pub background_color: Option<Color>,
}

impl Default for EncodeDefaults {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            background_color: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationList {
    identifier: Identifier,
    page: usize,
    scale_constraint: ScaleConstraint,
    operations: Vec<Operation>,
    frozen: bool,
}

impl OperationList {
    pub fn new(identifier: Identifier) -> Self {
        Self {
            identifier,
            page: 0,
            scale_constraint: ScaleConstraint::default(),
            operations: Vec::new(),
            frozen: false,
        }
    }

    /// Builder-style variant of [`OperationList::add`] for lists under
    /// construction.
    ///
    /// # Panics
    ///
    /// If the list is frozen. Use [`OperationList::add`] when that is not
    /// known statically.
    pub fn with(mut self, operation: Operation) -> Self {
        assert!(!self.frozen, "cannot extend a frozen operation list");
        self.operations.push(operation);
        self
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn scale_constraint(&self) -> ScaleConstraint {
        self.scale_constraint
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Make the list immutable. Idempotent.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    fn check_mutable(&self) -> Result<(), OperationError> {
        if self.frozen {
            Err(OperationError::Frozen)
        } else {
            Ok(())
        }
    }

    pub fn set_page(&mut self, page: usize) -> Result<(), OperationError> {
        self.check_mutable()?;
        self.page = page;
        Ok(())
    }

    pub fn set_scale_constraint(&mut self, constraint: ScaleConstraint) -> Result<(), OperationError> {
        self.check_mutable()?;
        self.scale_constraint = constraint;
        Ok(())
    }

    pub fn add(&mut self, operation: Operation) -> Result<(), OperationError> {
        self.check_mutable()?;
        self.operations.push(operation);
        Ok(())
    }

    /// Insert before the first operation that is not a crop.
    fn insert_after_crops(&mut self, operation: Operation) {
        let index = self
            .operations
            .iter()
            .position(|op| !matches!(op, Operation::Crop(_)))
            .unwrap_or(self.operations.len());
        self.operations.insert(index, operation);
    }

    /// Insert before the encode operation, or at the end if there is none.
    fn insert_before_encode(&mut self, operation: Operation) {
        let index = self
            .operations
            .iter()
            .position(|op| matches!(op, Operation::Encode(_)))
            .unwrap_or(self.operations.len());
        self.operations.insert(index, operation);
    }

    pub fn encode(&self) -> Option<&Encode> {
        self.operations.iter().find_map(|op| match op {
            Operation::Encode(encode) => Some(encode),
            _ => None,
        })
    }

    fn encode_mut(&mut self) -> Option<&mut Encode> {
        self.operations.iter_mut().find_map(|op| match op {
            Operation::Encode(encode) => Some(encode),
            _ => None,
        })
    }

    /// Requested output format, `Unknown` when no encode operation exists.
    pub fn output_format(&self) -> Format {
        self.encode().map(|e| e.format).unwrap_or(Format::Unknown)
    }

    /// Apply the mutations that depend on the source image rather than on
    /// the request: scale constraint, source orientation, encode defaults
    /// and embedded metadata.
    ///
    /// Must run before [`OperationList::freeze`].
    pub fn apply_non_endpoint_mutations(
        &mut self,
        info: &Info,
        defaults: &EncodeDefaults,
        xmp: Option<String>,
    ) -> Result<(), OperationError> {
        self.check_mutable()?;

        if self.scale_constraint.has_effect()
            && !self.operations.iter().any(|op| matches!(op, Operation::Scale(_)))
        {
            self.insert_after_crops(Operation::Scale(Scale::Max));
        }

        let orientation = info.metadata.orientation.degrees();
        if orientation != 0 {
            let rotate = self.operations.iter_mut().find_map(|op| match op {
                Operation::Rotate(rotate) => Some(rotate),
                _ => None,
            });
            match rotate {
                Some(rotate) => rotate.add_degrees(orientation as f64),
                None => {
                    self.insert_before_encode(Operation::Rotate(Rotate::new(orientation as f64)))
                }
            }
        }

        let copy_metadata = self
            .operations
            .iter()
            .any(|op| matches!(op, Operation::MetadataCopy));
        if let Some(encode) = self.encode_mut() {
            if encode.format == Format::Jpeg && encode.quality.is_none() {
                encode.quality = Some(defaults.jpeg_quality);
            }
            if !encode.format.supports_transparency() && encode.background.is_none() {
                encode.background = defaults.background_color;
            }
            if copy_metadata {
                encode.metadata = Some(info.metadata.clone());
            }
            if xmp.is_some() {
                encode.xmp = xmp;
            }
        }
        Ok(())
    }

    /// Size of the output for a source page of `full_size`.
    pub fn resulting_size(&self, full_size: Dimension) -> Dimension {
        self.operations
            .iter()
            .fold(full_size, |size, op| op.resulting_size(size, self.scale_constraint))
    }

    /// Whether rendering would produce anything other than the source bytes.
    pub fn has_effect(&self, full_size: Dimension, source_format: Format) -> bool {
        if self.page != 0 || self.scale_constraint.has_effect() {
            return true;
        }
        if self.output_format() != source_format {
            return true;
        }
        let mut size = full_size;
        for op in &self.operations {
            if op.has_effect(size, self.scale_constraint) {
                return true;
            }
            size = op.resulting_size(size, self.scale_constraint);
        }
        false
    }

    /// Check every operation against the actual source size.
    pub fn validate(&self, full_size: Dimension) -> Result<(), ValidationError> {
        if self.encode().is_none() {
            return Err(ValidationError::MissingEncode);
        }
        let mut size = full_size;
        for op in &self.operations {
            op.validate(size, self.scale_constraint)?;
            size = op.resulting_size(size, self.scale_constraint);
        }
        if size.is_empty() {
            return Err(ValidationError::EmptyRegion);
        }
        Ok(())
    }

    /// Canonical string identifying this list; the derivative cache key.
    pub fn fingerprint(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for OperationList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.identifier, self.page, self.scale_constraint)?;
        for op in &self.operations {
            write!(f, "_{}", op)?;
        }
        Ok(())
    }
}
