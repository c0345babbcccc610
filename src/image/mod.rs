//! Image model: identifiers, formats, metadata records and operations.

mod format;
mod identifier;
mod info;
pub mod operation;
mod operation_list;

pub use format::{Format, MAGIC_BYTES_LENGTH};
pub use identifier::Identifier;
pub use info::{Dimension, ImageInfo, Info, Metadata, Orientation, INFO_SERIALIZATION_VERSION};
pub use operation::{Color, Crop, Encode, Operation, Rect, Rotate, Scale, ScaleConstraint};
pub use operation_list::{EncodeDefaults, OperationList};
