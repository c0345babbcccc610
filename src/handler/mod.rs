//! Request handlers: the protocol-independent core of info and image
//! requests.
//!
//! A front controller builds one handler per request from an identifier or
//! an [`OperationList`](crate::image::OperationList), calls `handle`, writes
//! the response, then calls `close` to release temp files.

mod callback;
mod context;
mod image;
mod information;

pub use callback::{DelegateCallback, ImageCallback, InformationCallback, NoopCallback};
pub use context::RequestContext;
pub use image::{ImageOutcome, ImageRequestHandler, ImageRequestHandlerBuilder};
pub use information::{InformationRequestHandler, InformationRequestHandlerBuilder};
