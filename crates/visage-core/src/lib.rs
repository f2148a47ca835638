pub mod encrypted;
pub mod errors;
pub mod faces;
pub mod vector;

pub use errors::{AppError, AppResult, ErrorKind, ExtractionError, NotFoundKind};
