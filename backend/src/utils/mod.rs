pub mod error;

pub use error::{ApiError, ApiResult, StageError};
