//! Gateway types module
//!
//! - [`ApiResponse<T>`]: Unified API response wrapper
//! - [`ApiError`] / [`ApiResult`]: Handler error plumbing
//!
//! Request and response DTOs for the transfer workflow live in
//! [`crate::branch_transfer::api`].

pub mod response;

pub use response::{ApiError, ApiResponse, ApiResult, error_codes, ok};
