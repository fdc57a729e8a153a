//! Gateway HTTP handlers
//!
//! - [`health`]: liveness
//! - [`transfer`]: branch transfer requests

pub mod health;
pub mod transfer;

pub use health::{HealthResponse, health_check};
pub use transfer::{
    approve_request, cancel_request, create_request, get_conflicts, get_document_image,
    get_request, list_requests, reject_request,
};

// utoipa's generated path types, needed by `openapi::ApiDoc`
pub use health::__path_health_check;
pub use transfer::{
    __path_approve_request, __path_cancel_request, __path_create_request, __path_get_conflicts,
    __path_get_document_image, __path_get_request, __path_list_requests, __path_reject_request,
};
