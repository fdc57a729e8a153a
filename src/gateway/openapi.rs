//! OpenAPI / Swagger UI Documentation
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::branch_transfer::api::{
    ActiveSubscriptionDto, ApprovalResponseDto, ApproveRequestBody, AutoCancelDto,
    ConflictSnapshotDto, DocumentUrlDto, FutureSlotDto, PendingOrderDto, RejectRequestBody,
    TransferRequestDto,
};
use crate::gateway::handlers::HealthResponse;

/// Bearer JWT issued by the platform's auth service
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_jwt",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some("HS256 token with claims sub (user id), role, exp, iat"))
                        .build(),
                ),
            );
        }
    }
}

/// Main API Documentation struct
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Branch Transfer API",
        version = "1.0.0",
        description = "Two-phase branch transfer requests: the current branch clears the student's data, the target branch enrolls them.",
        license(
            name = "MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::gateway::handlers::health_check,
        crate::gateway::handlers::create_request,
        crate::gateway::handlers::list_requests,
        crate::gateway::handlers::get_request,
        crate::gateway::handlers::cancel_request,
        crate::gateway::handlers::get_conflicts,
        crate::gateway::handlers::approve_request,
        crate::gateway::handlers::reject_request,
        crate::gateway::handlers::get_document_image,
    ),
    components(
        schemas(
            HealthResponse,
            TransferRequestDto,
            ConflictSnapshotDto,
            ActiveSubscriptionDto,
            FutureSlotDto,
            PendingOrderDto,
            ApproveRequestBody,
            RejectRequestBody,
            ApprovalResponseDto,
            AutoCancelDto,
            DocumentUrlDto,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Branch Transfer", description = "Transfer requests, approvals and conflicts (auth required)"),
        (name = "System", description = "Health checks and system info")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use utoipa::OpenApi;

    #[test]
    fn test_openapi_spec_generates() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "Branch Transfer API");
        assert_eq!(spec.info.version, "1.0.0");
    }

    #[test]
    fn test_openapi_json_serializable() {
        let json = ApiDoc::openapi().to_json();
        assert!(json.is_ok());
        assert!(json.unwrap().contains("Branch Transfer API"));
    }

    #[test]
    fn test_transfer_endpoints_registered() {
        let paths = ApiDoc::openapi().paths;
        assert!(paths.paths.contains_key("/api/v1/health"));
        assert!(paths.paths.contains_key("/api/v1/branch-transfer/request"));
        assert!(paths.paths.contains_key("/api/v1/branch-transfer/requests/{request_id}"));
        assert!(
            paths
                .paths
                .contains_key("/api/v1/branch-transfer/requests/{request_id}/approve")
        );
        assert!(
            paths
                .paths
                .contains_key("/api/v1/branch-transfer/documents/{document_id}/image")
        );
    }

    #[test]
    fn test_security_scheme_registered() {
        let spec = ApiDoc::openapi();
        let components = spec.components.expect("should have components");
        assert!(components.security_schemes.contains_key("bearer_jwt"));
    }
}
