use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Skimmer API",
        version = "0.1.0",
        description = "Rate-limited content extraction job queue."
    ),
    paths(
        crate::routes::create_job,
        crate::routes::list_jobs,
        crate::routes::get_job,
        crate::routes::cancel_job,
        crate::sse::job_events,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::CreateJobRequest,
        crate::dto::CreateJobResponse,
        crate::dto::JobResponse,
        crate::dto::JobResultResponse,
        crate::dto::ProgressResponse,
        crate::dto::JobListResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
        crate::dto::RateLimitedResponse,
    )),
    tags(
        (name = "jobs", description = "Extraction job management"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI document.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "API key. Accepted keys are set via SKIMMER_API_KEYS.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
