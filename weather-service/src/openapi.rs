use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers;
use common::models::{
    CityCount, HealthReport, HistoryRecord, HistoryResponse, MessageResponse, UsageReport,
    WeatherSnapshot,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::home,
        handlers::health,
        handlers::metrics,
        handlers::get_weather,
        handlers::get_history,
        handlers::invalidate_cache,
    ),
    components(schemas(
        WeatherSnapshot,
        HistoryRecord,
        HistoryResponse,
        MessageResponse,
        HealthReport,
        UsageReport,
        CityCount,
    )),
    tags(
        (name = "weather", description = "Current weather, query history and cache control"),
    ),
)]
pub struct ApiDoc;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi())
}
