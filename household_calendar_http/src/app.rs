use axum::http::{Method, StatusCode};
use log::debug;
use stack_string::format_sstr;
use std::{convert::TryInto, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use household_calendar_lib::{config::Config, datastore::RestDataStore, email::EmailDispatcher};

use crate::{
    errors::ServiceError as Error,
    routes::{ApiDoc, get_function_path},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub dispatcher: EmailDispatcher,
}

/// # Errors
/// Returns error if `init_config` fails or the server can't bind
pub async fn start_app() -> Result<(), Error> {
    let config = Config::init_config()?;
    run_app(&config).await
}

fn build_router(app: &AppState) -> Result<axum::Router, Error> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            "authorization".try_into()?,
            "x-client-info".try_into()?,
            "apikey".try_into()?,
            "content-type".try_into()?,
        ])
        .allow_origin(Any);

    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .merge(get_function_path(app))
        .split_for_parts();

    let spec_json = serde_json::to_string_pretty(&api)?;
    let spec_yaml = serde_yml::to_string(&api)?;

    Ok(router
        .route(
            "/functions/openapi/json",
            axum::routing::get(|| async move {
                (
                    StatusCode::OK,
                    [("content-type", "application/json")],
                    spec_json,
                )
            }),
        )
        .route(
            "/functions/openapi/yaml",
            axum::routing::get(|| async move {
                (StatusCode::OK, [("content-type", "text/yaml")], spec_yaml)
            }),
        )
        .layer(cors))
}

async fn run_app(config: &Config) -> Result<(), Error> {
    let store = Arc::new(RestDataStore::new(config)?);
    let app = AppState {
        config: config.clone(),
        dispatcher: EmailDispatcher::new(config.clone(), store),
    };
    let router = build_router(&app)?;

    let host = &config.host;
    let port = config.port;

    let addr: SocketAddr = format_sstr!("{host}:{port}").parse()?;
    debug!("{addr:?}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router.into_make_service())
        .await
        .map_err(Into::into)
}
