use axum::{
    extract::{Json, State},
    http::{HeaderMap, header::AUTHORIZATION},
};
use log::info;
use serde::{Deserialize, Serialize};
use stack_string::{StackString, format_sstr};
use utoipa::{OpenApi, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

use household_calendar_lib::email::Recipient;

use crate::{app::AppState, errors::ServiceError as Error};

type HttpResult<T> = Result<T, Error>;

#[derive(OpenApi)]
#[openapi(info(title = "Household Calendar Functions", description = "Email notifications for household calendar events"))]
pub struct ApiDoc;

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct RecipientWrapper {
    pub email: StackString,
    pub name: Option<StackString>,
}

impl From<RecipientWrapper> for Recipient {
    fn from(item: RecipientWrapper) -> Self {
        Self {
            email: item.email,
            name: item.name,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct SendEmailRequest {
    pub event_id: StackString,
    pub recipients: Option<Vec<RecipientWrapper>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct TestEmailRequest {
    pub to: StackString,
    pub name: Option<StackString>,
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct FunctionResponse {
    pub success: bool,
    pub message: StackString,
    pub ids: Vec<StackString>,
}

fn check_authorization(state: &AppState, headers: &HeaderMap) -> HttpResult<()> {
    let Some(secret) = state.config.function_secret.as_ref() else {
        return Ok(());
    };
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    if bearer == Some(secret.as_str()) {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

#[utoipa::path(
    post,
    path = "/functions/v1/send-email",
    request_body = SendEmailRequest,
    responses(
        (status = OK, description = "Emails sent", body = FunctionResponse),
        Error
    )
)]
async fn send_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SendEmailRequest>,
) -> HttpResult<Json<FunctionResponse>> {
    check_authorization(&state, &headers)?;
    let recipients = payload
        .recipients
        .map(|r| r.into_iter().map(Into::into).collect());
    let report = state
        .dispatcher
        .send_event_notification(&payload.event_id, recipients)
        .await?;
    info!(
        "send-email {} to {} recipients",
        payload.event_id, report.recipients
    );
    Ok(Json(FunctionResponse {
        success: true,
        message: format_sstr!("Email sent to {} recipients", report.recipients),
        ids: report.ids,
    }))
}

#[utoipa::path(
    post,
    path = "/functions/v1/test-email",
    request_body = TestEmailRequest,
    responses(
        (status = OK, description = "Test email sent", body = FunctionResponse),
        Error
    )
)]
async fn test_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<TestEmailRequest>,
) -> HttpResult<Json<FunctionResponse>> {
    check_authorization(&state, &headers)?;
    let result = state
        .dispatcher
        .send_test_email(&payload.to, payload.name.as_ref().map(StackString::as_str))
        .await?;
    Ok(Json(FunctionResponse {
        success: true,
        message: "Test email sent successfully!".into(),
        ids: result.id.into_iter().collect(),
    }))
}

pub fn get_function_path(app: &AppState) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(send_email))
        .routes(routes!(test_email))
        .with_state(app.clone())
}
