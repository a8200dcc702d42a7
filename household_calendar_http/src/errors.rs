use anyhow::Error as AnyhowError;
use axum::{
    extract::Json,
    http::{StatusCode, header::InvalidHeaderName},
    response::{IntoResponse, Response},
};
use log::error;
use serde::Serialize;
use serde_json::Error as SerdeJsonError;
use serde_yml::Error as SerdeYamlError;
use stack_string::{StackString, format_sstr};
use std::{fmt::Debug, net::AddrParseError};
use thiserror::Error;
use utoipa::{
    IntoResponses, PartialSchema, ToSchema,
    openapi::{
        content::ContentBuilder,
        response::{ResponseBuilder, ResponsesBuilder},
    },
};

use household_calendar_lib::errors::CalendarError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("AddrParseError {0}")]
    AddrParseError(#[from] AddrParseError),
    #[error("SerdeYamlError {0}")]
    SerdeYamlError(#[from] SerdeYamlError),
    #[error("SerdeJsonError {0}")]
    SerdeJsonError(#[from] SerdeJsonError),
    #[error("InvalidHeaderName {0}")]
    InvalidHeaderName(#[from] InvalidHeaderName),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Anyhow error {0}")]
    AnyhowError(#[from] AnyhowError),
    #[error("io Error {0}")]
    IoError(#[from] std::io::Error),
    #[error("{0}")]
    CalendarError(#[from] CalendarError),
}

#[derive(Serialize, ToSchema)]
struct ErrorMessage {
    message: StackString,
}

impl IntoResponse for ErrorMessage {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorMessage {
                    message: "Unauthorized".into(),
                },
            )
                .into_response(),
            Self::CalendarError(e @ CalendarError::ValidationError { .. }) => (
                StatusCode::BAD_REQUEST,
                ErrorMessage {
                    message: StackString::from_display(e),
                },
            )
                .into_response(),
            e => {
                error!("{e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorMessage {
                        message: format_sstr!("Internal Server Error: {e}"),
                    },
                )
                    .into_response()
            }
        }
    }
}

impl IntoResponses for ServiceError {
    fn responses() -> std::collections::BTreeMap<
        String,
        utoipa::openapi::RefOr<utoipa::openapi::response::Response>,
    > {
        let error_message_content = ContentBuilder::new()
            .schema(Some(ErrorMessage::schema()))
            .build();
        ResponsesBuilder::new()
            .response(
                StatusCode::UNAUTHORIZED.as_str(),
                ResponseBuilder::new()
                    .description("Not Authorized")
                    .content("application/json", error_message_content.clone()),
            )
            .response(
                StatusCode::BAD_REQUEST.as_str(),
                ResponseBuilder::new()
                    .description("Bad Request")
                    .content("application/json", error_message_content.clone()),
            )
            .response(
                StatusCode::INTERNAL_SERVER_ERROR.as_str(),
                ResponseBuilder::new()
                    .description("Internal Server Error")
                    .content("application/json", error_message_content),
            )
            .build()
            .into()
    }
}
