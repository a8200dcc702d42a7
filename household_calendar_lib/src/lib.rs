#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]

pub mod calendar_cli_opts;
pub mod change_feed;
pub mod clock;
pub mod config;
pub mod datastore;
pub mod datetime_wrapper;
pub mod email;
pub mod errors;
pub mod event_view_model;
pub mod models;
pub mod notification;
pub mod reminder_scheduler;
pub mod session;
pub mod timezone;
