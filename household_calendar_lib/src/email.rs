use anyhow::{Error, format_err};
use async_trait::async_trait;
use dioxus::prelude::{
    Element, GlobalSignal, IntoDynNode, Props, Readable, VirtualDom, component, dioxus_elements, rsx,
};
use log::{debug, info};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use stack_string::{StackString, format_sstr};
use std::sync::Arc;
use time::{OffsetDateTime, macros::format_description};
use url::Url;

use crate::{
    config::Config,
    datastore::DataStore,
    errors::CalendarError,
    models::{Event, Profile},
    timezone::TimeZone,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: StackString,
    #[serde(default)]
    pub name: Option<StackString>,
}

impl Recipient {
    #[must_use]
    pub fn from_profile(profile: &Profile) -> Option<Self> {
        let email = profile.email.as_ref().filter(|e| !e.trim().is_empty())?;
        Some(Self {
            email: email.clone(),
            name: profile.name.clone(),
        })
    }
}

/// Body of a provider send request.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: StackString,
    pub to: Vec<StackString>,
    pub subject: StackString,
    pub html: StackString,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SendResult {
    #[serde(default)]
    pub id: Option<StackString>,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub recipients: usize,
    pub ids: Vec<StackString>,
}

/// `Thursday, October 15, 2026`
#[must_use]
pub fn long_date(dt: OffsetDateTime) -> StackString {
    dt.format(format_description!(
        "[weekday], [month repr:long] [day padding:none], [year]"
    ))
    .map_or_else(|_| StackString::from_display(dt.date()), Into::into)
}

/// `3:05 PM`
#[must_use]
pub fn twelve_hour_time(dt: OffsetDateTime) -> StackString {
    dt.format(format_description!(
        "[hour repr:12 padding:none]:[minute] [period]"
    ))
    .map_or_else(|_| StackString::from_display(dt.time()), Into::into)
}

/// Recipients for an event announcement: everyone with an email except the creator.
#[must_use]
pub fn default_recipients(profiles: &[Profile], creator_id: &str) -> Vec<Recipient> {
    profiles
        .iter()
        .filter(|p| p.id.as_str() != creator_id)
        .filter_map(Recipient::from_profile)
        .collect()
}

fn render_email(mut app: VirtualDom) -> Result<StackString, CalendarError> {
    app.rebuild_in_place();
    let mut renderer = dioxus_ssr::Renderer::default();
    let mut buffer = String::new();
    renderer
        .render_to(&mut buffer, &app)
        .map_err(|e| CalendarError::EmailError(e.into()))?;
    Ok(buffer.into())
}

/// Subject and HTML body announcing `event`.
///
/// # Errors
/// Returns `EmailError` if rendering fails
pub fn compose_event_email(
    event: &Event,
    creator_name: &str,
    tz: TimeZone,
    site_url: &str,
) -> Result<(StackString, StackString), CalendarError> {
    let start = tz.to_local(event.start_time);
    let when = if event.all_day {
        StackString::from("All day")
    } else {
        twelve_hour_time(start)
    };
    let app = VirtualDom::new_with_props(
        EventEmailElement,
        EventEmailElementProps {
            event_title: event.title.clone(),
            description: event.description.clone(),
            creator_name: creator_name.into(),
            date: long_date(start),
            when,
            site_url: site_url.into(),
        },
    );
    let html = render_email(app)?;
    Ok((format_sstr!("New Event: {}", event.title), html))
}

#[component]
fn EventEmailElement(
    event_title: StackString,
    description: Option<StackString>,
    creator_name: StackString,
    date: StackString,
    when: StackString,
    site_url: StackString,
) -> Element {
    let description = description.map(|description| {
        rsx! {
            p { "{description}" }
        }
    });
    rsx! {
        head {
            meta { charset: "utf-8" },
            title { "New Event Added" },
        },
        body {
            style: "font-family: sans-serif; max-width: 600px; margin: 0 auto;",
            h2 { "New Event Added" },
            p { "{creator_name} has added a new event to your household calendar:" },
            h3 { "{event_title}" },
            {description},
            p {
                "📅 {date}",
                br {},
                "⏰ {when}",
            },
            p {
                a {
                    href: "{site_url}",
                    "View calendar",
                }
            },
            p {
                style: "color: #9ca3af;",
                "You are receiving this because you are part of the household calendar.",
            },
        }
    }
}

/// # Errors
/// Returns `EmailError` if rendering fails
pub fn compose_test_email(
    name: Option<&str>,
    sent_at: OffsetDateTime,
) -> Result<(StackString, StackString), CalendarError> {
    let greeting = name
        .filter(|n| !n.is_empty())
        .map(|n| format_sstr!("Hi {n}! "))
        .unwrap_or_default();
    let app = VirtualDom::new_with_props(
        TestEmailElement,
        TestEmailElementProps {
            greeting,
            sent_at: long_date(sent_at),
        },
    );
    let html = render_email(app)?;
    Ok(("Household Calendar Email Test".into(), html))
}

#[component]
fn TestEmailElement(greeting: StackString, sent_at: StackString) -> Element {
    rsx! {
        head {
            meta { charset: "utf-8" },
        },
        body {
            h1 { "Email Integration Working!" },
            p { "{greeting}This test email confirms your household calendar can send event notifications." },
            p { "Test sent at: {sent_at}" },
        }
    }
}

/// Sends event announcements through a Resend-compatible HTTP API.
#[derive(Clone)]
pub struct EmailDispatcher {
    config: Config,
    client: Client,
    store: Arc<dyn DataStore>,
}

impl EmailDispatcher {
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn DataStore>) -> Self {
        Self {
            config,
            client: Client::new(),
            store,
        }
    }

    fn api_key(&self) -> Result<&str, CalendarError> {
        self.config
            .email_api_key
            .as_ref()
            .map(StackString::as_str)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CalendarError::ConfigError("EMAIL_API_KEY not configured".into()))
    }

    /// # Errors
    /// Returns `ConfigError` without an api key, `EmailError` if the provider rejects the message
    pub async fn send(&self, message: &EmailMessage) -> Result<SendResult, CalendarError> {
        let api_key = self.api_key()?;
        debug!("sending {:?} to {:?}", message.subject, message.to);
        let resp = self
            .client
            .post(self.config.email_api_url.as_str())
            .bearer_auth(api_key)
            .json(message)
            .send()
            .await
            .map_err(|e| CalendarError::EmailError(e.into()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CalendarError::EmailError(format_err!(
                "email provider returned {status}: {body}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| CalendarError::EmailError(e.into()))
    }

    /// Email every recipient about `event_id`, one message each.
    ///
    /// # Errors
    /// Returns `ValidationError` for an unknown event, `FetchError` if the
    /// backend can't be read, otherwise as `send`
    pub async fn send_event_notification(
        &self,
        event_id: &str,
        recipients: Option<Vec<Recipient>>,
    ) -> Result<DispatchReport, CalendarError> {
        self.api_key()?;
        let event = self
            .store
            .fetch_event(event_id)
            .await
            .map_err(CalendarError::FetchError)?
            .ok_or_else(|| CalendarError::validation("event_id", format_sstr!("no event {event_id}")))?;
        let profiles = self
            .store
            .fetch_profiles()
            .await
            .map_err(CalendarError::FetchError)?;
        let creator_name = profiles
            .iter()
            .find(|p| p.id == event.created_by)
            .map_or("Someone", Profile::name_or_someone);
        let recipients =
            recipients.unwrap_or_else(|| default_recipients(&profiles, &event.created_by));
        let (subject, html) = compose_event_email(
            &event,
            creator_name,
            self.config.time_zone(),
            &self.config.site_url,
        )?;
        let mut report = DispatchReport {
            recipients: recipients.len(),
            ids: Vec::new(),
        };
        for recipient in &recipients {
            let message = EmailMessage {
                from: self.config.email_from.clone(),
                to: vec![recipient.email.clone()],
                subject: subject.clone(),
                html: html.clone(),
            };
            if let Some(id) = self.send(&message).await?.id {
                report.ids.push(id);
            }
        }
        info!(
            "sent {} notifications for event {event_id}",
            report.recipients
        );
        Ok(report)
    }

    /// # Errors
    /// Returns `ValidationError` for an empty address, otherwise as `send`
    pub async fn send_test_email(
        &self,
        to: &str,
        name: Option<&str>,
    ) -> Result<SendResult, CalendarError> {
        let to = to.trim();
        if to.is_empty() {
            return Err(CalendarError::validation("to", "must not be empty"));
        }
        let (subject, html) = compose_test_email(name, OffsetDateTime::now_utc())?;
        let message = EmailMessage {
            from: self.config.email_from.clone(),
            to: vec![to.into()],
            subject,
            html,
        };
        self.send(&message).await
    }
}

/// Tells the rest of the household about a newly created event.
#[async_trait]
pub trait EventAnnouncer: Send + Sync {
    /// # Errors
    /// Returns error if the announcement could not be delivered
    async fn announce_event(&self, event_id: &str) -> Result<(), CalendarError>;
}

#[async_trait]
impl EventAnnouncer for EmailDispatcher {
    async fn announce_event(&self, event_id: &str) -> Result<(), CalendarError> {
        self.send_event_notification(event_id, None).await?;
        Ok(())
    }
}

/// Client for the backend's `send-email` function.
#[derive(Clone)]
pub struct SendEmailFunction {
    client: Client,
    url: Url,
    token: StackString,
}

#[derive(Serialize)]
struct SendEmailBody<'a> {
    event_id: &'a str,
}

impl SendEmailFunction {
    /// # Errors
    /// Returns error if `backend_url` is not a valid url
    pub fn new(config: &Config) -> Result<Self, Error> {
        let base: Url = config.backend_url.parse()?;
        let token = config
            .function_secret
            .as_ref()
            .or(config.access_token.as_ref())
            .unwrap_or(&config.backend_key)
            .clone();
        Ok(Self {
            client: Client::new(),
            url: base.join("functions/v1/send-email")?,
            token,
        })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl EventAnnouncer for SendEmailFunction {
    async fn announce_event(&self, event_id: &str) -> Result<(), CalendarError> {
        debug!("POST {} {event_id}", self.url);
        let resp = self
            .client
            .post(self.url.clone())
            .bearer_auth(self.token.as_str())
            .json(&SendEmailBody { event_id })
            .send()
            .await
            .map_err(|e| CalendarError::EmailError(e.into()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(CalendarError::EmailError(format_err!(
                "send-email returned {status}: {body}"
            )))
        }
    }
}
