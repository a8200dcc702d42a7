use anyhow::{Error, format_err};
use serde::Deserialize;
use std::{ops::Deref, path::Path, sync::Arc};

use stack_string::StackString;

use crate::timezone::TimeZone;

#[derive(Default, Debug, Deserialize)]
pub struct ConfigInner {
    #[serde(default = "default_backend_url")]
    pub backend_url: StackString,
    #[serde(default)]
    pub backend_key: StackString,
    pub access_token: Option<StackString>,
    pub user_id: Option<StackString>,
    pub default_time_zone: Option<TimeZone>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_host")]
    pub host: StackString,
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default = "default_email_api_url")]
    pub email_api_url: StackString,
    pub email_api_key: Option<StackString>,
    #[serde(default = "default_email_from")]
    pub email_from: StackString,
    #[serde(default = "default_site_url")]
    pub site_url: StackString,
    pub function_secret: Option<StackString>,
}

#[derive(Default, Debug, Clone)]
pub struct Config(Arc<ConfigInner>);

fn default_backend_url() -> StackString {
    "http://localhost:54321".into()
}
fn default_poll_interval() -> u64 {
    30
}
fn default_host() -> StackString {
    "0.0.0.0".into()
}
fn default_port() -> u32 {
    4043
}
fn default_email_api_url() -> StackString {
    "https://api.resend.com/emails".into()
}
fn default_email_from() -> StackString {
    "Household Calendar <noreply@localhost>".into()
}
fn default_site_url() -> StackString {
    "http://localhost:3000".into()
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns error if the environment can't be deserialized into `ConfigInner`
    pub fn init_config() -> Result<Self, Error> {
        let fname = Path::new("config.env");
        let config_dir = dirs::config_dir().ok_or_else(|| format_err!("No CONFIG directory"))?;
        let default_fname = config_dir
            .join("household_calendar_rust")
            .join("config.env");

        let env_file = if fname.exists() {
            fname
        } else {
            &default_fname
        };

        dotenvy::dotenv().ok();

        if env_file.exists() {
            dotenvy::from_path(env_file).ok();
        }

        let conf: ConfigInner = envy::from_env()?;

        Ok(Self(Arc::new(conf)))
    }

    #[must_use]
    pub fn from_inner(inner: ConfigInner) -> Self {
        Self(Arc::new(inner))
    }

    /// Zone used to interpret local wall-clock input and all-day boundaries.
    #[must_use]
    pub fn time_zone(&self) -> TimeZone {
        self.default_time_zone.unwrap_or_else(TimeZone::local)
    }
}

impl Deref for Config {
    type Target = ConfigInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use crate::{
        config::{Config, ConfigInner},
        timezone::TimeZone,
    };

    #[test]
    fn test_config_time_zone() -> Result<(), Error> {
        let tz: TimeZone = "America/New_York".parse()?;
        let config = Config::from_inner(ConfigInner {
            default_time_zone: Some(tz),
            ..ConfigInner::default()
        });
        assert_eq!(config.time_zone(), tz);
        assert_eq!(config.poll_interval, 0);
        Ok(())
    }
}
