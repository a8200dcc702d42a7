use anyhow::{Error, format_err};
use clap::{Args, Parser, Subcommand};
use log::info;
use stack_string::{StackString, format_sstr};
use std::{sync::Arc, time::Duration};
use stdout_channel::StdoutChannel;
use time::{Date, OffsetDateTime, macros::format_description};

use crate::{
    change_feed::{ChangeFeed, PollingChangeFeed},
    clock::SystemClock,
    config::Config,
    datastore::RestDataStore,
    email::SendEmailFunction,
    event_view_model::EventViewModel,
    models::{EventData, color_name},
    notification::StdoutNotificationSink,
    session::run_session,
};

fn parse_date(s: &str) -> Result<Date, Error> {
    Date::parse(s, format_description!("[year]-[month]-[day]")).map_err(Into::into)
}

#[derive(Args, Debug, Clone)]
pub struct EventArgs {
    /// Event title
    #[clap(short, long)]
    title: StackString,
    /// Start, `YYYY-MM-DDTHH:MM` local time, RFC 3339, or `YYYY-MM-DD` with --all-day
    #[clap(short, long)]
    start: StackString,
    #[clap(short, long)]
    description: Option<StackString>,
    #[clap(long)]
    all_day: bool,
    /// Hex color, defaults to blue
    #[clap(long)]
    color: Option<StackString>,
    /// Disable the 15 minute reminder
    #[clap(long)]
    no_reminder_15min: bool,
    #[clap(long)]
    reminder_1hr: bool,
    #[clap(long)]
    reminder_1day: bool,
}

impl From<EventArgs> for EventData {
    fn from(item: EventArgs) -> Self {
        Self {
            title: item.title,
            description: item.description,
            start_time: item.start,
            all_day: item.all_day,
            color: item.color,
            reminder_15min: !item.no_reminder_15min,
            reminder_1hr: item.reminder_1hr,
            reminder_1day: item.reminder_1day,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum CalendarActions {
    /// Print the agenda
    Agenda {
        /// First day to show (defaults to today)
        #[clap(long, value_parser=parse_date)]
        date: Option<Date>,
        /// Number of days to show
        #[clap(long, default_value = "1")]
        days: u16,
    },
    /// List all events
    List,
    /// List pending reminders
    Reminders,
    /// Create an event
    Create(EventArgs),
    /// Replace the fields of an existing event
    Update {
        #[clap(long)]
        id: StackString,
        #[clap(flatten)]
        event: EventArgs,
    },
    /// Delete an event
    Delete {
        #[clap(long)]
        id: StackString,
    },
    /// Update your profile
    Profile {
        #[clap(short, long)]
        email: StackString,
        #[clap(short, long)]
        name: Option<StackString>,
        #[clap(short, long)]
        avatar_url: Option<StackString>,
    },
    /// Follow changes and deliver reminders until interrupted
    Watch {
        /// Don't show notifications, only keep the schedule
        #[clap(short, long)]
        quiet: bool,
    },
}

#[derive(Parser, Debug)]
pub struct CalendarCliOpts {
    #[clap(subcommand)]
    action: Option<CalendarActions>,
}

impl CalendarCliOpts {
    /// # Errors
    /// Return error if the action fails
    pub async fn parse_opts() -> Result<(), Error> {
        let opts = Self::parse();
        let action = opts.action.unwrap_or(CalendarActions::Agenda {
            date: None,
            days: 1,
        });

        let config = Config::init_config()?;
        let stdout = StdoutChannel::new();
        let result = Self::run_action(action, &config, &stdout).await;
        stdout.close().await?;
        result
    }

    async fn run_action(
        action: CalendarActions,
        config: &Config,
        stdout: &StdoutChannel<StackString>,
    ) -> Result<(), Error> {
        let user_id = config
            .user_id
            .clone()
            .ok_or_else(|| format_err!("USER_ID not configured"))?;
        let store = Arc::new(RestDataStore::new(config)?);
        let quiet = matches!(action, CalendarActions::Watch { quiet: true });
        let sink = StdoutNotificationSink::new(stdout.clone(), !quiet);
        let mut vm = EventViewModel::new(
            store.clone(),
            sink,
            Arc::new(SystemClock),
            config.time_zone(),
            user_id,
        )
        .with_announcer(Arc::new(SendEmailFunction::new(config)?));
        let tz = vm.time_zone();

        match action {
            CalendarActions::Agenda { date, days } => {
                vm.load().await?;
                let first = date.unwrap_or_else(|| tz.local_date(OffsetDateTime::now_utc()));
                let mut date = first;
                for _ in 0..days {
                    stdout.send(format_sstr!("{date}"));
                    for event in vm.events_on(date) {
                        let color = color_name(&event.color).unwrap_or(event.color.as_str());
                        stdout.send(format_sstr!("    {} ({color})", event.summary(tz)));
                    }
                    date = match date.next_day() {
                        Some(d) => d,
                        None => break,
                    };
                }
            }
            CalendarActions::List => {
                vm.load().await?;
                for event in vm.events() {
                    stdout.send(event.summary(tz));
                }
            }
            CalendarActions::Reminders => {
                vm.load().await?;
                for reminder in vm.scheduler().entries() {
                    stdout.send(format_sstr!(
                        "{} {} {}",
                        tz.to_local(reminder.fire_time),
                        reminder.key.tag(),
                        reminder.title
                    ));
                }
            }
            CalendarActions::Create(event) => {
                let event = vm.create_event(&event.into()).await?;
                stdout.send(format_sstr!("created {}", event.summary(tz)));
            }
            CalendarActions::Update { id, event } => {
                vm.update_event(&id, &event.into()).await?;
                stdout.send(format_sstr!("updated {id}"));
            }
            CalendarActions::Delete { id } => {
                vm.delete_event(&id).await?;
                stdout.send(format_sstr!("deleted {id}"));
            }
            CalendarActions::Profile {
                email,
                name,
                avatar_url,
            } => {
                vm.load().await?;
                let profile = vm
                    .update_profile(
                        &email,
                        name.as_ref().map(StackString::as_str),
                        avatar_url.as_ref().map(StackString::as_str),
                    )
                    .await?;
                stdout.send(format_sstr!("profile {} {}", profile.id, profile.display_name()));
            }
            CalendarActions::Watch { .. } => {
                if let Err(e) = vm.enable_notifications() {
                    info!("{e}");
                }
                vm.load().await?;
                let period = Duration::from_secs(config.poll_interval);
                let feed =
                    PollingChangeFeed::new(store, period).with_baseline(vm.events().to_vec());
                let subscription = feed.subscribe()?;
                let shutdown = async {
                    tokio::signal::ctrl_c().await.ok();
                };
                let summary = run_session(&mut vm, subscription, shutdown).await;
                stdout.send(format_sstr!(
                    "applied {} changes, fired {} reminders, dropped {} missed",
                    summary.changes_applied,
                    summary.reminders_fired,
                    summary.reminders_missed
                ));
            }
        }
        Ok(())
    }
}
