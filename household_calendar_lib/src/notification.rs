use log::debug;
use serde::{Deserialize, Serialize};
use stack_string::{StackString, format_sstr};
use std::{collections::HashSet, fmt};
use stdout_channel::StdoutChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Granted,
    Denied,
    #[default]
    Default,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Default => "default",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: StackString,
    pub body: StackString,
    pub tag: StackString,
    pub require_interaction: bool,
}

/// User-facing notification delivery.
///
/// `show` is a silent no-op unless permission has been granted.
pub trait NotificationSink {
    fn request_permission(&mut self) -> Permission;
    fn permission(&self) -> Permission;
    fn show(&mut self, notification: &Notification);
}

/// Writes notifications to stdout, once per tag.
pub struct StdoutNotificationSink {
    stdout: StdoutChannel<StackString>,
    enabled: bool,
    permission: Permission,
    shown_tags: HashSet<StackString>,
}

impl StdoutNotificationSink {
    #[must_use]
    pub fn new(stdout: StdoutChannel<StackString>, enabled: bool) -> Self {
        Self {
            stdout,
            enabled,
            permission: Permission::Default,
            shown_tags: HashSet::new(),
        }
    }

    /// Request permission up front so later `show` calls can deliver.
    pub fn init(&mut self) -> Permission {
        let permission = self.request_permission();
        debug!("Notification permission: {permission}");
        permission
    }
}

impl NotificationSink for StdoutNotificationSink {
    fn request_permission(&mut self) -> Permission {
        self.permission = if self.enabled {
            Permission::Granted
        } else {
            Permission::Denied
        };
        self.permission
    }

    fn permission(&self) -> Permission {
        self.permission
    }

    fn show(&mut self, notification: &Notification) {
        if self.permission != Permission::Granted {
            return;
        }
        if !self.shown_tags.insert(notification.tag.clone()) {
            debug!("duplicate notification {}", notification.tag);
            return;
        }
        self.stdout
            .send(format_sstr!("{}: {}", notification.title, notification.body));
    }
}

/// Keeps every delivered notification in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub permission: Permission,
    pub shown: Vec<Notification>,
}

impl RecordingSink {
    #[must_use]
    pub fn granted() -> Self {
        Self {
            permission: Permission::Granted,
            shown: Vec::new(),
        }
    }
}

impl NotificationSink for RecordingSink {
    fn request_permission(&mut self) -> Permission {
        self.permission
    }

    fn permission(&self) -> Permission {
        self.permission
    }

    fn show(&mut self, notification: &Notification) {
        if self.permission == Permission::Granted {
            self.shown.push(notification.clone());
        }
    }
}
