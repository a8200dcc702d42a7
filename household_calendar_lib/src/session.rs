use futures::future::pending;
use log::{debug, info};
use std::future::Future;
use tokio::time::sleep;

use crate::{
    change_feed::Subscription, datastore::DataStore, event_view_model::EventViewModel,
    notification::NotificationSink,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub changes_applied: usize,
    pub reminders_fired: usize,
    pub reminders_missed: usize,
}

/// Drive `vm` until `shutdown` resolves or the change feed closes.
///
/// Changes are applied in arrival order and take priority over the reminder
/// timer; the timer always sleeps until the earliest pending fire time. The
/// subscription is released on return.
pub async fn run_session<D, N, F>(
    vm: &mut EventViewModel<D, N>,
    mut subscription: Subscription,
    shutdown: F,
) -> SessionSummary
where
    D: DataStore,
    N: NotificationSink,
    F: Future<Output = ()>,
{
    let mut summary = SessionSummary::default();
    tokio::pin!(shutdown);
    loop {
        let outcome = vm.fire_due();
        summary.reminders_fired += outcome.fired.len();
        summary.reminders_missed += outcome.missed.len();
        for reminder in &outcome.fired {
            info!("reminder {} {}", reminder.key.tag(), reminder.title);
        }

        let delay = vm.next_fire_time().map(|fire_time| {
            std::time::Duration::try_from(fire_time - vm.now()).unwrap_or_default()
        });
        let timer = async move {
            match delay {
                Some(delay) => sleep(delay).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            change = subscription.recv() => match change {
                Some(change) => {
                    vm.apply_change(change);
                    summary.changes_applied += 1;
                }
                None => {
                    info!("change feed closed");
                    break;
                }
            },
            () = timer => debug!("timer elapsed"),
            () = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }
    subscription.unsubscribe();
    summary
}
