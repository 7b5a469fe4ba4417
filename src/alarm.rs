use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// External one-shot wake timer.
///
/// Arming always replaces the previously armed wake; at most one pending
/// wake exists per agent at any time.
pub trait Alarm: Send + Sync {
    fn arm(&self, fire_at: DateTime<Utc>);
}

/// In-process alarm backed by a watch channel. The daemon side holds the
/// [`AlarmListener`] and sleeps until the latest armed deadline.
pub struct TokioAlarm {
    tx: watch::Sender<Option<DateTime<Utc>>>,
}

pub struct AlarmListener {
    rx: watch::Receiver<Option<DateTime<Utc>>>,
    last_fired: Option<DateTime<Utc>>,
}

impl TokioAlarm {
    pub fn new() -> (Self, AlarmListener) {
        let (tx, rx) = watch::channel(None);
        (
            Self { tx },
            AlarmListener {
                rx,
                last_fired: None,
            },
        )
    }
}

impl Alarm for TokioAlarm {
    fn arm(&self, fire_at: DateTime<Utc>) {
        // send_replace: re-arming overwrites, never queues.
        self.tx.send_replace(Some(fire_at));
    }
}

impl AlarmListener {
    /// Wait until the currently armed deadline passes. A re-arm while
    /// waiting restarts the wait against the new deadline; a deadline that
    /// already fired is never delivered twice.
    pub async fn next_fire(&mut self) {
        loop {
            let deadline = *self.rx.borrow_and_update();
            match deadline {
                // Nothing armed (or already delivered); wait for an arm. If
                // the sender is gone the alarm can never fire again.
                None => {
                    if self.rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                Some(fire_at) if self.last_fired == Some(fire_at) => {
                    if self.rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                Some(fire_at) => {
                    let wait = (fire_at - Utc::now())
                        .to_std()
                        .unwrap_or(std::time::Duration::ZERO);
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {
                            self.last_fired = Some(fire_at);
                            return;
                        }
                        changed = self.rx.changed() => {
                            if changed.is_err() {
                                std::future::pending::<()>().await;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    #[tokio::test]
    async fn rearming_replaces_pending_wake() {
        let (alarm, mut listener) = TokioAlarm::new();

        // First arm far in the future, then replace with one that is due.
        alarm.arm(Utc::now() + ChronoDuration::hours(1));
        alarm.arm(Utc::now() + ChronoDuration::milliseconds(20));

        tokio::time::timeout(Duration::from_secs(2), listener.next_fire())
            .await
            .expect("replaced alarm should fire promptly");
    }

    #[tokio::test]
    async fn unarmed_alarm_does_not_fire() {
        let (_alarm, mut listener) = TokioAlarm::new();
        let fired = tokio::time::timeout(Duration::from_millis(50), listener.next_fire()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn fired_deadline_is_not_delivered_twice() {
        let (alarm, mut listener) = TokioAlarm::new();
        alarm.arm(Utc::now() + ChronoDuration::milliseconds(10));

        tokio::time::timeout(Duration::from_secs(2), listener.next_fire())
            .await
            .expect("armed alarm should fire");

        let refire = tokio::time::timeout(Duration::from_millis(50), listener.next_fire()).await;
        assert!(refire.is_err());
    }

    #[tokio::test]
    async fn past_deadline_fires_immediately() {
        let (alarm, mut listener) = TokioAlarm::new();
        alarm.arm(Utc::now() - ChronoDuration::seconds(1));

        tokio::time::timeout(Duration::from_secs(2), listener.next_fire())
            .await
            .expect("overdue alarm should fire immediately");
    }
}
