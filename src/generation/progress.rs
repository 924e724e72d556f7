use std::sync::Arc;
use std::time::Duration;

use teloxide::types::ChatId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::generation::ChatReporter;

/// Periodic "still working" reports running next to a long job. The first
/// report goes out one interval after start. Stopping is cooperative: the
/// task finishes its current report and exits.
pub struct ProgressPinger {
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<u32>>,
}

impl ProgressPinger {
    pub fn start(reporter: Arc<dyn ChatReporter>, chat_id: ChatId, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(started + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut pings = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        pings += 1;
                        if let Err(err) = reporter.still_working(chat_id, started.elapsed()).await {
                            warn!("Failed to send progress update to chat {}: {err}", chat_id.0);
                        }
                    }
                }
            }
            debug!("Progress pinger for chat {} stopped after {pings} update(s)", chat_id.0);
            pings
        });

        ProgressPinger {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signals the pinger to stop and waits for it. Returns how many
    /// updates were sent.
    pub async fn stop(mut self) -> u32 {
        let _ = self.stop_tx.send(true);
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for ProgressPinger {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::testing::RecordingReporter;

    #[tokio::test(start_paused = true)]
    async fn pings_every_interval_until_stopped() {
        let reporter = Arc::new(RecordingReporter::default());
        let pinger = ProgressPinger::start(reporter.clone(), ChatId(7), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(pinger.stop().await, 3);
        assert_eq!(
            reporter.pings(),
            vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(90)
            ]
        );

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(reporter.pings().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn quick_jobs_send_no_pings() {
        let reporter = Arc::new(RecordingReporter::default());
        let pinger = ProgressPinger::start(reporter.clone(), ChatId(7), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(pinger.stop().await, 0);
        assert!(reporter.pings().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_the_pinger() {
        let reporter = Arc::new(RecordingReporter::default());
        let pinger = ProgressPinger::start(reporter.clone(), ChatId(7), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(15)).await;
        drop(pinger);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reporter.pings().len(), 1);
    }
}
