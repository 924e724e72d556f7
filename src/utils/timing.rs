use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::utils::logging::TIMING_TARGET;

/// Tracks one user-facing job (a generation fan-out or a slideshow build)
/// from acceptance to the final report, on the `bot.timing` target.
#[derive(Debug)]
pub struct JobTimer {
    job: String,
    chat_id: i64,
    text: Option<String>,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    status: String,
    detail: Option<String>,
    completed: bool,
}

impl JobTimer {
    pub fn new(job: &str, chat_id: i64, text: Option<&str>) -> Self {
        let text = text.map(|value| {
            let flattened = value.replace('\n', " ");
            if flattened.chars().count() > 300 {
                flattened.chars().take(300).collect()
            } else {
                flattened
            }
        });

        JobTimer {
            job: job.to_string(),
            chat_id,
            text,
            started_at: Utc::now(),
            started_perf: Instant::now(),
            status: "success".to_string(),
            detail: None,
            completed: false,
        }
    }

    pub fn log_received(&self) {
        info!(
            target: TIMING_TARGET,
            "event=job_received job={} chat_id={} received_at={} text={:?}",
            self.job,
            self.chat_id,
            self.started_at.to_rfc3339(),
            self.text
        );
    }

    pub fn mark_status(&mut self, status: &str, detail: Option<String>) {
        self.status = status.to_string();
        self.detail = detail;
    }

    pub fn log_completed(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        let completed_at = Utc::now();
        let duration = self.started_perf.elapsed().as_secs_f64();
        info!(
            target: TIMING_TARGET,
            "event=job_completed job={} chat_id={} started_at={} completed_at={} duration_s={:.3} status={} detail={}",
            self.job,
            self.chat_id,
            self.started_at.to_rfc3339(),
            completed_at.to_rfc3339(),
            duration,
            self.status,
            self.detail.clone().unwrap_or_default()
        );
    }
}

impl Drop for JobTimer {
    fn drop(&mut self) {
        if !self.completed {
            self.mark_status("abandoned", None);
            self.log_completed();
        }
    }
}

pub fn start_job_timer(job: &str, chat_id: i64, text: Option<&str>) -> JobTimer {
    let timer = JobTimer::new(job, chat_id, text);
    timer.log_received();
    timer
}

pub fn complete_job_timer(timer: &mut JobTimer, status: &str, detail: Option<String>) {
    timer.mark_status(status, detail);
    timer.log_completed();
}

pub async fn log_provider_timing<T, E, F, Fut>(
    provider: &str,
    model: &str,
    operation: &str,
    call: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    info!(
        target: TIMING_TARGET,
        "event=provider_request provider={} model={} operation={} started_at={}",
        provider,
        model,
        operation,
        started_at.to_rfc3339()
    );

    let result = call().await;
    let status = if result.is_ok() { "success" } else { "error" };

    info!(
        target: TIMING_TARGET,
        "event=provider_response provider={} model={} operation={} completed_at={} duration_s={:.3} status={}",
        provider,
        model,
        operation,
        Utc::now().to_rfc3339(),
        started_perf.elapsed().as_secs_f64(),
        status
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_prompts_are_clipped_for_the_timing_log() {
        let prompt = "слово ".repeat(100);
        let mut timer = JobTimer::new("promo", 42, Some(&prompt));
        assert_eq!(timer.text.as_ref().map(|text| text.chars().count()), Some(300));
        complete_job_timer(&mut timer, "success", None);
        assert!(timer.completed);
    }

    #[tokio::test]
    async fn provider_timing_passes_the_result_through() {
        let ok: Result<u32, String> =
            log_provider_timing("openai", "gpt", "text", || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<u32, String> =
            log_provider_timing("deepai", "text2video", "video", || async {
                Err("boom".to_string())
            })
            .await;
        assert_eq!(err, Err("boom".to_string()));
    }
}
