use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use teloxide::types::ChatId;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::generation::{ChatReporter, GenerationError, ProgressPinger, Stage, StageRunner};
use crate::utils::timing::{complete_job_timer, start_job_timer};

/// One prompt from one chat. Lives only as long as its background job.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub chat_id: ChatId,
    pub prompt: String,
    pub requested_at: DateTime<Utc>,
}

impl GenerationRequest {
    pub fn new(chat_id: ChatId, prompt: impl Into<String>) -> Self {
        GenerationRequest {
            chat_id,
            prompt: prompt.into(),
            requested_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    Failed(String),
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FanOutSummary {
    pub outcomes: Vec<(Stage, StageOutcome)>,
    pub elapsed: Duration,
}

impl FanOutSummary {
    pub fn failures(&self) -> impl Iterator<Item = (Stage, &str)> + '_ {
        self.outcomes.iter().filter_map(|(stage, outcome)| match outcome {
            StageOutcome::Failed(message) => Some((*stage, message.as_str())),
            StageOutcome::Succeeded => None,
        })
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_success())
            .count()
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "task was cancelled".to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic without message".to_string())
}

async fn run_single_stage(
    runner: Arc<dyn StageRunner>,
    reporter: Arc<dyn ChatReporter>,
    chat_id: ChatId,
    stage: Stage,
    prompt: Arc<str>,
) -> StageOutcome {
    if let Err(err) = reporter.stage_started(chat_id, stage).await {
        warn!("Failed to announce {stage} stage to chat {}: {err}", chat_id.0);
    }

    let result = match runner.run_stage(stage, &prompt).await {
        Ok(output) => reporter
            .deliver(chat_id, stage, output)
            .await
            .map_err(|err| GenerationError::Delivery(err.to_string())),
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => {
            info!("{stage} stage finished for chat {}", chat_id.0);
            StageOutcome::Succeeded
        }
        Err(err) => {
            if err.is_not_configured() {
                info!("{stage} stage skipped for chat {}: {err}", chat_id.0);
            } else {
                warn!("{stage} stage failed for chat {}: {err}", chat_id.0);
            }
            if let Err(report_err) = reporter.stage_failed(chat_id, stage, &err).await {
                warn!("Failed to report {stage} failure to chat {}: {report_err}", chat_id.0);
            }
            StageOutcome::Failed(err.to_string())
        }
    }
}

/// Runs the text, image and video stages of a prompt side by side. Each stage
/// is its own task, so an error or even a panic in one never stops the
/// others from running and reporting.
#[derive(Clone)]
pub struct FanOut {
    runner: Arc<dyn StageRunner>,
    reporter: Arc<dyn ChatReporter>,
    status_interval: Duration,
}

impl FanOut {
    pub fn new(
        runner: Arc<dyn StageRunner>,
        reporter: Arc<dyn ChatReporter>,
        status_interval: Duration,
    ) -> Self {
        FanOut {
            runner,
            reporter,
            status_interval,
        }
    }

    pub async fn run(&self, request: &GenerationRequest) -> FanOutSummary {
        let chat_id = request.chat_id;
        let pinger = ProgressPinger::start(self.reporter.clone(), chat_id, self.status_interval);
        let prompt: Arc<str> = Arc::from(request.prompt.as_str());

        let mut tasks = JoinSet::new();
        let mut stage_by_task = HashMap::new();
        for stage in Stage::ALL {
            let handle = tasks.spawn(run_single_stage(
                self.runner.clone(),
                self.reporter.clone(),
                chat_id,
                stage,
                prompt.clone(),
            ));
            stage_by_task.insert(handle.id(), stage);
        }

        let mut outcomes = Vec::with_capacity(Stage::ALL.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((task_id, outcome)) => {
                    if let Some(stage) = stage_by_task.get(&task_id) {
                        outcomes.push((*stage, outcome));
                    }
                }
                Err(err) => {
                    let Some(stage) = stage_by_task.get(&err.id()).copied() else {
                        error!("Unknown stage task failed for chat {}: {err}", chat_id.0);
                        continue;
                    };
                    error!("{stage} stage task crashed for chat {}: {err}", chat_id.0);
                    let failure = GenerationError::Crashed(describe_join_error(err));
                    if let Err(report_err) = self.reporter.stage_failed(chat_id, stage, &failure).await {
                        warn!("Failed to report {stage} crash to chat {}: {report_err}", chat_id.0);
                    }
                    outcomes.push((stage, StageOutcome::Failed(failure.to_string())));
                }
            }
        }
        pinger.stop().await;

        outcomes.sort_by_key(|(stage, _)| *stage);
        let summary = FanOutSummary {
            outcomes,
            elapsed: (Utc::now() - request.requested_at)
                .to_std()
                .unwrap_or_default(),
        };
        if let Err(err) = self.reporter.all_finished(chat_id, &summary).await {
            warn!("Failed to send completion message to chat {}: {err}", chat_id.0);
        }
        summary
    }

    /// Starts the fan-out as a detached background job. A crash anywhere in
    /// the job is logged and reported to the chat as an internal error.
    pub fn spawn(&self, request: GenerationRequest) -> JoinHandle<Option<FanOutSummary>> {
        let fan_out = self.clone();
        tokio::spawn(async move {
            let chat_id = request.chat_id;
            let mut timer = start_job_timer("generation", chat_id.0, Some(&request.prompt));

            let worker = {
                let fan_out = fan_out.clone();
                tokio::spawn(async move { fan_out.run(&request).await })
            };

            match worker.await {
                Ok(summary) => {
                    let failed = summary.failures().count();
                    let status = if failed == 0 { "success" } else { "partial" };
                    complete_job_timer(&mut timer, status, Some(format!("failed_stages={failed}")));
                    Some(summary)
                }
                Err(err) => {
                    error!("Generation job for chat {} crashed: {err}", chat_id.0);
                    let detail = describe_join_error(err);
                    complete_job_timer(&mut timer, "error", Some(detail.clone()));
                    if let Err(report_err) = fan_out.reporter.internal_error(chat_id, &detail).await {
                        error!("Failed to report internal error to chat {}: {report_err}", chat_id.0);
                    }
                    None
                }
            }
        })
    }
}
