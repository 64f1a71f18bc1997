//! Per-job progress stream over Server-Sent Events.
//!
//! A stream replays the job's current progress, then forwards bus events
//! until exactly one `result` or `error` event has been sent. Once the bus
//! topic is gone the stream keeps re-reading the job on the poll interval,
//! so it always ends with a terminal event.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use futures::stream;
use uuid::Uuid;

use skimmer_core::error::AppError;
use skimmer_core::events::{JobEvent, JobSubscription};
use skimmer_core::job::{ExtractionJob, JobStatus};
use skimmer_core::job_queue::JobQueue;
use skimmer_db::QueueBackend;

use crate::error::ApiError;
use crate::state::AppState;

/// Terminal event implied by a job's stored state, if it is finished.
pub fn terminal_event(job: &ExtractionJob) -> Option<JobEvent> {
    match job.status {
        JobStatus::Completed => Some(match &job.result {
            Some(result) => JobEvent::Completed {
                result: result.clone(),
            },
            None => JobEvent::Failed {
                error: "job completed without a result".into(),
            },
        }),
        JobStatus::Failed => Some(JobEvent::Failed {
            error: job.error.clone().unwrap_or_else(|| "job failed".into()),
        }),
        JobStatus::Cancelled => Some(JobEvent::Failed {
            error: "job cancelled".into(),
        }),
        JobStatus::Queued | JobStatus::Active | JobStatus::Delayed => None,
    }
}

fn to_sse(event: &JobEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to encode job event");
            Event::default().event(event.name())
        })
}

struct StreamState {
    job_id: Uuid,
    queue: QueueBackend,
    subscription: Option<JobSubscription>,
    pending: VecDeque<JobEvent>,
    poll: Duration,
    finished: bool,
}

impl StreamState {
    /// Re-read the job; queue its terminal event if it has finished.
    async fn poll_job(&mut self) -> bool {
        match self.queue.get(self.job_id).await {
            Ok(Some(job)) => match terminal_event(&job) {
                Some(event) => {
                    self.pending.push_back(event);
                    true
                }
                None => false,
            },
            Ok(None) => {
                self.pending.push_back(JobEvent::Failed {
                    error: "job no longer exists".into(),
                });
                true
            }
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Event stream poll failed");
                false
            }
        }
    }

    async fn next_event(&mut self) -> Option<JobEvent> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                if event.is_terminal() {
                    self.pending.clear();
                    self.subscription = None;
                    self.finished = true;
                }
                return Some(event);
            }

            let Some(subscription) = self.subscription.as_mut() else {
                tokio::time::sleep(self.poll).await;
                self.poll_job().await;
                continue;
            };
            tokio::select! {
                received = subscription.recv() => match received {
                    Some(event) => self.pending.push_back(event),
                    None => {
                        // Topic closed without a terminal event reaching us.
                        self.subscription = None;
                        self.poll_job().await;
                    }
                },
                _ = tokio::time::sleep(self.poll) => {
                    self.poll_job().await;
                }
            }
        }
    }
}

fn event_stream(state: StreamState) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(state, |mut state| async move {
        let event = state.next_event().await?;
        Some((Ok(to_sse(&event)), state))
    })
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}/events",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Event stream of progress, then one result or error", body = String, content_type = "text/event-stream"),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn job_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Subscribe before reading so no event falls between the read and the subscription.
    let subscription = state.events.subscribe(id);
    let job = state
        .queue
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job not found: {id}")))?;

    let mut pending = VecDeque::new();
    pending.push_back(JobEvent::progress(
        job.progress.status.clone(),
        job.progress.percentage,
    ));
    let subscription = match terminal_event(&job) {
        Some(event) => {
            pending.push_back(event);
            None
        }
        None => Some(subscription),
    };

    let stream = event_stream(StreamState {
        job_id: id,
        queue: state.queue.clone(),
        subscription,
        pending,
        poll: state.sse_poll_interval,
        finished: false,
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
