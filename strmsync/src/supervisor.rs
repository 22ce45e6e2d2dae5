//! Global task admission: a FIFO queue drained by one long-lived consumer,
//! with at most one mirror run in flight across all trigger sources and no
//! duplicate admission per task id.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::config::SourceConfig;
use crate::mirror::MirrorEngine;
use crate::notify::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Admitted,
    /// The task id is already queued or running; nothing changed.
    AlreadyPresent,
    /// No source with this id is configured.
    UnknownTask,
}

struct QueueItem {
    task_id: String,
    refresh: bool,
    sub_dir: String,
    enqueued_at: std::time::Instant,
}

#[derive(Default)]
struct SupervisorState {
    queue: VecDeque<QueueItem>,
    status: HashMap<String, TaskStatus>,
}

/// The engine a run executes on. Production uses [`MirrorEngine`]; tests
/// substitute a recorder.
#[async_trait]
pub trait MirrorRunner: Send + Sync {
    async fn run(
        &self,
        source: &SourceConfig,
        refresh: bool,
        sub_dir: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl MirrorRunner for MirrorEngine {
    async fn run(
        &self,
        source: &SourceConfig,
        refresh: bool,
        sub_dir: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        MirrorEngine::run(self, source, refresh, sub_dir, cancel).await
    }
}

pub struct TaskSupervisor {
    sources: HashMap<String, SourceConfig>,
    state: Mutex<SupervisorState>,
    wakeup: Notify,
    /// Single-flight gate; held for the duration of each run so that even
    /// with several consumers at most one run is in progress.
    admit: Semaphore,
    runner: Box<dyn MirrorRunner>,
    notifier: Arc<Notifier>,
    cancel: CancellationToken,
}

impl TaskSupervisor {
    pub fn new(
        sources: impl IntoIterator<Item = SourceConfig>,
        runner: Box<dyn MirrorRunner>,
        notifier: Arc<Notifier>,
        cancel: CancellationToken,
    ) -> Arc<TaskSupervisor> {
        Arc::new(TaskSupervisor {
            sources: sources
                .into_iter()
                .map(|source| (source.id.clone(), source))
                .collect(),
            state: Mutex::new(SupervisorState::default()),
            wakeup: Notify::new(),
            admit: Semaphore::new(1),
            runner,
            notifier,
            cancel,
        })
    }

    pub fn source(&self, task_id: &str) -> Option<&SourceConfig> {
        self.sources.get(task_id)
    }

    /// Appends a task to the queue unless the same id is already queued or
    /// running.
    pub fn submit(&self, task_id: &str, refresh: bool, sub_dir: &str) -> SubmitOutcome {
        if !self.sources.contains_key(task_id) {
            return SubmitOutcome::UnknownTask;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.status.contains_key(task_id) {
                return SubmitOutcome::AlreadyPresent;
            }
            state.status.insert(task_id.to_owned(), TaskStatus::Queued);
            state.queue.push_back(QueueItem {
                task_id: task_id.to_owned(),
                refresh,
                sub_dir: sub_dir.to_owned(),
                enqueued_at: std::time::Instant::now(),
            });
        }
        self.wakeup.notify_one();
        SubmitOutcome::Admitted
    }

    /// Task ids currently queued or running, sorted for stable output.
    pub fn known_tasks(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state.status.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.state.lock().unwrap().status.get(task_id).copied()
    }

    async fn next_item(&self) -> Option<QueueItem> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            let popped = self.state.lock().unwrap().queue.pop_front();
            if let Some(item) = popped {
                return Some(item);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = self.wakeup.notified() => {}
            }
        }
    }

    /// Long-lived consumer; drains the queue one run at a time until the
    /// process shuts down. Queued items left behind at shutdown are dropped.
    pub async fn consumer_main(self: Arc<TaskSupervisor>) {
        info!("task consumer started");
        while let Some(item) = self.next_item().await {
            let task_id = item.task_id;
            self.state
                .lock()
                .unwrap()
                .status
                .insert(task_id.clone(), TaskStatus::Running);
            let permit = match self.admit.acquire().await {
                Ok(permit) => permit,
                Err(_closed) => unreachable!("we never close the semaphore"),
            };
            let source = self
                .sources
                .get(&task_id)
                .expect("submit only admits configured tasks");

            info!(
                "task {task_id} starting after {:?} in the queue",
                item.enqueued_at.elapsed()
            );
            self.notifier
                .send_message(&format!("task {task_id} started"))
                .await;
            let result = self
                .runner
                .run(source, item.refresh, &item.sub_dir, &self.cancel)
                .instrument(info_span!("run", task_id = %task_id))
                .await;
            drop(permit);
            self.state.lock().unwrap().status.remove(&task_id);

            match result {
                Ok(()) => {
                    info!("task {task_id} finished");
                    self.notifier
                        .send_message(&format!("task {task_id} finished"))
                        .await;
                }
                Err(e) => {
                    error!("task {task_id} failed: {e:#}");
                    self.notifier
                        .send_message(&format!("task {task_id} failed: {e:#}"))
                        .await;
                }
            }
        }
        info!("task consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn source(id: &str) -> SourceConfig {
        serde_yaml::from_str(&format!("{{ id: {id}, target_dir: /out/{id} }}")).unwrap()
    }

    #[derive(Default)]
    struct RecordingRunner {
        runs: Mutex<Vec<(String, String)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl MirrorRunner for RecordingRunner {
        async fn run(
            &self,
            source: &SourceConfig,
            _refresh: bool,
            sub_dir: &str,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.runs
                .lock()
                .unwrap()
                .push((source.id.clone(), sub_dir.to_owned()));
            Ok(())
        }
    }

    struct Harness {
        supervisor: Arc<TaskSupervisor>,
        runner: Arc<RecordingRunner>,
        cancel: CancellationToken,
    }

    fn harness(sources: Vec<SourceConfig>) -> Harness {
        // the trait object and the test handle share the recorder
        struct Shared(Arc<RecordingRunner>);
        #[async_trait]
        impl MirrorRunner for Shared {
            async fn run(
                &self,
                source: &SourceConfig,
                refresh: bool,
                sub_dir: &str,
                cancel: &CancellationToken,
            ) -> anyhow::Result<()> {
                self.0.run(source, refresh, sub_dir, cancel).await
            }
        }

        let runner = Arc::new(RecordingRunner::default());
        let cancel = CancellationToken::new();
        let supervisor = TaskSupervisor::new(
            sources,
            Box::new(Shared(runner.clone())),
            Arc::new(Notifier::new("", "")),
            cancel.clone(),
        );
        Harness {
            supervisor,
            runner,
            cancel,
        }
    }

    async fn drain(harness: &Harness) {
        let consumer = tokio::spawn(harness.supervisor.clone().consumer_main());
        tokio::time::timeout(Duration::from_secs(5), async {
            while !harness.supervisor.known_tasks().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue did not drain");
        harness.cancel.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_submission_is_rejected() {
        let harness = harness(vec![source("movies")]);

        assert_eq!(
            harness.supervisor.submit("movies", false, ""),
            SubmitOutcome::Admitted
        );
        assert_eq!(
            harness.supervisor.submit("movies", false, ""),
            SubmitOutcome::AlreadyPresent
        );
        assert_eq!(harness.supervisor.known_tasks(), vec!["movies"]);

        drain(&harness).await;
        assert_eq!(harness.runner.runs.lock().unwrap().len(), 1);
        assert!(harness.supervisor.known_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_task_is_rejected() {
        let harness = harness(vec![source("movies")]);
        assert_eq!(
            harness.supervisor.submit("nope", false, ""),
            SubmitOutcome::UnknownTask
        );
        assert!(harness.supervisor.known_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn runs_are_single_flight_and_fifo() {
        let harness = harness(vec![source("movies"), source("shows"), source("anime")]);

        harness.supervisor.submit("movies", false, "");
        harness.supervisor.submit("shows", false, "sub");
        harness.supervisor.submit("anime", false, "");

        drain(&harness).await;

        let runs = harness.runner.runs.lock().unwrap();
        assert_eq!(
            *runs,
            vec![
                ("movies".to_owned(), "".to_owned()),
                ("shows".to_owned(), "sub".to_owned()),
                ("anime".to_owned(), "".to_owned()),
            ]
        );
        assert_eq!(harness.runner.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resubmission_after_completion_is_admitted() {
        let harness = harness(vec![source("movies")]);

        harness.supervisor.submit("movies", false, "");
        drain(&harness).await;

        assert_eq!(
            harness.supervisor.submit("movies", false, ""),
            SubmitOutcome::Admitted
        );
    }
}
