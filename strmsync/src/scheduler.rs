//! Cron trigger adapter: one scheduled job per source that carries a cron
//! line. Every tick is just a supervisor submission; a tick that finds its
//! task still queued or running is skipped without growing the queue.

use std::sync::Arc;

use strmsync_api::models::CronJobInfo;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SourceConfig;
use crate::supervisor::{SubmitOutcome, TaskSupervisor};

struct RegisteredJob {
    uuid: Uuid,
    source_id: String,
    cron: String,
}

pub struct CronAdapter {
    scheduler: JobScheduler,
    jobs: Vec<RegisteredJob>,
}

impl CronAdapter {
    pub async fn new() -> anyhow::Result<CronAdapter> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| anyhow::anyhow!("failed to create the job scheduler: {e}"))?;
        Ok(CronAdapter {
            scheduler,
            jobs: Vec::new(),
        })
    }

    pub async fn register_sources(
        &mut self,
        supervisor: &Arc<TaskSupervisor>,
        sources: &[SourceConfig],
    ) -> anyhow::Result<()> {
        for source in sources {
            let Some(cron) = &source.cron else {
                warn!(
                    "{} has no cron line, it only runs on manual triggers",
                    source.id
                );
                continue;
            };
            let schedule = widen_cron(cron);
            let job_supervisor = Arc::clone(supervisor);
            let task_id = source.id.clone();
            let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
                let supervisor = job_supervisor.clone();
                let task_id = task_id.clone();
                Box::pin(async move {
                    match supervisor.submit(&task_id, false, "") {
                        SubmitOutcome::Admitted => info!("cron tick admitted task {task_id}"),
                        SubmitOutcome::AlreadyPresent => warn!(
                            "task {task_id} is already queued or running, skipping this cron tick"
                        ),
                        SubmitOutcome::UnknownTask => {
                            warn!("cron tick for unknown task {task_id}")
                        }
                    }
                })
            })
            .map_err(|e| {
                anyhow::anyhow!("invalid cron expression {cron:?} for {}: {e}", source.id)
            })?;
            let uuid = self
                .scheduler
                .add(job)
                .await
                .map_err(|e| anyhow::anyhow!("failed to schedule {}: {e}", source.id))?;
            self.jobs.push(RegisteredJob {
                uuid,
                source_id: source.id.clone(),
                cron: cron.clone(),
            });
            info!("{} scheduled with cron {cron}", source.id);
        }
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start the job scheduler: {e}"))
    }

    /// Scheduled jobs with their next fire time, for the control API.
    pub async fn jobs(&mut self) -> Vec<CronJobInfo> {
        let mut out = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let next_run_time = self
                .scheduler
                .next_tick_for_job(job.uuid)
                .await
                .ok()
                .flatten();
            out.push(CronJobInfo {
                id: job.source_id.clone(),
                cron: job.cron.clone(),
                next_run_time,
            });
        }
        out
    }
}

/// Config files carry classic 5-field cron lines; the scheduler wants the
/// 6-field form with a leading seconds column.
fn widen_cron(cron: &str) -> String {
    if cron.split_whitespace().count() == 5 {
        format!("0 {cron}")
    } else {
        cron.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_lines_gain_a_seconds_column() {
        assert_eq!(widen_cron("0 3 * * *"), "0 0 3 * * *");
        assert_eq!(widen_cron("*/5 * * * *"), "0 */5 * * * *");
        // already six fields: left alone
        assert_eq!(widen_cron("30 0 3 * * *"), "30 0 3 * * *");
    }
}
