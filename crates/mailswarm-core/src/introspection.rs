use crate::error::CoreError;
use crate::jobs::JobQueue;
use crate::migrations;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreStats {
    pub pollers: usize,
    pub running_pollers: usize,
    pub queued_jobs: usize,
    pub schema_version: i64,
    pub store_suspended: bool,
}

impl crate::Core {
    pub async fn stats(&self) -> Result<CoreStats, CoreError> {
        let statuses = self.manager.snapshot().await;
        let running_pollers = statuses
            .iter()
            .filter(|s| {
                matches!(
                    s.phase,
                    mailswarm_api::PollerPhase::Running
                        | mailswarm_api::PollerPhase::Polling
                        | mailswarm_api::PollerPhase::Waiting
                )
            })
            .count();
        let (queued_jobs, schema_version) = self
            .store
            .read(|conn| Ok((JobQueue::count(conn)?, migrations::schema_version(conn)?)))
            .await?;
        Ok(CoreStats {
            pollers: statuses.len(),
            running_pollers,
            queued_jobs,
            schema_version,
            store_suspended: self.store.is_suspended(),
        })
    }
}
