// Generation task pipeline, as seen from the presence tracker.
//
// The tracker only ever needs one thing from the pipeline: when a user
// comes back after a long gap, release every task still flagged as running
// inside their previous session.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone)]
pub enum TaskPipeline {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryTasks>>),
}

#[derive(Debug, Default)]
pub struct MemoryTasks {
    in_session: HashMap<Uuid, u64>,
    clear_calls: Vec<Uuid>,
}

impl TaskPipeline {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryTasks::default())))
    }

    /// Clears `in_session` on every task owned by `user_id`, returning how
    /// many tasks were released.
    pub async fn clear_in_session(&self, user_id: Uuid) -> anyhow::Result<u64> {
        match self {
            Self::Postgres(pool) => {
                let result = sqlx::query(
                    "UPDATE generation_tasks SET in_session = FALSE \
                     WHERE user_id = $1 AND in_session",
                )
                .bind(user_id)
                .execute(pool)
                .await
                .with_context(|| format!("failed to release in-session tasks for {user_id}"))?;
                Ok(result.rows_affected())
            }
            Self::Memory(tasks) => {
                let mut tasks = tasks.write().await;
                tasks.clear_calls.push(user_id);
                Ok(tasks.in_session.remove(&user_id).unwrap_or(0))
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn mark_in_session(&self, user_id: Uuid, count: u64) {
        if let Self::Memory(tasks) = self {
            *tasks.write().await.in_session.entry(user_id).or_default() += count;
        }
    }

    #[cfg(test)]
    pub(crate) async fn clear_calls(&self) -> Vec<Uuid> {
        match self {
            Self::Memory(tasks) => tasks.read().await.clear_calls.clone(),
            Self::Postgres(_) => Vec::new(),
        }
    }
}
