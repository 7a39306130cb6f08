//! Wiring: stores, scheduler and executor built from [`Settings`]

use anyhow::{Context, Result};
use std::sync::Arc;

use cadence_core::{SharedClock, SystemClock};
use cadence_persist::SqliteBackend;
use cadence_queue::{MemoryQueue, QueueBackend};
use cadence_resilience::{BreakerRegistry, BreakerStateStore, MemoryBreakerStore};
use cadence_runtime::{HandlerRegistry, MemoryWorkflowStore, WorkflowExecutor, WorkflowStore};
use cadence_scheduler::{MemoryScheduleStore, ScheduleStore, Scheduler};

use crate::settings::{Settings, StorageBackend};

struct Stores {
    queue: Arc<dyn QueueBackend>,
    schedules: Arc<dyn ScheduleStore>,
    workflows: Arc<dyn WorkflowStore>,
    breakers: Arc<dyn BreakerStateStore>,
}

pub struct App {
    pub settings: Settings,
    pub queue: Arc<dyn QueueBackend>,
    pub breaker_store: Arc<dyn BreakerStateStore>,
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<WorkflowExecutor>,
    sqlite: Option<SqliteBackend>,
}

impl App {
    pub async fn open(settings: Settings) -> Result<Self> {
        let clock: SharedClock = SystemClock::shared();

        let (stores, sqlite) = match settings.storage.backend {
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; nothing survives this process");
                let stores = Stores {
                    queue: Arc::new(MemoryQueue::with_clock(clock.clone())),
                    schedules: Arc::new(MemoryScheduleStore::new()),
                    workflows: Arc::new(MemoryWorkflowStore::new()),
                    breakers: Arc::new(MemoryBreakerStore::new()),
                };
                (stores, None)
            }
            StorageBackend::Sqlite => {
                let backend = SqliteBackend::connect(settings.storage.sqlite.clone())
                    .await
                    .with_context(|| format!("Failed to open database {}", settings.storage.sqlite.url))?
                    .with_clock(clock.clone());
                let stores = Stores {
                    queue: backend.queue(),
                    schedules: backend.schedules(),
                    workflows: backend.workflows(),
                    breakers: backend.breakers(),
                };
                (stores, Some(backend))
            }
        };
        let Stores {
            queue,
            schedules,
            workflows,
            breakers: breaker_store,
        } = stores;

        let scheduler = Arc::new(Scheduler::new(
            schedules,
            queue.clone(),
            clock.clone(),
            settings.scheduler.clone(),
        ));
        let breakers = Arc::new(BreakerRegistry::new(settings.breaker.clone(), clock.clone()));
        let executor = Arc::new(WorkflowExecutor::new(
            Arc::new(HandlerRegistry::with_builtins()),
            breakers,
            workflows,
            clock,
            settings.executor.clone(),
        ));

        Ok(Self {
            settings,
            queue,
            breaker_store,
            scheduler,
            executor,
            sqlite,
        })
    }

    pub fn workflows(&self) -> &Arc<dyn WorkflowStore> {
        self.executor.store()
    }

    pub async fn close(&self) {
        if let Some(sqlite) = &self.sqlite {
            sqlite.close().await;
        }
    }
}
