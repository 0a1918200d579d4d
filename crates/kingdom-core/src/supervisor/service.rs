//! Service supervisor
//!
//! Owns the queue, bus, connection pool and every agent worker. Handles
//! startup ordering, task submission, completion waits and shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::monitor::{AgentRegistry, MonitorHandle, MonitorTargets, spawn_monitor};
use super::status::{ServiceSnapshot, ServiceStatus};
use crate::agents::{AgentContext, AgentRegistration, AgentSpec, AgentState, AgentWorker, WorkerTiming};
use crate::bus::MessageBus;
use crate::config::{DispatchMode, ServiceConfig};
use crate::pool::ConnectionPool;
use crate::router::TaskRouter;
use crate::task::{AgentId, DEFAULT_PRIORITY, Task, TaskId, TaskOutcome, TaskPayload, TaskQueue};
use crate::{Error, Result};

/// Resources that exist only while the service runs
struct Runtime {
    pool: ConnectionPool,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<RunningWorker>,
    monitor: Option<MonitorHandle>,
}

struct RunningWorker {
    agent_id: AgentId,
    state: Arc<AgentState>,
    handle: JoinHandle<()>,
}

/// Supervises agent workers and routes tasks to them
pub struct Supervisor {
    config: ServiceConfig,
    router: TaskRouter,
    specs: HashMap<String, AgentSpec>,
    queue: Arc<TaskQueue>,
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    status: Mutex<ServiceStatus>,
    /// Last pool built by `start()`, kept for statistics after shutdown
    pool: Mutex<Option<ConnectionPool>>,
    /// Serialises start and stop
    runtime: tokio::sync::Mutex<Option<Runtime>>,
}

impl Supervisor {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let router = TaskRouter::from_config(&config);

        Ok(Self {
            config,
            router,
            specs: HashMap::new(),
            queue: Arc::new(TaskQueue::new()),
            bus: Arc::new(MessageBus::new()),
            registry: Arc::new(AgentRegistry::new()),
            status: Mutex::new(ServiceStatus::Stopped),
            pool: Mutex::new(None),
            runtime: tokio::sync::Mutex::new(None),
        })
    }

    /// Provide the handlers for `agent_type`
    ///
    /// Agent types listed in the configuration without registered handlers
    /// are skipped at start.
    pub fn register_agent_type(&mut self, agent_type: impl Into<String>, spec: AgentSpec) {
        let agent_type = agent_type.into();
        debug!(agent_type = %agent_type, "Agent type registered");
        self.specs.insert(agent_type, spec);
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    fn lock_status(&self) -> MutexGuard<'_, ServiceStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pool(&self) -> MutexGuard<'_, Option<ConnectionPool>> {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn service_status(&self) -> ServiceStatus {
        *self.lock_status()
    }

    fn set_status(&self, status: ServiceStatus) {
        *self.lock_status() = status;
    }

    /// Start the pool, the workers and the monitor
    ///
    /// Calling it while the service is already up logs a warning and does
    /// nothing.
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;

        let current = self.service_status();
        if !current.can_start() {
            warn!(status = %current, "Service already started");
            return Ok(());
        }

        info!(service = %self.config.service_name, "Starting service");
        self.set_status(ServiceStatus::Starting);

        match self.launch().await {
            Ok(started) => {
                let agents = started.workers.len();
                *runtime = Some(started);
                self.set_status(ServiceStatus::Running);
                info!(service = %self.config.service_name, agents, "Service started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Service failed to start");
                self.set_status(ServiceStatus::Error);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Runtime> {
        let pool = ConnectionPool::from_config(&self.config.database)?;
        *self.lock_pool() = Some(pool.clone());

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut runtime = Runtime {
            pool,
            shutdown_tx,
            workers: Vec::new(),
            monitor: None,
        };

        let timing = WorkerTiming::from(&self.config.timing);

        for agent_type in &self.config.agent_types {
            let Some(spec) = self.specs.get(agent_type) else {
                warn!(agent_type = %agent_type, "No handlers registered for agent type, skipping");
                continue;
            };

            for index in 1..=self.config.agents_per_type {
                let agent_id = AgentId::numbered(agent_type, index);
                let ctx = AgentContext::new(
                    agent_id.clone(),
                    agent_type.as_str(),
                    Arc::clone(&self.bus),
                    runtime.pool.clone(),
                    self.config.database.acquire_timeout(),
                );
                let worker = AgentWorker::new(ctx, spec.clone(), Arc::clone(&self.queue), timing);

                if let Err(e) = worker.initialize().await {
                    warn!(agent = %agent_id, "Rolling back started agents");
                    self.teardown(runtime).await;
                    return Err(e);
                }

                self.bus.subscribe(&agent_id);
                if self.config.dispatch_mode == DispatchMode::Direct {
                    self.queue.register_inbox(&agent_id);
                }

                let state = worker.state();
                let handle = worker.spawn(runtime.shutdown_tx.subscribe());

                let mut registration = AgentRegistration::new(agent_id.clone(), agent_type.as_str());
                registration.refresh_from(&state);
                self.registry.insert(registration, Arc::clone(&state));
                runtime.workers.push(RunningWorker {
                    agent_id,
                    state,
                    handle,
                });
            }
        }

        if runtime.workers.is_empty() {
            warn!("No agents started; submissions will fail until agent types are registered");
        }

        runtime.monitor = Some(spawn_monitor(
            MonitorTargets {
                service_name: self.config.service_name.clone(),
                registry: Arc::clone(&self.registry),
                queue: Arc::clone(&self.queue),
                bus: Arc::clone(&self.bus),
            },
            self.config.timing.monitor_interval(),
            self.config.timing.status_log_interval(),
        ));

        Ok(runtime)
    }

    /// Stop every worker and release the pool
    pub async fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;

        let Some(running) = runtime.take() else {
            warn!(status = %self.service_status(), "Service is not running");
            return Ok(());
        };

        info!(service = %self.config.service_name, "Stopping service");
        self.set_status(ServiceStatus::Stopping);
        self.teardown(running).await;
        self.set_status(ServiceStatus::Stopped);
        info!(service = %self.config.service_name, "Service stopped");
        Ok(())
    }

    async fn teardown(&self, runtime: Runtime) {
        let _ = runtime.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + self.config.timing.shutdown_grace();
        for RunningWorker {
            agent_id,
            state,
            mut handle,
        } in runtime.workers
        {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(agent = %agent_id, "Agent joined"),
                Ok(Err(e)) => warn!(agent = %agent_id, error = %e, "Agent task ended abnormally"),
                Err(_) => {
                    warn!(agent = %agent_id, "Agent did not stop within grace period, aborting");
                    handle.abort();
                    let _ = handle.await;

                    // The cancelled handler never reported; its task still needs an outcome
                    if let Some(task_id) = state.current_task() {
                        self.queue.mark_failed(&task_id, "aborted during shutdown");
                        warn!(agent = %agent_id, task_id = %task_id, "In-flight task failed by shutdown");
                    }
                }
            }

            self.bus.unsubscribe(&agent_id);
            let stranded = self.queue.unregister_inbox(&agent_id);
            if !stranded.is_empty() {
                warn!(agent = %agent_id, tasks = stranded.len(), "Dropped tasks left in agent inbox");
            }
        }

        self.registry.refresh();
        self.registry.mark_all_stopped();
        self.registry.clear();

        runtime.pool.close();

        if let Some(monitor) = runtime.monitor {
            monitor.stop().await;
        }
    }

    /// Queue a task and return its id
    ///
    /// Without `agent_id` the router picks the agent. In direct dispatch
    /// mode the task goes straight to that agent's inbox.
    pub fn submit_task(
        &self,
        payload: TaskPayload,
        agent_id: Option<AgentId>,
        priority: Option<u8>,
    ) -> Result<TaskId> {
        let task_type = payload.task_type().to_string();

        let target = match agent_id {
            Some(agent_id) => agent_id,
            None => {
                self.registry.refresh();
                self.router.select_agent(&task_type, &self.registry.table())?
            }
        };

        let task = Task::new(payload)
            .with_agent(target.clone())
            .with_priority(priority.unwrap_or(DEFAULT_PRIORITY));
        let task_id = task.id.clone();

        match self.config.dispatch_mode {
            DispatchMode::Shared => self.queue.submit(task),
            DispatchMode::Direct => self.queue.submit_direct(&target, task)?,
        }

        info!(task_id = %task_id, task_type = %task_type, agent = %target, "Task submitted");
        Ok(task_id)
    }

    /// Submit a task given as a type name and JSON body
    pub fn submit_raw(
        &self,
        task_type: &str,
        body: JsonValue,
        agent_id: Option<AgentId>,
        priority: Option<u8>,
    ) -> Result<TaskId> {
        let payload = TaskPayload::from_parts(task_type, body)?;
        self.submit_task(payload, agent_id, priority)
    }

    /// Outcome of `task_id`, if it has ended
    pub fn outcome(&self, task_id: &TaskId) -> Option<TaskOutcome> {
        self.queue.outcome(task_id)
    }

    /// Wait for `task_id` to end
    ///
    /// Timing out only abandons the wait; the task may still finish later and
    /// its outcome can be read with [`Supervisor::outcome`].
    pub async fn wait_for_completion(&self, task_id: &TaskId, timeout: Duration) -> Result<TaskOutcome> {
        self.queue
            .wait_for(task_id, timeout)
            .await
            .ok_or_else(|| Error::Timeout {
                task_id: task_id.to_string(),
                waited: timeout,
            })
    }

    /// Wait for `task_id` and return its result, turning a failure into an error
    pub async fn wait_for_result(&self, task_id: &TaskId, timeout: Duration) -> Result<JsonValue> {
        self.wait_for_completion(task_id, timeout)
            .await?
            .into_result(task_id)
    }

    pub fn status(&self) -> ServiceSnapshot {
        let database_pool = self
            .lock_pool()
            .as_ref()
            .map(ConnectionPool::stats)
            .unwrap_or_default();

        ServiceSnapshot {
            service_name: self.config.service_name.clone(),
            service_status: self.service_status(),
            agents: self.registry.snapshots(),
            task_queue: self.queue.stats(),
            a2a_messages: self.bus.stats(),
            database_pool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::default::EchoHandler;
    use crate::agents::{AgentStatus, TaskHandler};
    use async_trait::async_trait;
    use serde_json::json;

    /// Sleeps for `body.ms` and returns it
    struct SleepHandler;

    #[async_trait]
    impl TaskHandler for SleepHandler {
        async fn handle(&self, task: &Task, _ctx: &AgentContext) -> anyhow::Result<JsonValue> {
            let ms = task.payload.body()["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        }
    }

    struct RefusesToStart;

    #[async_trait]
    impl TaskHandler for RefusesToStart {
        async fn handle(&self, _task: &Task, _ctx: &AgentContext) -> anyhow::Result<JsonValue> {
            Ok(JsonValue::Null)
        }

        async fn on_start(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
            anyhow::bail!("not ready")
        }
    }

    fn test_config(agent_types: &[&str], agents_per_type: usize) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.agent_types = agent_types.iter().map(|s| s.to_string()).collect();
        config.agents_per_type = agents_per_type;
        config.database.path = ":memory:".to_string();
        config.database.pool_size = 2;
        config.timing.task_poll_interval_ms = 20;
        config.timing.mailbox_poll_interval_ms = 10;
        config.timing.requeue_backoff_ms = 5;
        config.timing.monitor_interval_ms = 20;
        config.timing.shutdown_grace_ms = 1000;
        config.routes.insert("sleep".to_string(), "sleeper".to_string());
        config
    }

    fn supervisor(config: ServiceConfig) -> Supervisor {
        let mut supervisor = Supervisor::new(config).unwrap();
        supervisor.register_agent_type("echo", AgentSpec::with_task_handler(Arc::new(EchoHandler)));
        supervisor.register_agent_type("sleeper", AgentSpec::with_task_handler(Arc::new(SleepHandler)));
        supervisor
    }

    fn sleep_task(ms: u64) -> TaskPayload {
        TaskPayload::custom("sleep", json!({ "ms": ms }))
    }

    fn completed_at(outcome: &TaskOutcome) -> chrono::DateTime<chrono::Utc> {
        match outcome {
            TaskOutcome::Completed { completed_at, .. } => *completed_at,
            other => panic!("task did not complete: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_echo_round_trip() {
        let supervisor = supervisor(test_config(&["echo"], 1));
        supervisor.start().await.unwrap();

        let id = supervisor.submit_task(TaskPayload::echo("hi"), None, None).unwrap();
        let result = supervisor
            .wait_for_result(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, json!("hi"));

        let snapshot = supervisor.status();
        assert_eq!(snapshot.task_queue.completed, 1);
        assert!(snapshot.database_pool.connections_created >= 1);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_raw() {
        let supervisor = supervisor(test_config(&["echo"], 1));
        supervisor.start().await.unwrap();

        let id = supervisor
            .submit_raw("echo", json!({"text": "raw"}), None, Some(1))
            .unwrap();
        let result = supervisor.wait_for_result(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result, json!("raw"));

        // A bare string is the echo text
        let id = supervisor.submit_raw("echo", json!("hi"), None, None).unwrap();
        let result = supervisor.wait_for_result(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result, json!("hi"));

        assert!(matches!(
            supervisor.submit_raw("echo", json!({"txt": 1}), None, None),
            Err(Error::InvalidPayload { .. })
        ));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pinned_to_missing_agent_times_out() {
        let supervisor = supervisor(test_config(&["echo"], 1));
        supervisor.start().await.unwrap();

        let id = supervisor
            .submit_task(TaskPayload::echo("lost"), Some(AgentId::new("X")), None)
            .unwrap();
        let result = supervisor
            .wait_for_completion(&id, Duration::from_millis(300))
            .await;
        assert!(matches!(result, Err(ref e) if e.is_timeout()));
        assert!(supervisor.outcome(&id).is_none());

        supervisor.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_direct_mode_rejects_unknown_agent() {
        let mut config = test_config(&["echo"], 1);
        config.dispatch_mode = DispatchMode::Direct;
        let supervisor = supervisor(config);
        supervisor.start().await.unwrap();

        let result = supervisor.submit_task(TaskPayload::echo("lost"), Some(AgentId::new("X")), None);
        assert!(matches!(result, Err(Error::UnknownAgent(_))));

        let id = supervisor.submit_task(TaskPayload::echo("hi"), None, None).unwrap();
        let result = supervisor.wait_for_result(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result, json!("hi"));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_worker_serialises_tasks() {
        let supervisor = supervisor(test_config(&["sleeper"], 1));
        supervisor.start().await.unwrap();

        let long = supervisor.submit_task(sleep_task(300), None, None).unwrap();
        let short = supervisor.submit_task(sleep_task(10), None, None).unwrap();

        let long_outcome = supervisor.wait_for_completion(&long, Duration::from_secs(5)).await.unwrap();
        let short_outcome = supervisor.wait_for_completion(&short, Duration::from_secs(5)).await.unwrap();
        assert!(completed_at(&short_outcome) >= completed_at(&long_outcome));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_idle_worker_finishes_short_task_first() {
        let supervisor = supervisor(test_config(&["sleeper"], 2));
        supervisor.start().await.unwrap();

        let long = supervisor.submit_task(sleep_task(500), None, None).unwrap();

        // Let the first worker pick up the long task
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            supervisor.registry.refresh();
            if supervisor.status().count_agents(AgentStatus::Busy) == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "long task never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let short = supervisor.submit_task(sleep_task(10), None, None).unwrap();

        let short_outcome = supervisor.wait_for_completion(&short, Duration::from_secs(5)).await.unwrap();
        let long_outcome = supervisor.wait_for_completion(&long, Duration::from_secs(5)).await.unwrap();
        assert!(completed_at(&short_outcome) < completed_at(&long_outcome));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unroutable_task_falls_back_and_fails() {
        // Only echo agents exist, so a db task lands on one and the handler refuses it
        let supervisor = supervisor(test_config(&["echo"], 1));
        supervisor.start().await.unwrap();

        let id = supervisor
            .submit_raw("db_delete", json!({"record_id": 7}), None, None)
            .unwrap();
        let result = supervisor.wait_for_result(&id, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::Handler { .. })));
        assert_eq!(supervisor.status().task_queue.failed, 1);

        // The worker counts the failure just after recording it
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            supervisor.registry.refresh();
            if supervisor.status().agents[&AgentId::new("echo_001")].failed_count == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "failure never counted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        supervisor.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_fails_task_cut_off_by_grace_period() {
        let mut config = test_config(&["sleeper"], 1);
        config.timing.shutdown_grace_ms = 100;
        let supervisor = supervisor(config);
        supervisor.start().await.unwrap();

        let id = supervisor.submit_task(sleep_task(800), None, None).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            supervisor.registry.refresh();
            if supervisor.status().count_agents(AgentStatus::Busy) == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "task never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        supervisor.stop().await.unwrap();

        match supervisor.outcome(&id) {
            Some(TaskOutcome::Failed { error, .. }) => assert!(error.contains("shutdown")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let result = supervisor.wait_for_result(&id, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Handler { .. })));
    }

    #[tokio::test]
    async fn test_submit_without_agents() {
        let supervisor = supervisor(test_config(&["echo"], 1));
        let result = supervisor.submit_task(TaskPayload::echo("hi"), None, None);
        assert!(matches!(result, Err(Error::NoAgentsAvailable { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_start_is_idempotent_and_skips_unknown_types() {
        let supervisor = supervisor(test_config(&["echo", "ghost"], 2));
        supervisor.start().await.unwrap();
        supervisor.start().await.unwrap();

        let snapshot = supervisor.status();
        assert_eq!(snapshot.service_status, ServiceStatus::Running);
        let ids: Vec<&str> = snapshot.agents.keys().map(AgentId::as_str).collect();
        assert_eq!(ids, vec!["echo_001", "echo_002"]);
        assert_eq!(snapshot.a2a_messages.subscribers, 2);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_releases_everything() {
        let supervisor = supervisor(test_config(&["echo"], 2));
        supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();

        let snapshot = supervisor.status();
        assert_eq!(snapshot.service_status, ServiceStatus::Stopped);
        assert!(snapshot.agents.is_empty());
        assert_eq!(snapshot.a2a_messages.subscribers, 0);
        assert_eq!(snapshot.database_pool.available, 0);

        // Stopping twice is harmless, and the service can start again
        supervisor.stop().await.unwrap();
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.status().agents.len(), 2);
        supervisor.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_start_rolls_back() {
        let mut supervisor = supervisor(test_config(&["echo", "broken"], 1));
        supervisor.register_agent_type("broken", AgentSpec::with_task_handler(Arc::new(RefusesToStart)));

        let result = supervisor.start().await;
        assert!(matches!(result, Err(Error::AgentStart { .. })));

        let snapshot = supervisor.status();
        assert_eq!(snapshot.service_status, ServiceStatus::Error);
        assert!(snapshot.agents.is_empty());
        assert_eq!(snapshot.a2a_messages.subscribers, 0);
    }
}
