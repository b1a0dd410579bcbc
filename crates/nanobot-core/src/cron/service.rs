use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use croner::Cron;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::types::{Job, Payload, Schedule};

/// Async handler invoked when a job fires. Returns the agent's result text.
pub type JobHandler =
    Arc<dyn Fn(Job) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStatus {
    pub running: bool,
    pub total_jobs: usize,
    pub enabled_jobs: usize,
    pub store_path: String,
}

struct ServiceState {
    jobs: HashMap<String, Job>,
    running: bool,
    cancel: CancellationToken,
    timers: Vec<JoinHandle<()>>,
    handler: Option<JobHandler>,
}

/// Persistent job scheduler. The jobs.json file is the source of truth
/// across restarts; every mutation rewrites the whole map.
pub struct CronService {
    store_path: PathBuf,
    state: tokio::sync::Mutex<ServiceState>,
}

impl CronService {
    /// Load the store (missing or corrupt file yields an empty catalog).
    pub fn new(store_path: PathBuf) -> Arc<Self> {
        let jobs = load_jobs(&store_path);
        Arc::new(Self {
            store_path,
            state: tokio::sync::Mutex::new(ServiceState {
                jobs,
                running: false,
                cancel: CancellationToken::new(),
                timers: Vec::new(),
                handler: None,
            }),
        })
    }

    pub async fn set_handler(&self, handler: JobHandler) {
        self.state.lock().await.handler = Some(handler);
    }

    /// Add a job. A persistence failure rolls the insertion back.
    pub async fn add_job(
        self: &Arc<Self>,
        name: &str,
        schedule: Schedule,
        payload: Payload,
    ) -> Result<Job> {
        let job = Job::new(name, schedule, payload);
        let mut state = self.state.lock().await;

        state.jobs.insert(job.id.clone(), job.clone());
        if let Err(e) = save_jobs(&self.store_path, &state.jobs) {
            state.jobs.remove(&job.id);
            return Err(anyhow::anyhow!("failed to save job: {e}"));
        }

        if state.running && job.schedulable(Utc::now()) {
            let handle = self.spawn_timer(job.clone(), state.cancel.child_token());
            state.timers.push(handle);
        }

        info!("Added cron job '{}' (id: {})", job.name, job.id);
        Ok(job)
    }

    pub async fn remove_job(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.jobs.remove(id).is_none() {
            return false;
        }
        if let Err(e) = save_jobs(&self.store_path, &state.jobs) {
            warn!("Failed to persist cron store after remove: {e}");
        }
        info!("Removed cron job {id}");
        true
    }

    pub async fn enable_job(self: &Arc<Self>, id: &str, enabled: bool) -> Option<Job> {
        let mut state = self.state.lock().await;
        let job = match state.jobs.get_mut(id) {
            Some(j) => {
                j.enabled = enabled;
                j.clone()
            }
            None => return None,
        };
        if let Err(e) = save_jobs(&self.store_path, &state.jobs) {
            warn!("Failed to persist cron store after enable: {e}");
        }
        if state.running && enabled && job.schedulable(Utc::now()) {
            let handle = self.spawn_timer(job.clone(), state.cancel.child_token());
            state.timers.push(handle);
        }
        Some(job)
    }

    pub async fn get_job(&self, id: &str) -> Option<Job> {
        self.state.lock().await.jobs.get(id).cloned()
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        jobs
    }

    pub async fn status(&self) -> CronStatus {
        let state = self.state.lock().await;
        CronStatus {
            running: state.running,
            total_jobs: state.jobs.len(),
            enabled_jobs: state.jobs.values().filter(|j| j.enabled).count(),
            store_path: self.store_path.display().to_string(),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Schedule every enabled job and enter the running state.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.running {
            anyhow::bail!("service already running");
        }
        state.running = true;
        state.cancel = CancellationToken::new();

        let now = Utc::now();
        let due: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.schedulable(now))
            .cloned()
            .collect();
        for job in due {
            let handle = self.spawn_timer(job, state.cancel.child_token());
            state.timers.push(handle);
        }

        info!("Cron service started with {} jobs", state.jobs.len());
        Ok(())
    }

    /// Cancel all timers and wait for them to wind down.
    pub async fn stop(&self) {
        let timers = {
            let mut state = self.state.lock().await;
            if !state.running {
                return;
            }
            state.running = false;
            state.cancel.cancel();
            std::mem::take(&mut state.timers)
        };
        for handle in timers {
            let _ = handle.await;
        }
        info!("Cron service stopped");
    }

    fn spawn_timer(self: &Arc<Self>, job: Job, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            match job.schedule.clone() {
                Schedule::Every { every_ms } => {
                    if every_ms <= 0 {
                        return;
                    }
                    let period = std::time::Duration::from_millis(every_ms as u64);
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(period) => {}
                        }
                        service.fire(&job.id).await;
                    }
                }
                Schedule::Cron { expr } => {
                    let cron = match Cron::new(&expr).parse() {
                        Ok(c) => c,
                        Err(e) => {
                            warn!("Invalid cron expression '{expr}' for job {}: {e}", job.id);
                            return;
                        }
                    };
                    loop {
                        let next = match cron.find_next_occurrence(&Utc::now(), false) {
                            Ok(n) => n,
                            Err(_) => return,
                        };
                        let wait = (next - Utc::now())
                            .to_std()
                            .unwrap_or(std::time::Duration::ZERO);
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(wait) => {}
                        }
                        service.fire(&job.id).await;
                    }
                }
                Schedule::Once { at_ms } => {
                    let now_ms = Utc::now().timestamp_millis();
                    // Past-due one-shots are dropped silently at schedule time.
                    if at_ms <= now_ms {
                        return;
                    }
                    let wait = std::time::Duration::from_millis((at_ms - now_ms) as u64);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    service.fire(&job.id).await;
                }
            }
        })
    }

    /// Run the handler for a due job, re-checking enablement first.
    async fn fire(&self, job_id: &str) {
        let (job, handler) = {
            let state = self.state.lock().await;
            if !state.running {
                return;
            }
            let job = match state.jobs.get(job_id) {
                Some(j) if j.enabled => j.clone(),
                _ => return,
            };
            (job, state.handler.clone())
        };

        let Some(handler) = handler else {
            return;
        };

        info!("Executing cron job: {} ({})", job.name, job.id);
        let name = job.name.clone();
        match handler(job).await {
            Ok(result) => info!("Cron job completed: {name}, result: {result}"),
            Err(e) => warn!("Cron job failed: {name}, error: {e}"),
        }
    }
}

fn load_jobs(store_path: &std::path::Path) -> HashMap<String, Job> {
    let data = match std::fs::read_to_string(store_path) {
        Ok(d) => d,
        Err(_) => return HashMap::new(),
    };
    match serde_json::from_str(&data) {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(
                "Ignoring corrupt cron store {}: {e}",
                store_path.display()
            );
            HashMap::new()
        }
    }
}

fn save_jobs(store_path: &std::path::Path, jobs: &HashMap<String, Job>) -> Result<()> {
    if let Some(parent) = store_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(jobs)?;
    std::fs::write(store_path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> JobHandler {
        Arc::new(move |_job| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(String::new())
            })
        })
    }

    #[tokio::test]
    async fn add_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let service = CronService::new(dir.path().join(".cron/jobs.json"));

        let job = service
            .add_job(
                "ping",
                Schedule::Every { every_ms: 60_000 },
                Payload {
                    message: "ping".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(job.enabled);

        let jobs = service.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "ping");

        assert!(service.remove_job(&job.id).await);
        assert!(!service.remove_job(&job.id).await);
        assert!(service.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn enable_toggles_and_unknown_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let service = CronService::new(dir.path().join("jobs.json"));

        let job = service
            .add_job("j", Schedule::Every { every_ms: 1000 }, Payload::default())
            .await
            .unwrap();

        let updated = service.enable_job(&job.id, false).await.unwrap();
        assert!(!updated.enabled);
        let updated = service.enable_job(&job.id, true).await.unwrap();
        assert!(updated.enabled);
        assert!(service.enable_job("missing", true).await.is_none());
    }

    #[tokio::test]
    async fn store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let service = CronService::new(path.clone());
        let job = service
            .add_job(
                "persist",
                Schedule::Cron {
                    expr: "0 9 * * *".into(),
                },
                Payload {
                    message: "hello".into(),
                    channel: Some("telegram".into()),
                    to: Some("42".into()),
                    deliver: true,
                },
            )
            .await
            .unwrap();

        let reloaded = CronService::new(path);
        let jobs = reloaded.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
        assert_eq!(jobs[0].name, "persist");
        assert_eq!(jobs[0].schedule, job.schedule);
        assert!(jobs[0].enabled);
        assert!(jobs[0].payload.deliver);
        assert_eq!(jobs[0].payload.to.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn corrupt_store_yields_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "{{{not json").unwrap();

        let service = CronService::new(path);
        assert!(service.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = CronService::new(dir.path().join("jobs.json"));
        service.start().await.unwrap();
        assert!(service.start().await.is_err());
        service.stop().await;
    }

    #[tokio::test]
    async fn every_job_fires_repeatedly() {
        let dir = tempfile::tempdir().unwrap();
        let service = CronService::new(dir.path().join("jobs.json"));

        let fired = Arc::new(AtomicUsize::new(0));
        service.set_handler(counting_handler(fired.clone())).await;

        service
            .add_job(
                "ping",
                Schedule::Every { every_ms: 200 },
                Payload {
                    message: "ping".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        service.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
        service.stop().await;

        assert!(fired.load(Ordering::SeqCst) >= 3, "handler fired < 3 times");
        assert_eq!(service.list_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn once_in_future_fires_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let service = CronService::new(dir.path().join("jobs.json"));

        let fired = Arc::new(AtomicUsize::new(0));
        service.set_handler(counting_handler(fired.clone())).await;

        service
            .add_job(
                "soon",
                Schedule::Once {
                    at_ms: Utc::now().timestamp_millis() + 100,
                },
                Payload::default(),
            )
            .await
            .unwrap();

        service.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        service.stop().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn once_in_past_never_fires() {
        let dir = tempfile::tempdir().unwrap();
        let service = CronService::new(dir.path().join("jobs.json"));

        let fired = Arc::new(AtomicUsize::new(0));
        service.set_handler(counting_handler(fired.clone())).await;

        service
            .add_job(
                "stale",
                Schedule::Once {
                    at_ms: Utc::now().timestamp_millis() - 10_000,
                },
                Payload::default(),
            )
            .await
            .unwrap();

        service.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        service.stop().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_job_does_not_fire() {
        let dir = tempfile::tempdir().unwrap();
        let service = CronService::new(dir.path().join("jobs.json"));

        let fired = Arc::new(AtomicUsize::new(0));
        service.set_handler(counting_handler(fired.clone())).await;

        let job = service
            .add_job("off", Schedule::Every { every_ms: 100 }, Payload::default())
            .await
            .unwrap();
        service.enable_job(&job.id, false).await;

        service.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(350)).await;
        service.stop().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let service = CronService::new(dir.path().join("jobs.json"));

        let job = service
            .add_job("a", Schedule::Every { every_ms: 1000 }, Payload::default())
            .await
            .unwrap();
        service
            .add_job("b", Schedule::Every { every_ms: 1000 }, Payload::default())
            .await
            .unwrap();
        service.enable_job(&job.id, false).await;

        let status = service.status().await;
        assert!(!status.running);
        assert_eq!(status.total_jobs, 2);
        assert_eq!(status.enabled_jobs, 1);
        assert!(status.store_path.ends_with("jobs.json"));
    }
}
