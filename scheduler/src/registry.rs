//! Worker registry: registration with a version gate, heartbeat-based
//! liveness, and least-loaded command dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use factorkeeper_lib::proto::{
    self, COMMAND_HEADER, DATETIME_FORMAT,
};
use factorkeeper_lib::version::MIN_WORKER_VERSION;
use factorkeeper_lib::{ErrorKind, FkResult, NodeVersion};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMethod {
    Get,
    Post,
    Put,
}

/// Transport of coordinator-to-worker commands. A trait so the dispatch
/// policy is testable without sockets.
#[async_trait]
pub trait CommandTransport: Send + Sync + 'static {
    /// Send one command and return the worker's `(code, message)` reply.
    async fn send(
        &self,
        url: &str,
        method: CommandMethod,
        fields: &[(String, String)],
    ) -> FkResult<(ErrorKind, String)>;
}

/// The real transport: form-encoded HTTP with the command header.
#[derive(Debug, Clone, Default)]
pub struct HttpCommandTransport {
    client: reqwest::Client,
}

#[async_trait]
impl CommandTransport for HttpCommandTransport {
    async fn send(
        &self,
        url: &str,
        method: CommandMethod,
        fields: &[(String, String)],
    ) -> FkResult<(ErrorKind, String)> {
        let mut form: Vec<(String, String)> =
            vec![("HEADER".to_string(), COMMAND_HEADER.to_string())];
        form.extend_from_slice(fields);

        let request = match method {
            CommandMethod::Post => self.client.post(url).form(&form),
            CommandMethod::Put => self.client.put(url).form(&form),
            CommandMethod::Get => self.client.get(url).query(fields),
        };

        let body = request
            .send()
            .await
            .map_err(|_| ErrorKind::HttpConnectionFailed)?
            .text()
            .await
            .map_err(|_| ErrorKind::HttpConnectionFailed)?;

        proto::parse_response(&body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    /// Unique per registration; a re-registration replaces the old id.
    pub id: String,
    pub host: String,
    pub port: u16,
    pub cores: u32,
    pub tasks: Vec<String>,
    pub create_time: NaiveDateTime,
    pub update_time: NaiveDateTime,
    receive_time: Instant,
}

impl WorkerInfo {
    pub fn new(host: impl Into<String>, port: u16, cores: u32) -> Self {
        let host = host.into();
        let now = Local::now().naive_local();
        Self {
            id: format!("{}:{}:{}", host, port, now.format(DATETIME_FORMAT)),
            host,
            port,
            cores,
            tasks: Vec::new(),
            create_time: now,
            update_time: now,
            receive_time: Instant::now(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn load(&self) -> f64 {
        self.tasks.len() as f64 / self.cores.max(1) as f64
    }
}

impl std::fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Host: {}", self.host)?;
        writeln!(f, "Port: {}", self.port)?;
        writeln!(f, "Cores: {}", self.cores)?;
        writeln!(f, "Tasks: {:?}", self.tasks)?;
        writeln!(f, "CreateTime: {}", self.create_time.format(DATETIME_FORMAT))?;
        write!(f, "LastUpdateTime: {}", self.update_time.format(DATETIME_FORMAT))
    }
}

pub struct WorkerRegistry {
    workers: Mutex<HashMap<String, WorkerInfo>>,
    transport: Arc<dyn CommandTransport>,
    ack_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(transport: Arc<dyn CommandTransport>, ack_timeout: Duration) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            transport,
            ack_timeout,
        }
    }

    /// Register a worker, replacing any previous registration of the same
    /// address. Workers older than the fleet minimum are turned away.
    pub fn register_worker(
        &self,
        host: &str,
        port: u16,
        cores: u32,
        version: &str,
    ) -> FkResult<()> {
        let version: NodeVersion = version.parse()?;
        if version < MIN_WORKER_VERSION {
            warn!(
                %version,
                min = %MIN_WORKER_VERSION,
                "outdated worker tried to register"
            );
            return Err(ErrorKind::WorkerVersionDeprecated);
        }

        let worker = WorkerInfo::new(host, port, cores);
        let addr = worker.addr();
        let replaced = self
            .workers
            .lock()
            .expect("registry lock")
            .insert(addr.clone(), worker)
            .is_some();
        if replaced {
            info!(worker = addr, "worker restarted, previous registration replaced");
        } else {
            info!(worker = addr, "worker connected");
        }
        Ok(())
    }

    pub fn remove_worker(&self, host: &str, port: u16) {
        let addr = format!("{host}:{port}");
        if self
            .workers
            .lock()
            .expect("registry lock")
            .remove(&addr)
            .is_some()
        {
            info!(worker = addr, "worker disconnected");
        }
    }

    /// Apply a heartbeat. Heartbeats carry the worker's own clock; stale
    /// ones (out-of-order delivery) are ignored.
    pub fn update_worker(
        &self,
        host: &str,
        port: u16,
        tasks: Vec<String>,
        update_time: NaiveDateTime,
    ) -> FkResult<()> {
        let addr = format!("{host}:{port}");
        let mut workers = self.workers.lock().expect("registry lock");
        let worker = workers.get_mut(&addr).ok_or(ErrorKind::WorkerNotExists)?;

        if update_time > worker.update_time {
            worker.update_time = update_time;
            worker.tasks = tasks;
            worker.receive_time = Instant::now();
        }
        Ok(())
    }

    /// Liveness check against the registered entry: the id must still
    /// match (no re-registration in between) and the last heartbeat must
    /// be fresh. A silent worker is evicted on the spot.
    pub fn is_alive(&self, worker: &WorkerInfo) -> bool {
        let addr = worker.addr();
        let mut workers = self.workers.lock().expect("registry lock");
        let Some(current) = workers.get(&addr) else {
            return false;
        };
        if current.id != worker.id {
            return false;
        }
        if current.receive_time.elapsed() > self.ack_timeout {
            workers.remove(&addr);
            info!(worker = addr, "worker evicted after heartbeat timeout");
            return false;
        }
        true
    }

    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let snapshot: Vec<WorkerInfo> = self
            .workers
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect();
        snapshot
            .into_iter()
            .filter(|worker| self.is_alive(worker))
            .collect()
    }

    pub fn is_workers_ready(&self) -> bool {
        !self.workers.lock().expect("registry lock").is_empty()
    }

    /// Send `command` to a worker.
    ///
    /// Unassigned sends rank candidates by load (`tasks / cores`) and walk
    /// them for up to three rounds, skipping dead entries; the first
    /// success wins and the chosen worker is returned. Broadcast fans out
    /// to everyone and ignores individual failures.
    pub async fn send_command(
        &self,
        command: &str,
        method: CommandMethod,
        fields: &[(String, String)],
        worker: Option<&WorkerInfo>,
        broadcast: bool,
    ) -> FkResult<(String, Option<WorkerInfo>)> {
        if broadcast {
            let targets: Vec<WorkerInfo> = self
                .workers
                .lock()
                .expect("registry lock")
                .values()
                .cloned()
                .collect();
            for target in targets {
                let url = command_url(&target, command);
                let _ = self.transport.send(&url, method, fields).await;
            }
            return Ok((String::new(), None));
        }

        if let Some(target) = worker {
            if !self.is_alive(target) {
                return Err(ErrorKind::FailedToSendTaskCommand);
            }
            let url = command_url(target, command);
            let (code, msg) = self
                .transport
                .send(&url, method, fields)
                .await
                .map_err(|_| ErrorKind::FailedToSendTaskCommand)?;
            return match code {
                ErrorKind::Success => Ok((msg, Some(target.clone()))),
                err => Err(err),
            };
        }

        if !self.is_workers_ready() {
            return Err(ErrorKind::NoWorkerToBeAssigned);
        }

        for _round in 0..3 {
            let mut candidates: Vec<WorkerInfo> = self
                .workers
                .lock()
                .expect("registry lock")
                .values()
                .cloned()
                .collect();
            candidates.sort_by(|a, b| {
                a.load()
                    .partial_cmp(&b.load())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            for candidate in candidates {
                if !self.is_alive(&candidate) {
                    continue;
                }
                let url = command_url(&candidate, command);
                match self.transport.send(&url, method, fields).await {
                    Ok((ErrorKind::Success, msg)) => return Ok((msg, Some(candidate))),
                    // the worker looked and found no work: not a dispatch
                    // failure, surface it unchanged
                    Ok((ErrorKind::TaskHasNothingToBeDone, _)) => {
                        return Err(ErrorKind::TaskHasNothingToBeDone)
                    }
                    Ok((err, msg)) => {
                        warn!(worker = candidate.addr(), %err, msg, "command refused");
                    }
                    Err(err) => {
                        warn!(worker = candidate.addr(), %err, "command send failed");
                    }
                }
            }
        }

        Err(ErrorKind::FailedToSendTaskCommand)
    }
}

fn command_url(worker: &WorkerInfo, command: &str) -> String {
    format!("http://{}:{}/{}", worker.host, worker.port, command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Scripted transport: answers per URL-suffix, records every send.
    #[derive(Default)]
    pub struct MockTransport {
        pub refuse_hosts: StdMutex<Vec<String>>,
        pub nothing_to_do: StdMutex<bool>,
        pub calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandTransport for MockTransport {
        async fn send(
            &self,
            url: &str,
            _method: CommandMethod,
            _fields: &[(String, String)],
        ) -> FkResult<(ErrorKind, String)> {
            self.calls.lock().unwrap().push(url.to_string());
            if self
                .refuse_hosts
                .lock()
                .unwrap()
                .iter()
                .any(|host| url.contains(host.as_str()))
            {
                return Err(ErrorKind::HttpConnectionFailed);
            }
            if *self.nothing_to_do.lock().unwrap() {
                return Ok((ErrorKind::TaskHasNothingToBeDone, String::new()));
            }
            Ok((ErrorKind::Success, "ok".to_string()))
        }
    }

    fn registry_with(timeout: Duration) -> (WorkerRegistry, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        (
            WorkerRegistry::new(transport.clone(), timeout),
            transport,
        )
    }

    #[test]
    fn test_register_rejects_old_versions() {
        let (registry, _) = registry_with(Duration::from_secs(30));
        assert_eq!(
            registry.register_worker("h1", 8911, 4, "0.0.1"),
            Err(ErrorKind::WorkerVersionDeprecated)
        );
        assert_eq!(
            registry.register_worker("h1", 8911, 4, "not-a-version"),
            Err(ErrorKind::ParameterMissingOrInvalid)
        );
        assert!(registry
            .register_worker("h1", 8911, 4, &MIN_WORKER_VERSION.to_string())
            .is_ok());
    }

    #[test]
    fn test_heartbeat_monotonicity() {
        let (registry, _) = registry_with(Duration::from_secs(30));
        registry.register_worker("h1", 8911, 4, "0.2.0").unwrap();

        let t1 = Local::now().naive_local() + chrono::Duration::seconds(10);
        let t0 = t1 - chrono::Duration::seconds(5);

        registry
            .update_worker("h1", 8911, vec!["a".into()], t1)
            .unwrap();
        // an older heartbeat arriving late must not regress the state
        registry
            .update_worker("h1", 8911, vec!["stale".into()], t0)
            .unwrap();

        let worker = &registry.list_workers()[0];
        assert_eq!(worker.update_time, t1);
        assert_eq!(worker.tasks, vec!["a".to_string()]);
    }

    #[test]
    fn test_heartbeat_for_unknown_worker() {
        let (registry, _) = registry_with(Duration::from_secs(30));
        assert_eq!(
            registry.update_worker("ghost", 1, vec![], Local::now().naive_local()),
            Err(ErrorKind::WorkerNotExists)
        );
    }

    #[test]
    fn test_silent_worker_evicted() {
        let (registry, _) = registry_with(Duration::from_millis(0));
        registry.register_worker("h1", 8911, 4, "0.2.0").unwrap();

        let worker = {
            let workers = registry.workers.lock().unwrap();
            workers.values().next().unwrap().clone()
        };
        std::thread::sleep(Duration::from_millis(5));
        assert!(!registry.is_alive(&worker));
        assert!(!registry.is_workers_ready());
    }

    #[test]
    fn test_re_registration_invalidates_old_id() {
        let (registry, _) = registry_with(Duration::from_secs(30));
        registry.register_worker("h1", 8911, 4, "0.2.0").unwrap();
        let old = registry.list_workers()[0].clone();

        registry.register_worker("h1", 8911, 4, "0.2.0").unwrap();
        assert!(!registry.is_alive(&old));
    }

    #[tokio::test]
    async fn test_least_loaded_dispatch() {
        let (registry, transport) = registry_with(Duration::from_secs(30));
        registry.register_worker("busy", 1, 1, "0.2.0").unwrap();
        registry.register_worker("idle", 2, 1, "0.2.0").unwrap();

        let now = Local::now().naive_local() + chrono::Duration::seconds(1);
        registry
            .update_worker("busy", 1, vec!["t1".into(), "t2".into()], now)
            .unwrap();
        registry.update_worker("idle", 2, vec![], now).unwrap();

        let (msg, worker) = registry
            .send_command("update_factor", CommandMethod::Post, &[], None, false)
            .await
            .unwrap();
        assert_eq!(msg, "ok");
        assert_eq!(worker.unwrap().host, "idle");

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("http://idle:2/"));
    }

    #[tokio::test]
    async fn test_dispatch_falls_through_refusing_worker() {
        let (registry, transport) = registry_with(Duration::from_secs(30));
        registry.register_worker("dead", 1, 1, "0.2.0").unwrap();
        registry.register_worker("alive", 2, 1, "0.2.0").unwrap();
        transport.refuse_hosts.lock().unwrap().push("dead".into());

        let now = Local::now().naive_local() + chrono::Duration::seconds(1);
        registry.update_worker("dead", 1, vec![], now).unwrap();
        registry
            .update_worker("alive", 2, vec!["t".into()], now)
            .unwrap();

        let (_, worker) = registry
            .send_command("update_factor", CommandMethod::Post, &[], None, false)
            .await
            .unwrap();
        assert_eq!(worker.unwrap().host, "alive");
    }

    #[tokio::test]
    async fn test_dispatch_without_workers() {
        let (registry, _) = registry_with(Duration::from_secs(30));
        assert_eq!(
            registry
                .send_command("update_factor", CommandMethod::Post, &[], None, false)
                .await,
            Err(ErrorKind::NoWorkerToBeAssigned)
        );
    }

    #[tokio::test]
    async fn test_nothing_to_do_passes_through() {
        let (registry, transport) = registry_with(Duration::from_secs(30));
        registry.register_worker("h1", 8911, 4, "0.2.0").unwrap();
        *transport.nothing_to_do.lock().unwrap() = true;

        assert_eq!(
            registry
                .send_command("update_factor", CommandMethod::Post, &[], None, false)
                .await,
            Err(ErrorKind::TaskHasNothingToBeDone)
        );
    }

    #[tokio::test]
    async fn test_broadcast_ignores_failures() {
        let (registry, transport) = registry_with(Duration::from_secs(30));
        registry.register_worker("h1", 1, 1, "0.2.0").unwrap();
        registry.register_worker("h2", 2, 1, "0.2.0").unwrap();
        transport.refuse_hosts.lock().unwrap().push("h1".into());

        registry
            .send_command("stop_all", CommandMethod::Post, &[], None, true)
            .await
            .unwrap();
        assert_eq!(transport.calls.lock().unwrap().len(), 2);
    }
}
