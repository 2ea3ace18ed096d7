//! Client side of the coordinator protocol: registration, heartbeats,
//! frame callbacks and group finish-acks.

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use factorkeeper_lib::proto::{
    self, join_task_ids, CALLBACK_HEADER, DATETIME_FORMAT, DATE_FORMAT, WORKER_HEADER,
};
use factorkeeper_lib::version::CURRENT_VERSION;
use factorkeeper_lib::{ErrorKind, FkResult, ResultFrame};
use factorkeeper_pool::{FinishSink, GroupStatus};
use tracing::{error, info, warn};

pub struct CoordinatorClient {
    base_url: String,
    client: reqwest::Client,
    host: String,
    port: u16,
}

impl CoordinatorClient {
    pub fn new(coordinator_url: &str, host: &str, port: u16) -> Self {
        Self {
            base_url: coordinator_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            host: host.to_string(),
            port,
        }
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> FkResult<(ErrorKind, String)> {
        let url = format!("{}{}", self.base_url, path);
        let body = self
            .client
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|_| ErrorKind::HttpConnectionFailed)?
            .text()
            .await
            .map_err(|_| ErrorKind::HttpConnectionFailed)?;
        proto::parse_response(&body)
    }

    async fn put_form(&self, path: &str, form: &[(String, String)]) -> FkResult<(ErrorKind, String)> {
        let url = format!("{}{}", self.base_url, path);
        let body = self
            .client
            .put(&url)
            .form(form)
            .send()
            .await
            .map_err(|_| ErrorKind::HttpConnectionFailed)?
            .text()
            .await
            .map_err(|_| ErrorKind::HttpConnectionFailed)?;
        proto::parse_response(&body)
    }

    pub async fn register(&self, cores: usize) -> FkResult<()> {
        let form = vec![
            ("HEADER".to_string(), WORKER_HEADER.to_string()),
            ("host".to_string(), self.host.clone()),
            ("port".to_string(), self.port.to_string()),
            ("cores".to_string(), cores.to_string()),
            ("version".to_string(), CURRENT_VERSION.to_string()),
        ];
        let (code, msg) = self
            .post_form("/worker", &form)
            .await
            .map_err(|_| ErrorKind::CannotConnectToNamenode)?;
        match code {
            ErrorKind::Success => Ok(()),
            ErrorKind::WorkerVersionDeprecated => {
                error!(min_version = msg, "this worker is too old for the coordinator");
                Err(ErrorKind::WorkerVersionDeprecated)
            }
            err => Err(err),
        }
    }

    /// Keep trying until the coordinator answers; workers may come up
    /// first.
    pub async fn register_with_retry(&self, cores: usize, retry_delay: std::time::Duration) {
        loop {
            match self.register(cores).await {
                Ok(()) => {
                    info!("registered at {}", self.base_url);
                    return;
                }
                Err(err) => {
                    warn!(%err, "registration failed, retrying");
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    /// One heartbeat carrying the live group ids and this node's clock.
    pub async fn heartbeat(&self, task_ids: &[String]) -> FkResult<()> {
        let form = vec![
            ("HEADER".to_string(), WORKER_HEADER.to_string()),
            ("host".to_string(), self.host.clone()),
            ("port".to_string(), self.port.to_string()),
            ("tasks".to_string(), join_task_ids(task_ids)),
            (
                "update_time".to_string(),
                Local::now()
                    .naive_local()
                    .format(DATETIME_FORMAT)
                    .to_string(),
            ),
        ];
        let (code, _) = self.put_form("/worker", &form).await?;
        match code {
            ErrorKind::Success => Ok(()),
            err => Err(err),
        }
    }

    pub async fn send_factor_frame(
        &self,
        factor: &str,
        version: &str,
        stock_code: &str,
        day: NaiveDate,
        frame: &ResultFrame,
        group_id: &str,
    ) -> FkResult<()> {
        let form = vec![
            ("HEADER".to_string(), CALLBACK_HEADER.to_string()),
            ("factor".to_string(), factor.to_string()),
            ("version".to_string(), version.to_string()),
            ("stock_code".to_string(), stock_code.to_string()),
            ("date".to_string(), day.format(DATE_FORMAT).to_string()),
            ("data_frame".to_string(), frame.to_json()?),
            ("task_id".to_string(), group_id.to_string()),
        ];
        let (code, msg) = self
            .post_form("/worker/call_back/update_factor/update", &form)
            .await?;
        match code {
            ErrorKind::Success => Ok(()),
            err => {
                warn!(%err, msg, "factor frame callback refused");
                Err(err)
            }
        }
    }

    pub async fn send_tick_frame(
        &self,
        stock_code: &str,
        day: NaiveDate,
        frame: &ResultFrame,
        group_id: &str,
    ) -> FkResult<()> {
        let form = vec![
            ("HEADER".to_string(), CALLBACK_HEADER.to_string()),
            ("stock_code".to_string(), stock_code.to_string()),
            ("date".to_string(), day.format(DATE_FORMAT).to_string()),
            ("data_frame".to_string(), frame.to_json()?),
            ("task_id".to_string(), group_id.to_string()),
        ];
        let (code, msg) = self
            .post_form("/worker/call_back/update_tick_data/update", &form)
            .await?;
        match code {
            ErrorKind::Success => Ok(()),
            err => {
                warn!(%err, msg, "tick frame callback refused");
                Err(err)
            }
        }
    }

    pub async fn send_finish_ack(&self, group_id: &str, status: GroupStatus) -> FkResult<()> {
        let form = vec![
            ("HEADER".to_string(), CALLBACK_HEADER.to_string()),
            ("task_id".to_string(), group_id.to_string()),
            ("total".to_string(), status.total.to_string()),
            ("finished".to_string(), status.finished.to_string()),
            ("aborted".to_string(), status.aborted.to_string()),
        ];
        let (code, _) = self.post_form("/worker/call_back/finish", &form).await?;
        match code {
            ErrorKind::Success => Ok(()),
            err => Err(err),
        }
    }
}

#[async_trait]
impl FinishSink for CoordinatorClient {
    async fn finish_ack(&self, group_id: &str, status: GroupStatus) {
        if let Err(err) = self.send_finish_ack(group_id, status).await {
            // a stale ack after stop_all comes back TASK_NOT_EXISTS; that
            // is the coordinator telling us it already moved on
            warn!(group_id, %err, "finish ack not accepted");
        }
    }
}
