//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Networking API surface for external integrations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---

use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use r_tms_core::{HealthReport, ServiceContext};
use r_tms_ingest::{ActiveAlert, DeviceSnapshot};
use r_tms_msg::{ConnectivityStatus, ControlCommand, ProtocolVersion, PublishOutcome, QosLevel};
use r_tms_persistence::{
    AggregateStats, AnomalyRecord, MessageRecord, NewSchedule, PersistenceError, RecordFilter,
    ScheduleEntry, ServiceLogRecord,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const DEFAULT_ANOMALY_LIMIT: usize = 10;
const DEFAULT_MESSAGE_LIMIT: usize = 200;
const DEFAULT_SERVICE_LOG_LIMIT: usize = 30;

/// Shared API state exposed to handlers.
pub struct ApiState {
    context: ServiceContext,
}

impl ApiState {
    pub fn new(context: ServiceContext) -> Self {
        Self { context }
    }

    /// Registry snapshots, plus configured devices not heard from yet.
    fn devices(&self) -> Vec<DeviceSnapshot> {
        let mut devices: BTreeMap<String, DeviceSnapshot> = self
            .context
            .device_snapshots()
            .into_iter()
            .map(|snapshot| (snapshot.device_id.clone(), snapshot))
            .collect();
        for (device_id, location) in &self.context.config.devices {
            devices
                .entry(device_id.clone())
                .or_insert_with(|| DeviceSnapshot {
                    device_id: device_id.clone(),
                    location: Some(location.clone()),
                    connectivity: ConnectivityStatus::Unknown,
                    last_value: None,
                    last_source_timestamp: None,
                    silent_for_secs: None,
                    active_alert: ActiveAlert::None,
                    stopped_by_peer: false,
                });
        }
        devices.into_values().collect()
    }

    async fn send_control(&self, command: &ControlCommand) -> Result<PublishOutcome, ApiError> {
        let topic = self.context.config.topics.control_for(&command.device_id);
        let payload = command
            .to_bytes()
            .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
        self.context
            .link
            .publish(&topic, payload, None)
            .await
            .map_err(|err| {
                warn!(topic = %topic, error = %err, "control publish failed");
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            })
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("context", &self.context)
            .finish()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Every admin route, without the tracing layer.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/devices", get(get_devices))
        .route("/api/messages", get(get_messages))
        .route("/api/anomalies", get(get_anomalies))
        .route("/api/anomalies.csv", get(get_anomalies_csv))
        .route("/api/stats", get(get_stats))
        .route("/api/schedule", get(get_schedules).post(post_schedule))
        .route("/api/control", post(post_control))
        .route("/api/mqttconfig", post(post_mqtt_config))
        .route("/api/service_logs", get(get_service_logs))
        .with_state(state)
}

/// Spawn the admin API.
pub fn spawn_api_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<ApiServer> {
    let router = router(state).layer(TraceLayer::new_for_http());

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let addr = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %addr, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        warn!(error = %err, "store query failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct Ack {
    status: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    time: f64,
    #[serde(flatten)]
    health: HealthReport,
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceQuery {
    device_id: Option<String>,
    limit: Option<usize>,
}

impl DeviceQuery {
    fn filter(self, default_limit: Option<usize>) -> RecordFilter {
        RecordFilter {
            device_id: self.device_id.filter(|id| !id.is_empty()),
            limit: self.limit.or(default_limit),
            ..RecordFilter::default()
        }
    }
}

async fn get_health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let health = state.context.health().await;
    Json(HealthResponse {
        ok: true,
        time: Utc::now().timestamp_millis() as f64 / 1000.0,
        health,
    })
}

async fn get_devices(State(state): State<Arc<ApiState>>) -> Json<Vec<DeviceSnapshot>> {
    Json(state.devices())
}

async fn get_messages(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<DeviceQuery>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    let filter = query.filter(Some(DEFAULT_MESSAGE_LIMIT));
    Ok(Json(state.context.store.messages(&filter)?))
}

async fn get_anomalies(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<AnomalyRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_ANOMALY_LIMIT);
    Ok(Json(state.context.store.recent_anomalies(limit)?))
}

async fn get_anomalies_csv(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_ANOMALY_LIMIT);
    let anomalies = state.context.store.recent_anomalies(limit)?;
    let body = anomalies_csv(&anomalies)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let disposition = format!(
        "attachment; filename=anomalies-{}.csv",
        Utc::now().timestamp()
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

fn anomalies_csv(anomalies: &[AnomalyRecord]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["device_id", "timestamp", "anomaly_type", "message"])?;
    for anomaly in anomalies {
        writer.write_record([
            anomaly.device_id.as_str(),
            &anomaly.timestamp.to_rfc3339(),
            anomaly.kind.as_str(),
            anomaly.message.as_str(),
        ])?;
    }
    let bytes = writer.into_inner().context("failed to flush csv writer")?;
    String::from_utf8(bytes).context("csv output was not utf-8")
}

async fn get_stats(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<DeviceQuery>,
) -> Result<Json<AggregateStats>, ApiError> {
    let filter = query.filter(None);
    Ok(Json(state.context.store.aggregate_stats(&filter)?))
}

async fn get_service_logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ServiceLogRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_SERVICE_LOG_LIMIT);
    Ok(Json(state.context.store.service_logs(limit)?))
}

async fn get_schedules(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<ScheduleEntry>>, ApiError> {
    Ok(Json(state.context.store.schedules()?))
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    device_id: Option<String>,
    action: Option<String>,
    #[serde(default)]
    start_in: f64,
    #[serde(default = "default_schedule_duration")]
    duration: f64,
}

fn default_schedule_duration() -> f64 {
    60.0
}

#[derive(Debug, Serialize)]
struct ScheduleAck {
    status: &'static str,
    message: String,
    schedule: ScheduleEntry,
}

async fn post_schedule(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduleAck>), ApiError> {
    let (device_id, action) = required_target(request.device_id, request.action)?;
    let (start_ts, end_ts) = schedule_window(Utc::now(), request.start_in, request.duration)?;
    let schedule = state.context.store.create_schedule(NewSchedule {
        device_id,
        action,
        start_ts,
        end_ts,
    })?;
    info!(
        schedule = schedule.id,
        device = %schedule.device_id,
        action = %schedule.action,
        start = %schedule.start_ts,
        end = %schedule.end_ts,
        "schedule added"
    );
    Ok((
        StatusCode::CREATED,
        Json(ScheduleAck {
            status: "success",
            message: "Schedule added".to_owned(),
            schedule,
        }),
    ))
}

/// `[now + start_in, now + start_in + duration]`, rejecting offsets chrono cannot represent.
fn schedule_window(
    now: DateTime<Utc>,
    start_in: f64,
    duration: f64,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    if !start_in.is_finite() || !duration.is_finite() || duration < 0.0 {
        return Err(ApiError::bad_request(
            "start_in and duration must be finite, duration >= 0",
        ));
    }
    let start_ts = seconds_offset(start_in).and_then(|offset| now.checked_add_signed(offset));
    let end_ts = start_ts.and_then(|start| {
        seconds_offset(duration).and_then(|offset| start.checked_add_signed(offset))
    });
    match (start_ts, end_ts) {
        (Some(start_ts), Some(end_ts)) => Ok((start_ts, end_ts)),
        _ => Err(ApiError::bad_request("start_in or duration out of range")),
    }
}

fn seconds_offset(seconds: f64) -> Option<ChronoDuration> {
    let millis = (seconds * 1000.0).round();
    if millis.abs() >= i64::MAX as f64 {
        return None;
    }
    ChronoDuration::try_milliseconds(millis as i64)
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    device_id: Option<String>,
    action: Option<String>,
    version: Option<u8>,
    qos: Option<u8>,
}

async fn post_control(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ControlRequest>,
) -> Result<Json<Ack>, ApiError> {
    let (device_id, action) = required_target(request.device_id, request.action)?;
    let mut command = ControlCommand::new(device_id, action);
    command.version = request.version.map(ProtocolVersion::from_number);
    command.qos = request.qos.map(QosLevel::from_number);
    let outcome = state.send_control(&command).await?;
    info!(device = %command.device_id, action = %command.action, ?outcome, "control command sent");
    Ok(Json(Ack {
        status: "success",
        message: format!("Control command sent to {}", command.device_id),
    }))
}

#[derive(Debug, Deserialize)]
struct MqttConfigRequest {
    version: Option<u8>,
    qos: Option<u8>,
}

#[derive(Debug, Serialize)]
struct MqttConfigAck {
    status: &'static str,
    message: String,
    version: u8,
    qos: u8,
}

async fn post_mqtt_config(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<MqttConfigRequest>,
) -> Result<(StatusCode, Json<MqttConfigAck>), ApiError> {
    let (Some(version), Some(qos)) = (request.version, request.qos) else {
        return Err(ApiError::bad_request("Missing version or qos"));
    };
    let version = ProtocolVersion::from_number(version);
    let qos = QosLevel::from_number(qos);
    let (status, label, message) = match state.context.link.reconfigure(version, qos).await {
        Ok(()) => (StatusCode::OK, "success", "MQTT configuration updated".to_owned()),
        Err(err) => (
            StatusCode::ACCEPTED,
            "pending",
            format!("settings stored; broker session not rebuilt yet: {err}"),
        ),
    };
    info!(version = %version, qos = %qos, status = label, "broker settings changed");
    Ok((
        status,
        Json(MqttConfigAck {
            status: label,
            message,
            version: version.as_number(),
            qos: qos.as_number(),
        }),
    ))
}

fn required_target(
    device_id: Option<String>,
    action: Option<String>,
) -> Result<(String, String), ApiError> {
    match (device_id, action) {
        (Some(device_id), Some(action)) if !device_id.trim().is_empty() && !action.trim().is_empty() => {
            Ok((device_id, action))
        }
        _ => Err(ApiError::bad_request("Missing device_id or action")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_tms_persistence::AnomalyKind;

    #[test]
    fn csv_export_quotes_messages() {
        let rows = vec![AnomalyRecord::new(
            "dev001",
            AnomalyKind::Wild,
            "value 75.0 outside [0, 50], held",
        )];
        let csv = anomalies_csv(&rows).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("device_id,timestamp,anomaly_type,message"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("dev001,"));
        assert!(row.ends_with(",WILD,\"value 75.0 outside [0, 50], held\""));
    }

    #[test]
    fn schedule_window_rejects_unrepresentable_offsets() {
        let now = Utc::now();
        assert!(schedule_window(now, 1e16, 60.0).is_err());
        assert!(schedule_window(now, -1e16, 60.0).is_err());
        assert!(schedule_window(now, 0.0, 1e300).is_err());
        assert!(schedule_window(now, f64::NAN, 60.0).is_err());

        let (start, end) = schedule_window(now, 1.5, 60.0).unwrap();
        assert_eq!(start - now, ChronoDuration::milliseconds(1500));
        assert_eq!(end - start, ChronoDuration::seconds(60));
    }

    #[test]
    fn blank_targets_are_rejected() {
        assert!(required_target(Some(" ".into()), Some("pause".into())).is_err());
        assert!(required_target(Some("dev001".into()), None).is_err());
        assert!(required_target(Some("dev001".into()), Some("pause".into())).is_ok());
    }
}
