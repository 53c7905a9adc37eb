//! Newline-delimited JSON transport: one request object per line, tagged by `op`,
//! answered by one response line. A connection that sent `listen` also receives
//! `{"notice":{...}}` lines in between responses.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::engine::{BookingError, Engine, Proposal};
use crate::limits::{MAX_LISTENS_PER_CONNECTION, MAX_REQUEST_LINE_LEN, NOTICE_QUEUE_LEN};
use crate::model::*;
use crate::notify::{Notice, NotifyHub};
use crate::observability;
use crate::store::{BookingStore, FinancialLedger, StoreError, TenantAdmin};

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Slots {
        tenant: TenantId,
        service_id: ServiceId,
        date: NaiveDate,
    },
    Propose {
        tenant: TenantId,
        service_id: ServiceId,
        start: Timestamp,
        customer_ref: String,
        #[serde(default)]
        confirmed: bool,
    },
    /// Move an appointment; the service stays unless a new one is named.
    Reschedule {
        tenant: TenantId,
        id: AppointmentId,
        start: Timestamp,
        #[serde(default)]
        service_id: Option<ServiceId>,
    },
    Confirm {
        tenant: TenantId,
        id: AppointmentId,
    },
    Complete {
        tenant: TenantId,
        id: AppointmentId,
    },
    Cancel {
        tenant: TenantId,
        id: AppointmentId,
    },
    NoShow {
        tenant: TenantId,
        id: AppointmentId,
    },
    Erase {
        tenant: TenantId,
        id: AppointmentId,
    },
    Get {
        tenant: TenantId,
        id: AppointmentId,
    },
    Day {
        tenant: TenantId,
        date: NaiveDate,
    },
    ManageGet {
        tenant: TenantId,
        token: String,
    },
    ManageCancel {
        tenant: TenantId,
        token: String,
    },
    ManageReschedule {
        tenant: TenantId,
        token: String,
        start: Timestamp,
    },
    SetConfig {
        tenant: TenantId,
        config: BookingConfig,
    },
    /// `weekday` is 0..=6 with Sunday = 0.
    PutWindow {
        tenant: TenantId,
        #[serde(default)]
        id: Option<WindowId>,
        weekday: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        #[serde(default = "yes")]
        active: bool,
    },
    RemoveWindow {
        tenant: TenantId,
        id: WindowId,
    },
    PutService {
        tenant: TenantId,
        #[serde(default)]
        id: Option<ServiceId>,
        name: String,
        duration_minutes: u32,
        price_cents: i64,
        #[serde(default = "yes")]
        active: bool,
    },
    Block {
        tenant: TenantId,
        #[serde(default)]
        id: Option<BlockedPeriodId>,
        start: Timestamp,
        end: Timestamp,
        #[serde(default)]
        reason: Option<String>,
    },
    Unblock {
        tenant: TenantId,
        id: BlockedPeriodId,
    },
    Ledger {
        tenant: TenantId,
    },
    /// Forward the tenant's notices onto this connection.
    Listen {
        tenant: TenantId,
    },
    /// Stop one tenant's notices, or all of them when no tenant is named.
    Unlisten {
        #[serde(default)]
        tenant: Option<TenantId>,
    },
}

/// Wire names of every `Request` variant. Anything else in `op` is a bad request.
pub const OPS: &[&str] = &[
    "ping",
    "slots",
    "propose",
    "reschedule",
    "confirm",
    "complete",
    "cancel",
    "no_show",
    "erase",
    "get",
    "day",
    "manage_get",
    "manage_cancel",
    "manage_reschedule",
    "set_config",
    "put_window",
    "remove_window",
    "put_service",
    "block",
    "unblock",
    "ledger",
    "listen",
    "unlisten",
];

/// Not JSON, or no known `op`: `bad_request`. A known op whose fields do not
/// decode (bad date, bad tenant slug, missing field): `invalid_request`.
pub fn parse_request(line: &str) -> Result<Request, Response> {
    let value: Value = serde_json::from_str(line).map_err(|e| Response::error("bad_request", e.to_string()))?;
    match value.get("op").and_then(Value::as_str) {
        Some(op) if OPS.contains(&op) => {}
        Some(op) => return Err(Response::error("bad_request", format!("unknown op `{op}`"))),
        None => return Err(Response::error("bad_request", "missing op")),
    }
    serde_json::from_value(value).map_err(|e| Response::error("invalid_request", e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"ok":false,"error":{{"code":"internal","message":"encode failed: {e}"}}}}"#)
        })
    }
}

fn engine_err(e: BookingError) -> Response {
    Response::error(e.code(), e.to_string())
}

fn store_err(e: StoreError) -> Response {
    let code = match &e {
        StoreError::NotFound => "not_found",
        StoreError::Invalid(_) => "invalid_request",
        StoreError::LimitExceeded(_) => "limit_exceeded",
        StoreError::Overlap(_) => "slot_taken",
        StoreError::Wal(_) | StoreError::Tenant(_) => "internal",
    };
    Response::error(code, e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(v) => Response::ok(v),
        Err(e) => Response::error("internal", format!("encode failed: {e}")),
    }
}

/// Everything a connection needs: the engine for the booking path, the admin
/// surface for catalog edits, the ledger for income reads and the hub that
/// `listen` subscribes to.
pub struct BookingHandler {
    engine: Arc<Engine>,
    admin: Arc<dyn TenantAdmin>,
    ledger: Arc<dyn FinancialLedger>,
    hub: Arc<NotifyHub>,
}

impl BookingHandler {
    /// The engine dispatches its notices through `hub`.
    pub fn new<S>(store: Arc<S>, hub: Arc<NotifyHub>, clock: Arc<dyn Clock>) -> Self
    where
        S: BookingStore + FinancialLedger + TenantAdmin + 'static,
    {
        Self {
            engine: Arc::new(Engine::with_store(store.clone(), hub.clone(), clock)),
            admin: store.clone(),
            ledger: store,
            hub,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Parse one request line and produce its response line.
    pub async fn handle_line(&self, line: &str) -> String {
        self.respond(line, None).await
    }

    async fn respond(&self, line: &str, listeners: Option<&mut Listeners>) -> String {
        let request = match parse_request(line) {
            Ok(r) => r,
            Err(response) => {
                debug!("unparseable request: {line:.120}");
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "error")
                    .increment(1);
                return response.to_line();
            }
        };
        let op = observability::op_label(&request);
        let started = Instant::now();
        let response = match (request, listeners) {
            (Request::Listen { tenant }, Some(listeners)) => listeners.listen(tenant),
            (Request::Unlisten { tenant }, Some(listeners)) => listeners.unlisten(tenant.as_ref()),
            (request, _) => self.handle(request).await,
        };
        let status = if response.ok { "ok" } else { "error" };
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        response.to_line()
    }

    /// Stateless dispatch. `listen` and `unlisten` need a connection to deliver
    /// to and are only served by `process_connection`.
    pub async fn handle(&self, request: Request) -> Response {
        let engine = &self.engine;
        match request {
            Request::Ping => Response::ok(json!("pong")),
            Request::Listen { .. } | Request::Unlisten { .. } => {
                Response::error("invalid_request", "listen needs a connection")
            }
            Request::Slots {
                tenant,
                service_id,
                date,
            } => match engine.generate_slots(&tenant, service_id, date).await {
                Ok(slots) => Response::ok(json!({ "date": date, "slots": slots.to_vec() })),
                Err(e) => engine_err(e),
            },
            Request::Propose {
                tenant,
                service_id,
                start,
                customer_ref,
                confirmed,
            } => {
                let mut proposal = Proposal::new(service_id, start, customer_ref);
                if confirmed {
                    proposal = proposal.confirmed();
                }
                self.appointment_response(engine.propose_appointment(&tenant, proposal).await)
            }
            Request::Reschedule {
                tenant,
                id,
                start,
                service_id,
            } => {
                let current = match engine.appointment(&tenant, id).await {
                    Ok(a) => a,
                    Err(e) => return engine_err(e),
                };
                let proposal = Proposal::new(
                    service_id.unwrap_or(current.service_id),
                    start,
                    current.customer_ref,
                )
                .rescheduling(id);
                self.appointment_response(engine.propose_appointment(&tenant, proposal).await)
            }
            Request::Confirm { tenant, id } => self.appointment_response(engine.confirm(&tenant, id).await),
            Request::Complete { tenant, id } => self.appointment_response(engine.complete(&tenant, id).await),
            Request::Cancel { tenant, id } => self.appointment_response(engine.cancel(&tenant, id).await),
            Request::NoShow { tenant, id } => {
                self.appointment_response(engine.mark_no_show(&tenant, id).await)
            }
            Request::Erase { tenant, id } => match engine.erase(&tenant, id).await {
                Ok(()) => Response::ok(json!({ "erased": id })),
                Err(e) => engine_err(e),
            },
            Request::Get { tenant, id } => self.appointment_response(engine.appointment(&tenant, id).await),
            Request::Day { tenant, date } => match engine.appointments_on(&tenant, date).await {
                Ok(list) => encode(&list),
                Err(e) => engine_err(e),
            },
            Request::ManageGet { tenant, token } => {
                self.appointment_response(engine.appointment_by_token(&tenant, &token).await)
            }
            Request::ManageCancel { tenant, token } => {
                self.appointment_response(engine.cancel_by_token(&tenant, &token).await)
            }
            Request::ManageReschedule { tenant, token, start } => {
                self.appointment_response(engine.reschedule_by_token(&tenant, &token, start).await)
            }
            Request::SetConfig { tenant, config } => {
                match self.admin.set_booking_config(&tenant, config).await {
                    Ok(()) => encode(&config),
                    Err(e) => store_err(e),
                }
            }
            Request::PutWindow {
                tenant,
                id,
                weekday,
                start_time,
                end_time,
                active,
            } => {
                let Some(weekday) = weekday_from_index(weekday) else {
                    return Response::error("invalid_request", "weekday must be 0..=6 (Sunday = 0)");
                };
                let window = WorkingWindow {
                    id: id.unwrap_or_default(),
                    tenant_id: tenant,
                    weekday,
                    start_time,
                    end_time,
                    active,
                };
                let id = window.id;
                match self.admin.put_working_window(window).await {
                    Ok(()) => Response::ok(json!({ "id": id })),
                    Err(e) => store_err(e),
                }
            }
            Request::RemoveWindow { tenant, id } => {
                match self.admin.remove_working_window(&tenant, id).await {
                    Ok(()) => Response::ok(json!({ "removed": id })),
                    Err(e) => store_err(e),
                }
            }
            Request::PutService {
                tenant,
                id,
                name,
                duration_minutes,
                price_cents,
                active,
            } => {
                let service = Service {
                    id: id.unwrap_or_default(),
                    tenant_id: tenant,
                    name,
                    duration_minutes,
                    price_cents,
                    active,
                };
                let id = service.id;
                match self.admin.put_service(service).await {
                    Ok(()) => Response::ok(json!({ "id": id })),
                    Err(e) => store_err(e),
                }
            }
            Request::Block {
                tenant,
                id,
                start,
                end,
                reason,
            } => {
                let period = BlockedPeriod {
                    id: id.unwrap_or_default(),
                    tenant_id: tenant,
                    start,
                    end,
                    reason,
                };
                let id = period.id;
                match self.admin.add_blocked_period(period).await {
                    Ok(()) => Response::ok(json!({ "id": id })),
                    Err(e) => store_err(e),
                }
            }
            Request::Unblock { tenant, id } => {
                match self.admin.remove_blocked_period(&tenant, id).await {
                    Ok(()) => Response::ok(json!({ "removed": id })),
                    Err(e) => store_err(e),
                }
            }
            Request::Ledger { tenant } => match self.ledger.ledger_entries(&tenant).await {
                Ok(entries) => encode(&entries),
                Err(e) => store_err(e),
            },
        }
    }

    fn appointment_response(&self, result: Result<Appointment, BookingError>) -> Response {
        match result {
            Ok(appt) => encode(&appt),
            Err(e) => engine_err(e),
        }
    }
}

/// A connection's notice subscriptions, one forwarding task per tenant. Dropping
/// it stops every forwarder.
pub struct Listeners {
    hub: Arc<NotifyHub>,
    outbound: mpsc::Sender<Notice>,
    tasks: HashMap<TenantId, JoinHandle<()>>,
}

impl Listeners {
    pub fn new(hub: Arc<NotifyHub>, outbound: mpsc::Sender<Notice>) -> Self {
        Self {
            hub,
            outbound,
            tasks: HashMap::new(),
        }
    }

    /// Subscribes before answering, so every notice committed after the
    /// response is delivered. Listening twice is a no-op.
    pub fn listen(&mut self, tenant: TenantId) -> Response {
        if !self.tasks.contains_key(&tenant) {
            if self.tasks.len() >= MAX_LISTENS_PER_CONNECTION {
                return Response::error("limit_exceeded", "too many listens on this connection");
            }
            let rx = self.hub.subscribe(&tenant);
            let task = tokio::spawn(forward_notices(tenant.clone(), rx, self.outbound.clone()));
            self.tasks.insert(tenant.clone(), task);
        }
        Response::ok(json!({ "listening": tenant }))
    }

    pub fn unlisten(&mut self, tenant: Option<&TenantId>) -> Response {
        let stopped: Vec<JoinHandle<()>> = match tenant {
            Some(tenant) => self.tasks.remove(tenant).into_iter().collect(),
            None => self.tasks.drain().map(|(_, task)| task).collect(),
        };
        for task in &stopped {
            task.abort();
        }
        Response::ok(json!({ "unlistened": stopped.len() }))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

async fn forward_notices(tenant: TenantId, mut rx: broadcast::Receiver<Notice>, outbound: mpsc::Sender<Notice>) {
    loop {
        match rx.recv().await {
            Ok(notice) => {
                if outbound.send(notice).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("listener for {tenant} lagged, {missed} notices dropped");
                metrics::counter!(observability::NOTICES_DROPPED_TOTAL).increment(missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[derive(Serialize)]
struct NoticeLine<'a> {
    notice: &'a Notice,
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Serve one connection until the peer hangs up. An over-long line gets an error
/// response and closes the connection. Notices for listened tenants are written
/// as they arrive, never in the middle of a response.
pub async fn process_connection<S>(stream: S, handler: Arc<BookingHandler>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_REQUEST_LINE_LEN));
    let (notice_tx, mut notices) = mpsc::channel(NOTICE_QUEUE_LEN);
    let mut listeners = Listeners::new(handler.hub.clone(), notice_tx);
    loop {
        tokio::select! {
            frame = framed.next() => {
                let line = match frame {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("request line over {MAX_REQUEST_LINE_LEN} bytes, closing connection");
                        let reply = Response::error("bad_request", "request line too long").to_line();
                        framed.send(reply).await.map_err(codec_err)?;
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(codec_err(e)),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = handler.respond(&line, Some(&mut listeners)).await;
                framed.send(reply).await.map_err(codec_err)?;
            }
            Some(notice) = notices.recv() => {
                match serde_json::to_string(&NoticeLine { notice: &notice }) {
                    Ok(line) => framed.send(line).await.map_err(codec_err)?,
                    Err(e) => warn!("dropping notice for {}: {e}", notice.tenant_id),
                }
            }
        }
    }
    Ok(())
}
