use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Booked,
    Rescheduled,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

/// What a customer (or the salon) gets told after a committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub tenant_id: TenantId,
    pub appointment_id: AppointmentId,
    pub customer_ref: String,
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Notice {
    pub fn for_appointment(kind: NoticeKind, appointment: &Appointment) -> Self {
        Self {
            kind,
            tenant_id: appointment.tenant_id.clone(),
            appointment_id: appointment.id,
            customer_ref: appointment.customer_ref.clone(),
            start: appointment.start,
            end: appointment.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Outbound notification channel. Delivery is best effort: the engine logs a
/// failure and moves on, it never undoes the change that triggered it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn dispatch(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// In-process broadcast of notices, one channel per tenant.
pub struct NotifyHub {
    channels: DashMap<TenantId, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a tenant's notices. Creates the channel if needed.
    pub fn subscribe(&self, tenant: &TenantId) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(tenant.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, notice: &Notice) {
        if let Some(sender) = self.channels.get(&notice.tenant_id) {
            let _ = sender.send(notice.clone());
        }
    }

    pub fn remove(&self, tenant: &TenantId) {
        self.channels.remove(tenant);
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn dispatch(&self, notice: &Notice) -> Result<(), NotifyError> {
        self.send(notice);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn notice(tenant: &str) -> Notice {
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        Notice {
            kind: NoticeKind::Booked,
            tenant_id: TenantId::parse(tenant).unwrap(),
            appointment_id: AppointmentId::new(),
            customer_ref: "cust-1".into(),
            start,
            end: start + chrono::Duration::minutes(30),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let n = notice("salon");
        let mut rx = hub.subscribe(&n.tenant_id);
        hub.dispatch(&n).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), n);
    }

    #[tokio::test]
    async fn notices_stay_within_tenant() {
        let hub = NotifyHub::new();
        let mine = notice("mine");
        let mut rx = hub.subscribe(&mine.tenant_id);
        hub.dispatch(&notice("theirs")).await.unwrap();
        hub.dispatch(&mine).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), mine);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        assert!(hub.dispatch(&notice("quiet")).await.is_ok());
        hub.remove(&TenantId::parse("quiet").unwrap());
    }

    #[test]
    fn notice_kind_wire_names() {
        assert_eq!(serde_json::to_string(&NoticeKind::NoShow).unwrap(), "\"no_show\"");
    }
}
