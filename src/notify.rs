use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::model::{ReservationRequest, Renter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    User(Ulid),
    /// Guest renters are reached by phone.
    Phone(String),
}

impl Recipient {
    pub fn renter_of(req: &ReservationRequest) -> Self {
        match &req.renter {
            Renter::Registered { user_id } => Recipient::User(*user_id),
            Renter::Guest { phone, .. } => Recipient::Phone(phone.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    RequestSubmitted,
    RequestConfirmed,
    RequestDeclined,
    RequestCancelled,
    RequestExpired,
}

impl NotificationKind {
    pub fn template(self) -> &'static str {
        match self {
            NotificationKind::RequestSubmitted => "reservation_submitted",
            NotificationKind::RequestConfirmed => "reservation_confirmed",
            NotificationKind::RequestDeclined => "reservation_declined",
            NotificationKind::RequestCancelled => "reservation_cancelled",
            NotificationKind::RequestExpired => "reservation_expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn about(kind: NotificationKind, recipient: Recipient, req: &ReservationRequest) -> Self {
        Self {
            recipient,
            kind,
            payload: json!({
                "request_id": req.id.to_string(),
                "listing_id": req.listing_id.to_string(),
                "start_date": req.range.start.to_string(),
                "end_date": req.range.end.to_string(),
                "status": req.status.as_str(),
                "owner_response": req.owner_response,
            }),
        }
    }
}

#[derive(Debug)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Delivery backend (SMS gateway, push, e-mail...). Best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Default backend: writes the notification to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = ?n.recipient,
            template = n.kind.template(),
            payload = %n.payload,
            "notification"
        );
        Ok(())
    }
}

/// Outbox for committed transitions. Enqueue never blocks and never fails
/// the caller; a closed dispatcher only costs the notification.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, notification: Notification) {
        if let Err(e) = self.tx.send(notification) {
            tracing::warn!(template = e.0.kind.template(), "outbox closed, dropping notification");
        }
    }
}

/// Drain the outbox into `notifier` until every `Outbox` handle is dropped.
pub async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    notifier: Arc<dyn Notifier>,
) {
    while let Some(n) = rx.recv().await {
        match notifier.notify(&n).await {
            Ok(()) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "outcome" => "sent")
                    .increment(1);
            }
            Err(e) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "outcome" => "failed")
                    .increment(1);
                tracing::warn!(recipient = ?n.recipient, template = n.kind.template(), "{e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::model::{DateRange, RequestStatus};

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Notification>>,
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(NotifyError("gateway down".into()));
            }
            self.seen.lock().unwrap().push(n.clone());
            Ok(())
        }
    }

    fn request() -> ReservationRequest {
        ReservationRequest {
            id: Ulid::new(),
            listing_id: Ulid::new(),
            range: DateRange::new(
                "2026-06-01".parse().unwrap(),
                "2026-06-05".parse().unwrap(),
            ),
            renter: Renter::Guest {
                name: "Sam".into(),
                phone: "+15550199".into(),
                cancel_token: "0123456789abcdef".into(),
            },
            status: RequestStatus::Confirmed,
            expires_at: 0,
            owner_response: Some("see you monday".into()),
            responded_at: Some(0),
            created_at: 0,
            block_id: None,
        }
    }

    #[test]
    fn guest_renter_is_reached_by_phone() {
        assert_eq!(
            Recipient::renter_of(&request()),
            Recipient::Phone("+15550199".into())
        );
    }

    #[test]
    fn payload_carries_request_fields() {
        let req = request();
        let n = Notification::about(
            NotificationKind::RequestConfirmed,
            Recipient::renter_of(&req),
            &req,
        );
        assert_eq!(n.payload["status"], "CONFIRMED");
        assert_eq!(n.payload["start_date"], "2026-06-01");
        assert_eq!(n.payload["request_id"], req.id.to_string());
        assert!(n.payload.get("cancel_token").is_none());
    }

    #[tokio::test]
    async fn dispatcher_survives_failures() {
        let notifier = Arc::new(Recording {
            fail_first: true,
            ..Default::default()
        });
        let (outbox, rx) = Outbox::channel();
        let task = tokio::spawn(run_dispatcher(rx, notifier.clone()));

        let req = request();
        for kind in [NotificationKind::RequestConfirmed, NotificationKind::RequestCancelled] {
            outbox.enqueue(Notification::about(kind, Recipient::renter_of(&req), &req));
        }
        drop(outbox);
        task.await.unwrap();

        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
        let seen = notifier.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, NotificationKind::RequestCancelled);
    }

    #[test]
    fn enqueue_after_dispatcher_gone_is_noop() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);
        let req = request();
        // Must not panic
        outbox.enqueue(Notification::about(
            NotificationKind::RequestExpired,
            Recipient::renter_of(&req),
            &req,
        ));
    }
}
