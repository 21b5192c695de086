//! Operator alerts: terminal bell plus a tracing event.
//!
//! Supervisors raise alerts on an unbounded channel so they never block on
//! the terminal; one task drains it.

use std::io::Write;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// Notification record from the scanner.
    Notification(String),
    /// Data link dropped after being connected.
    LinkLost,
    /// Opening the data link failed.
    ReconnectAttempt { attempt: u32 },
    /// Data link opened.
    Connected,
}

pub type AlertSender = mpsc::UnboundedSender<Alert>;
pub type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

pub fn channel() -> (AlertSender, AlertReceiver) {
    mpsc::unbounded_channel()
}

/// Drain alerts until shutdown or until every sender is gone.
pub async fn run(mut alerts: AlertReceiver, bell: bool, cancel: CancellationToken) {
    loop {
        tokio::select! {
            Some(alert) = alerts.recv() => announce(&alert, bell),
            _ = cancel.cancelled() => break,
            else => break,
        }
    }
}

fn announce(alert: &Alert, bell: bool) {
    match alert {
        Alert::Notification(text) => tracing::warn!(notification = %text, "Scanner alert"),
        Alert::LinkLost => tracing::debug!("Alert: data link lost"),
        Alert::ReconnectAttempt { attempt } => {
            tracing::debug!(attempt, "Alert: reconnect attempt")
        }
        Alert::Connected => tracing::debug!("Alert: data link connected"),
    }
    if bell {
        ring_bell();
    }
}

fn ring_bell() {
    let mut stderr = std::io::stderr();
    let _ = stderr.write_all(b"\x07");
    let _ = stderr.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_stops_when_senders_dropped() {
        let (tx, rx) = channel();
        tx.send(Alert::Notification("tracker".into())).unwrap();
        tx.send(Alert::Connected).unwrap();
        drop(tx);
        run(rx, false, CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_tx, rx) = channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        run(rx, false, cancel).await;
    }
}
