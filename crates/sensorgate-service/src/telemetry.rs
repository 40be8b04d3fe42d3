//! Event logging.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sensorgate_core::{EventDispatcher, GatewayEvent};

/// Render telemetry pairs as `key=value` separated by spaces.
pub fn format_telemetry(pairs: &[(String, f64)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={value:.2}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log one gateway event.
pub fn log_event(event: &GatewayEvent) {
    match event {
        GatewayEvent::StateChanged { device_id, state } => {
            info!(device = %device_id, %state, "Device state");
        }
        GatewayEvent::Reading {
            device_id,
            sensor,
            reading,
        } => {
            debug!(
                device = %device_id,
                %sensor,
                "{}",
                format_telemetry(&reading.telemetry())
            );
        }
        GatewayEvent::Error { device_id, message } => {
            warn!(device = %device_id, "{}", message);
        }
        GatewayEvent::UpgradeState {
            device_id,
            state,
            message,
        } => match message {
            Some(message) => info!(device = %device_id, %state, "Upgrade: {}", message),
            None => info!(device = %device_id, %state, "Upgrade"),
        },
        GatewayEvent::UpgradeProgress {
            device_id,
            state,
            fraction,
        } => {
            debug!(device = %device_id, %state, "Upgrade {:.0}%", fraction * 100.0);
        }
        GatewayEvent::UpgradeResumable { device_id, state } => {
            info!(device = %device_id, %state, "Interrupted upgrade found");
        }
        _ => {}
    }
}

/// Log every event until `shutdown` fires.
pub fn spawn_logger(events: Arc<EventDispatcher>, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event logger lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorgate_types::Reading;

    #[test]
    fn test_format_telemetry() {
        let reading = Reading::Humidity {
            temperature: 21.5,
            humidity: 40.0,
        };
        assert_eq!(
            format_telemetry(&reading.telemetry()),
            "temperature=21.50 humidity=40.00"
        );
        assert_eq!(format_telemetry(&[]), "");
    }

    #[tokio::test]
    async fn test_logger_stops_on_shutdown() {
        let events = Arc::new(EventDispatcher::default());
        let shutdown = CancellationToken::new();
        let handle = spawn_logger(events.clone(), shutdown.clone());

        assert_eq!(events.receiver_count(), 1);
        events.send(GatewayEvent::Error {
            device_id: "node-1".into(),
            message: "boom".into(),
        });

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(events.receiver_count(), 0);
    }
}
