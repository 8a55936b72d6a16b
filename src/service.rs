//! # Recorder Service
//!
//! Runs the session controller on a dedicated thread with its own Tokio
//! runtime so BLE work never blocks the UI thread.
//!
//! The UI talks to the service through two channels: `Intent`s in, and
//! `PresentationEvent`s out. Intents are drained between ticks, so user actions
//! and timer-driven work are applied one at a time to the same controller.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::ble::BtleplugTransport;
use crate::config::Config;
use crate::controller::{PresentationEvent, SessionController};
use crate::error::RecorderError;
use crate::transport::BleTransport;

/// User actions sent from the UI thread
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Scan,
    SetDeviceType(String),
    SelectDevice(String),
    Connect(String),
    StartRecording { subject_id: String, interval_secs: u64 },
    StopRecording,
    Shutdown,
}

pub struct RecorderService {
    config: Config,
    intents: Receiver<Intent>,
    events: Sender<PresentationEvent>,
}

impl RecorderService {
    /// Returns the service and the sender the UI issues intents through
    pub fn new(config: Config, events: Sender<PresentationEvent>) -> (Self, Sender<Intent>) {
        let (intent_tx, intent_rx) = unbounded();
        let service = RecorderService {
            config,
            intents: intent_rx,
            events,
        };
        (service, intent_tx)
    }

    /// Blocks until a `Shutdown` intent arrives or the intent channel closes.
    /// Call from a spawned thread.
    pub fn run(self) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                log::error!("Failed to create async runtime: {}", e);
                let _ = self.events.send(PresentationEvent::Status(format!(
                    "Error: Failed to create async runtime: {}",
                    e
                )));
                return;
            }
        };

        rt.block_on(async move {
            let transport = match BtleplugTransport::new().await {
                Ok(transport) => transport,
                Err(e) => {
                    log::error!("{}", e);
                    let _ = self
                        .events
                        .send(PresentationEvent::Status(format!("Error: {}", e)));
                    return;
                }
            };

            let tick = self.config.tick_interval();
            let controller = SessionController::new(Arc::new(transport), self.config, self.events);
            drive(controller, self.intents, tick).await;
        });

        log::info!("Recorder service: shut down");
    }
}

/// Main loop: drain pending intents, then tick. Returns the disposed
/// controller once shutdown is requested.
pub async fn drive<T: BleTransport>(
    mut controller: SessionController<T>,
    intents: Receiver<Intent>,
    tick: Duration,
) -> SessionController<T> {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        loop {
            match intents.try_recv() {
                Ok(Intent::Shutdown) => {
                    log::info!("Recorder service: shutdown requested");
                    controller.dispose().await;
                    return controller;
                }
                Ok(intent) => handle_intent(&mut controller, intent).await,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::info!("Recorder service: intent channel closed");
                    controller.dispose().await;
                    return controller;
                }
            }
        }

        controller.tick().await;
    }
}

async fn handle_intent<T: BleTransport>(controller: &mut SessionController<T>, intent: Intent) {
    log::debug!("Intent: {:?}", intent);
    let result = match intent {
        Intent::Scan => controller.scan().await.map(|_| ()),
        Intent::SetDeviceType(device_type) => {
            controller.set_device_type(device_type);
            Ok(())
        }
        Intent::SelectDevice(address) => {
            controller.select_device(&address);
            Ok(())
        }
        Intent::Connect(address) => controller.connect(&address).await,
        Intent::StartRecording {
            subject_id,
            interval_secs,
        } => controller
            .start_recording(&subject_id, Duration::from_secs(interval_secs))
            .await
            .map(|_| ()),
        Intent::StopRecording => controller.stop_recording().await.map(|_| ()),
        Intent::Shutdown => Ok(()),
    };

    match result {
        Ok(()) => {}
        Err(e @ RecorderError::InvalidState { .. }) => log::warn!("Ignoring intent: {}", e),
        Err(e) => log::debug!("Intent failed: {}", e),
    }
}
