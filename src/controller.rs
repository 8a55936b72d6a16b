//! # Session Controller
//!
//! Owns the recording session and mediates between the device directory, the
//! BLE transport and the sample sink.
//!
//! ## States
//! ```text
//! Idle ──scan──> Scanning ──done──> Idle
//! Idle ──connect──> Connecting ──ok──> Connected ──start──> Recording
//!                   Connecting ──3 failures──> Idle
//! Recording ──disconnect / watchdog──> Stalled ──reconnected──> Recording
//! Recording|Stalled ──stop──> Stopping ──> Connected|Idle
//! ```
//!
//! ## Tick Order
//! Everything time-driven happens in `tick`, always in the same order:
//! reconnect outcome, link events (samples, disconnects), watchdog, periodic
//! flush, battery poll. No two of them ever touch the session concurrently.
//!
//! ## Link Recovery
//! A stall never ends the session. The reconnect loop runs as its own task,
//! retries forever at a fixed interval and checks a stop flag between attempts;
//! a successful attempt is handed back through a channel and adopted on the
//! next tick, or by `stop_recording` if the stop comes first. At most one loop
//! exists at a time.
//!
//! ## Unsaved Sessions
//! A session whose final write failed keeps its sink. The sink is retried on
//! every periodic flush and once more on dispose until it reaches disk.

use chrono::Local;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::directory::{DeviceDirectory, DeviceListing};
use crate::error::{RecorderError, TransportError};
use crate::heart_rate::parse_battery_level;
use crate::sampling::{Decimator, Sample};
use crate::sink::{SampleSink, Session};
use crate::transport::{BleTransport, DeviceDescriptor, LinkEvent, LinkEvents, BATTERY_LEVEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Recording,
    Stalled,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Updates for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum PresentationEvent {
    Status(String),
    Battery(Option<u8>),
    Badge(ConnectionState),
    State(SessionState),
    Devices(Vec<DeviceListing>),
    /// Raw sample for the live plot, x in seconds since session start
    PlotAppend { x: f64, y: u16 },
    RecordingFile(PathBuf),
}

struct Link<H> {
    id: u64,
    device: DeviceDescriptor,
    handle: H,
}

struct ActiveSession {
    session: Session,
    sink: SampleSink,
    decimator: Decimator,
}

struct ReconnectTask<H> {
    link: u64,
    should_stop: Arc<AtomicBool>,
    outcome: Receiver<H>,
    _task: JoinHandle<()>,
}

pub struct SessionController<T: BleTransport> {
    transport: Arc<T>,
    config: Config,
    state: SessionState,
    connection: ConnectionState,
    directory: DeviceDirectory,
    device_type: String,
    selected: Option<DeviceDescriptor>,
    link: Option<Link<T::Handle>>,
    next_link_id: u64,
    link_tx: Sender<LinkEvent>,
    link_rx: Receiver<LinkEvent>,
    events: Sender<PresentationEvent>,
    recording: Option<ActiveSession>,
    /// Stopped sessions whose final write failed
    unsaved: Vec<SampleSink>,
    reconnect: Option<ReconnectTask<T::Handle>>,
    last_ingest: Instant,
    last_flush: Instant,
    last_battery_poll: Option<Instant>,
    battery: Option<u8>,
}

impl<T: BleTransport> SessionController<T> {
    pub fn new(transport: Arc<T>, config: Config, events: Sender<PresentationEvent>) -> Self {
        let (link_tx, link_rx) = unbounded();
        let now = Instant::now();
        Self {
            transport,
            device_type: config.device_type.clone(),
            config,
            state: SessionState::Idle,
            connection: ConnectionState::Disconnected,
            directory: DeviceDirectory::new(),
            selected: None,
            link: None,
            next_link_id: 0,
            link_tx,
            link_rx,
            events,
            recording: None,
            unsaved: Vec::new(),
            reconnect: None,
            last_ingest: now,
            last_flush: now,
            last_battery_poll: None,
            battery: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn battery(&self) -> Option<u8> {
        self.battery
    }

    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    pub fn selected(&self) -> Option<&DeviceDescriptor> {
        self.selected.as_ref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.recording.as_ref().map(|active| &active.session)
    }

    pub fn reconnect_in_flight(&self) -> bool {
        self.reconnect.is_some()
    }

    // ── Presentation helpers ────────────────────────────────────────────

    fn emit(&self, event: PresentationEvent) {
        // The UI may already be gone during shutdown
        let _ = self.events.send(event);
    }

    fn status(&self, text: impl Into<String>) {
        let text = text.into();
        log::info!("Status: {}", text);
        self.emit(PresentationEvent::Status(text));
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(PresentationEvent::State(state));
        }
    }

    fn set_connection(&mut self, connection: ConnectionState) {
        if self.connection != connection {
            self.connection = connection;
            self.emit(PresentationEvent::Badge(connection));
        }
    }

    fn emit_listings(&self) {
        self.emit(PresentationEvent::Devices(self.directory.listings(&self.device_type)));
    }

    fn reset_battery(&mut self) {
        self.battery = None;
        self.last_battery_poll = None;
        self.emit(PresentationEvent::Battery(None));
    }

    fn allocate_link_id(&mut self) -> u64 {
        self.next_link_id += 1;
        self.next_link_id
    }

    fn current_link_id(&self) -> Option<u64> {
        self.link.as_ref().map(|link| link.id)
    }

    // ── Discovery ───────────────────────────────────────────────────────

    /// Scan and publish the filtered device list, returning how many matched
    pub async fn scan(&mut self) -> Result<usize, RecorderError> {
        if self.state != SessionState::Idle {
            return Err(RecorderError::InvalidState {
                action: "scan",
                state: self.state,
            });
        }

        self.set_state(SessionState::Scanning);
        self.status("Scanning for devices...");
        let result = self
            .directory
            .discover(&*self.transport, self.config.scan_timeout())
            .await
            .map(|_| ());
        self.set_state(SessionState::Idle);

        match result {
            Ok(()) => {
                let listings = self.directory.listings(&self.device_type);
                let found = listings.len();
                self.emit(PresentationEvent::Devices(listings));
                self.status(format!(
                    "Found {} devices matching '{}'",
                    found, self.device_type
                ));
                Ok(found)
            }
            Err(e) => {
                let err = RecorderError::Scan(e);
                log::error!("{}", err);
                self.status(err.to_string());
                Err(err)
            }
        }
    }

    pub fn set_device_type(&mut self, device_type: impl Into<String>) {
        self.device_type = device_type.into();
        log::info!("Selected device type: {}", self.device_type);
        self.emit_listings();
    }

    /// Remember a discovered device as the connect target
    pub fn select_device(&mut self, address: &str) -> bool {
        let Some(device) = self.directory.get(address).cloned() else {
            self.status("Select a device from the list first");
            return false;
        };

        let busy_flag = if self.directory.is_busy(&device.address) {
            " (busy locally)"
        } else {
            ""
        };
        self.status(format!("Selected {} ({}){}", device.name, device.address, busy_flag));
        self.selected = Some(device);
        true
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    /// Connect with the fixed-backoff retry policy
    pub async fn connect(&mut self, address: &str) -> Result<(), RecorderError> {
        if self.directory.is_busy(address) {
            let err = RecorderError::DeviceBusy(address.to_string());
            self.status(err.to_string());
            return Err(err);
        }
        if !matches!(self.state, SessionState::Idle | SessionState::Scanning) {
            return Err(RecorderError::InvalidState {
                action: "connect",
                state: self.state,
            });
        }

        self.set_state(SessionState::Connecting);
        self.set_connection(ConnectionState::Connecting);

        let device = match self.directory.get(address).cloned() {
            Some(device) => device,
            None => {
                let resolved = self
                    .directory
                    .resolve_by_address(&*self.transport, address, self.config.resolve_timeout())
                    .await;
                match resolved {
                    Ok(Some(device)) => device,
                    Ok(None) => {
                        return Err(self.connect_aborted(RecorderError::DeviceNotFound(
                            address.to_string(),
                        )))
                    }
                    Err(e) => {
                        log::warn!("Resolving {} failed: {}", address, e);
                        return Err(self.connect_aborted(RecorderError::DeviceNotFound(
                            address.to_string(),
                        )));
                    }
                }
            }
        };

        self.status(format!("Connecting to {} ({})...", device.name, device.address));

        let attempts = self.config.connect_attempts.max(1);
        let mut attempt = 1;
        let reason = loop {
            match self.transport.connect(&device).await {
                Ok(handle) => {
                    self.link_established(device, handle).await;
                    return Ok(());
                }
                Err(e) if attempt >= attempts => break e,
                Err(e) => {
                    log::warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        device.address,
                        e
                    );
                    tokio::time::sleep(self.config.connect_backoff()).await;
                    attempt += 1;
                }
            }
        };

        let err = RecorderError::ConnectFailed {
            address: device.address.clone(),
            attempts,
            reason,
        };
        log::error!("{}", err);
        Err(self.connect_aborted(err))
    }

    fn connect_aborted(&mut self, err: RecorderError) -> RecorderError {
        self.set_connection(ConnectionState::Disconnected);
        self.set_state(SessionState::Idle);
        self.status(format!("Error: {}", err));
        err
    }

    async fn link_established(&mut self, device: DeviceDescriptor, handle: T::Handle) {
        let id = self.allocate_link_id();
        let events = LinkEvents::new(id, self.link_tx.clone());
        if let Err(e) = self.transport.on_unsolicited_disconnect(&handle, events).await {
            log::warn!("Disconnect notifications unavailable for {}: {}", device.address, e);
        }

        self.directory.claim(&device.address);
        self.status(format!("Connected to: {} ({})", device.name, device.address));
        self.link = Some(Link { id, device, handle });
        self.last_battery_poll = None;
        self.set_connection(ConnectionState::Connected);
        self.set_state(SessionState::Connected);
        self.emit_listings();
    }

    /// Forget the current link and free its address
    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            self.directory.release(&link.device.address);
        }
        self.reset_battery();
        self.emit_listings();
    }

    // ── Recording ───────────────────────────────────────────────────────

    /// Open a session file and start the heart rate stream
    pub async fn start_recording(
        &mut self,
        subject_id: &str,
        sampling_interval: Duration,
    ) -> Result<PathBuf, RecorderError> {
        let Some(link) = self
            .link
            .as_ref()
            .filter(|_| self.connection == ConnectionState::Connected)
        else {
            self.status("Error: Not connected to device.");
            return Err(RecorderError::NotConnected);
        };
        if self.state != SessionState::Connected {
            return Err(RecorderError::InvalidState {
                action: "start recording",
                state: self.state,
            });
        }

        let sampling_interval = sampling_interval.max(Duration::from_secs(1));
        let link_id = link.id;
        let handle = link.handle.clone();
        let session = Session::new(
            subject_id,
            sampling_interval,
            Some(link.device.name.clone()),
            Some(link.device.address.clone()),
            Local::now(),
        );

        let sink = match SampleSink::open(&self.config.output_dir, &session) {
            Ok(sink) => sink,
            Err(e) => {
                let err = RecorderError::Persist(e);
                log::error!("{}", err);
                self.status(format!("Error: {}", err));
                return Err(err);
            }
        };
        let path = sink.path().to_path_buf();

        self.recording = Some(ActiveSession {
            session,
            sink,
            decimator: Decimator::new(sampling_interval),
        });
        let now = Instant::now();
        self.last_ingest = now;
        self.last_flush = now;
        self.set_state(SessionState::Recording);
        self.emit(PresentationEvent::RecordingFile(path.clone()));
        self.status(format!("Recording to: {}", path.display()));

        let events = LinkEvents::new(link_id, self.link_tx.clone());
        if let Err(e) = self.transport.subscribe_heart_rate(&handle, events).await {
            log::warn!("Could not start heart rate stream: {}", e);
            self.enter_stalled("heart rate stream could not be started");
        }

        Ok(path)
    }

    /// Stop the session: unsubscribe, final flush, then settle on what the
    /// transport says about the link
    pub async fn stop_recording(&mut self) -> Result<PathBuf, RecorderError> {
        if !matches!(self.state, SessionState::Recording | SessionState::Stalled) {
            return Err(RecorderError::InvalidState {
                action: "stop recording",
                state: self.state,
            });
        }

        self.set_state(SessionState::Stopping);
        self.status("Recording Stopped. Saving...");

        if let Some(task) = self.reconnect.take() {
            log::info!("Cancelling reconnect loop");
            task.should_stop.store(true, Ordering::Relaxed);
            // The loop may have finished since the last tick; its link is live
            // and its disconnect watcher reports under the new id
            if let Ok(handle) = task.outcome.try_recv() {
                log::info!("Adopting link restored before stop");
                if let Some(link) = self.link.as_mut() {
                    link.id = task.link;
                    link.handle = handle;
                }
            }
        }

        let handle = self.link.as_ref().map(|link| link.handle.clone());
        if let Some(handle) = &handle {
            if let Err(e) = self.transport.unsubscribe_heart_rate(handle).await {
                log::warn!("{}", RecorderError::StreamStopFailed(e));
            }
        }

        let mut saved = None;
        let mut save_failed = None;
        if let Some(mut active) = self.recording.take() {
            let path = active.sink.path().to_path_buf();
            match active.sink.close() {
                Ok(written) => {
                    log::info!(
                        "Session saved: {} ({} records, {} flushed on close)",
                        path.display(),
                        active.session.records.len(),
                        written
                    );
                    self.status(format!("Saved: {}", path.display()));
                }
                Err(e) => {
                    log::error!(
                        "Final flush failed, {} samples kept for retry: {}",
                        active.sink.pending(),
                        e
                    );
                    self.status(format!("Error: {}", e));
                    self.unsaved.push(active.sink);
                    save_failed = Some(e);
                }
            }
            saved = Some(path);
        }

        let still_connected = match &handle {
            Some(handle) => self.transport.is_connected(handle).await,
            None => false,
        };
        if still_connected {
            self.set_connection(ConnectionState::Connected);
            self.set_state(SessionState::Connected);
        } else {
            self.drop_link();
            self.set_connection(ConnectionState::Disconnected);
            self.set_state(SessionState::Idle);
        }

        if let Some(e) = save_failed {
            return Err(RecorderError::Persist(e));
        }
        saved.ok_or(RecorderError::InvalidState {
            action: "stop recording",
            state: self.state,
        })
    }

    /// Shut down: stop any recording and release the link
    pub async fn dispose(&mut self) {
        if matches!(self.state, SessionState::Recording | SessionState::Stalled) {
            if let Err(e) = self.stop_recording().await {
                log::warn!("Stop on shutdown failed: {}", e);
            }
        }
        self.retry_unsaved();
        for sink in &self.unsaved {
            log::error!(
                "Shutting down with {} samples not saved to {}",
                sink.pending(),
                sink.path().display()
            );
        }
        if let Some(link) = self.link.take() {
            if let Err(e) = self.transport.disconnect(&link.handle).await {
                log::warn!("Disconnect on shutdown failed: {}", e);
            }
            self.directory.release(&link.device.address);
        }
        self.set_connection(ConnectionState::Disconnected);
        self.set_state(SessionState::Idle);
        log::info!("Session controller disposed");
    }

    // ── Periodic work ───────────────────────────────────────────────────

    pub async fn tick(&mut self) {
        self.poll_reconnect();
        self.drain_link_events();
        self.check_watchdog();
        self.flush_if_due();
        self.poll_battery_if_due().await;
    }

    fn drain_link_events(&mut self) {
        loop {
            let event = match self.link_rx.try_recv() {
                Ok(event) => event,
                Err(_) => break,
            };
            match event {
                LinkEvent::Sample { link, sample } => self.ingest(link, sample),
                LinkEvent::Disconnected { link } => self.handle_disconnect(link),
                LinkEvent::ReconnectAttempt { link, attempt } => {
                    if self.reconnect.as_ref().map(|task| task.link) == Some(link) {
                        self.status(format!(
                            "Connection lost, reconnecting (attempt {})...",
                            attempt
                        ));
                    }
                }
            }
        }
    }

    fn ingest(&mut self, link: u64, sample: Sample) {
        if self.current_link_id() != Some(link)
            || self.connection != ConnectionState::Connected
            || self.state != SessionState::Recording
        {
            log::debug!("Discarding sample from link {} in {:?}", link, self.state);
            return;
        }
        let Some(active) = self.recording.as_mut() else {
            return;
        };

        self.last_ingest = Instant::now();
        let x = (sample.timestamp - active.session.start_time).num_milliseconds() as f64 / 1000.0;
        if active.decimator.offer(&sample) {
            active.session.records.push(sample);
            active.sink.append(&[sample]);
            log::debug!("Accepted sample {} bpm", sample.heart_rate);
        }
        self.emit(PresentationEvent::PlotAppend {
            x,
            y: sample.heart_rate,
        });
    }

    fn handle_disconnect(&mut self, link: u64) {
        if self.current_link_id() != Some(link) {
            log::debug!("Ignoring disconnect from stale link {}", link);
            return;
        }
        match self.state {
            SessionState::Recording => self.enter_stalled("device disconnected"),
            SessionState::Connected => {
                log::info!("Device disconnected while idle");
                self.drop_link();
                self.set_connection(ConnectionState::Disconnected);
                self.set_state(SessionState::Idle);
                self.status("Device disconnected");
            }
            _ => log::debug!("Disconnect in {:?} needs no action", self.state),
        }
    }

    /// Watchdog for links that die without a disconnect event
    fn check_watchdog(&mut self) {
        if self.state != SessionState::Recording {
            return;
        }
        // Counted from the last ingested sample, not the last recorded one, so
        // a sampling interval longer than the threshold never trips it
        let silent_for = Instant::now().duration_since(self.last_ingest);
        if silent_for > self.config.stall_threshold() {
            log::warn!("No heart rate data for {:?}", silent_for);
            self.enter_stalled("no data received");
        }
    }

    fn enter_stalled(&mut self, reason: &str) {
        log::warn!("Link stalled ({}), recording continues", reason);
        self.set_state(SessionState::Stalled);
        self.set_connection(ConnectionState::Reconnecting);
        self.reset_battery();
        self.status("Connection lost, reconnecting...");
        self.spawn_reconnect();
    }

    fn spawn_reconnect(&mut self) {
        if self.reconnect.is_some() {
            log::debug!("Reconnect loop already running");
            return;
        }
        let Some((device, stale)) = self
            .link
            .as_ref()
            .map(|link| (link.device.clone(), link.handle.clone()))
        else {
            return;
        };

        let id = self.allocate_link_id();
        let events = LinkEvents::new(id, self.link_tx.clone());
        let should_stop = Arc::new(AtomicBool::new(false));
        let (outcome_tx, outcome_rx) = crossbeam_channel::bounded(1);

        let task = tokio::spawn(reconnect_loop(
            self.transport.clone(),
            device,
            stale,
            self.config.reconnect_interval(),
            events,
            should_stop.clone(),
            outcome_tx,
        ));

        self.reconnect = Some(ReconnectTask {
            link: id,
            should_stop,
            outcome: outcome_rx,
            _task: task,
        });
    }

    fn poll_reconnect(&mut self) {
        let Some(task) = self.reconnect.as_ref() else {
            return;
        };
        match task.outcome.try_recv() {
            Ok(handle) => {
                let id = task.link;
                self.reconnect = None;
                self.resume(id, handle);
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                log::debug!("Reconnect loop exited without a link");
                self.reconnect = None;
            }
        }
    }

    fn resume(&mut self, id: u64, handle: T::Handle) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        link.id = id;
        link.handle = handle;
        let name = link.device.name.clone();

        self.last_ingest = Instant::now();
        self.last_battery_poll = None;
        self.set_connection(ConnectionState::Connected);
        self.set_state(SessionState::Recording);
        self.status(format!("Reconnected to {}", name));
    }

    fn flush_if_due(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_flush) < self.config.flush_interval() {
            return;
        }
        self.last_flush = now;
        self.retry_unsaved();

        let Some(active) = self.recording.as_mut() else {
            return;
        };
        match active.sink.flush() {
            Ok(written) => {
                log::debug!("Periodic flush wrote {} samples", written);
                if self.state == SessionState::Recording {
                    let file = active.sink.file_name();
                    self.status(format!(
                        "Auto-saved to {} at {}",
                        file,
                        Local::now().format("%H:%M:%S")
                    ));
                }
            }
            Err(e) => log::error!(
                "Periodic flush failed, {} samples kept for retry: {}",
                active.sink.pending(),
                e
            ),
        }
    }

    fn retry_unsaved(&mut self) {
        let mut saved = Vec::new();
        self.unsaved.retain_mut(|sink| match sink.close() {
            Ok(written) => {
                log::info!("Retried save wrote {} samples", written);
                saved.push(sink.path().to_path_buf());
                false
            }
            Err(e) => {
                log::warn!("Save of {} still failing: {}", sink.path().display(), e);
                true
            }
        });
        for path in saved {
            self.status(format!("Saved: {}", path.display()));
        }
    }

    async fn poll_battery_if_due(&mut self) {
        if self.connection != ConnectionState::Connected {
            return;
        }
        let Some(handle) = self.link.as_ref().map(|link| link.handle.clone()) else {
            return;
        };
        let now = Instant::now();
        let due = match self.last_battery_poll {
            None => true,
            Some(at) => now.duration_since(at) >= self.config.battery_poll_interval(),
        };
        if !due {
            return;
        }
        self.last_battery_poll = Some(now);

        let level = self
            .transport
            .read_characteristic(&handle, BATTERY_LEVEL)
            .await
            .and_then(|bytes| {
                parse_battery_level(&bytes)
                    .ok_or_else(|| TransportError::Ble("empty battery payload".to_string()))
            });
        match level {
            Ok(level) => {
                log::debug!("Battery level {}%", level);
                self.battery = Some(level);
                self.emit(PresentationEvent::Battery(Some(level)));
            }
            Err(e) => log::warn!("{}", RecorderError::BatteryReadFailed(e)),
        }
    }
}

/// Disconnect-then-reconnect cycle against the last known device until a
/// link with a live heart rate stream comes back or `should_stop` is set
async fn reconnect_loop<T: BleTransport>(
    transport: Arc<T>,
    device: DeviceDescriptor,
    stale: T::Handle,
    interval: Duration,
    events: LinkEvents,
    should_stop: Arc<AtomicBool>,
    outcome: Sender<T::Handle>,
) {
    let mut attempt = 0u32;
    loop {
        tokio::time::sleep(interval).await;
        if should_stop.load(Ordering::Relaxed) {
            log::info!("Reconnect loop for {} stopped", device.address);
            return;
        }

        attempt += 1;
        events.reconnect_attempt(attempt);
        if let Err(e) = transport.disconnect(&stale).await {
            log::debug!("Disconnect before reconnect failed: {}", e);
        }

        let handle = match transport.connect(&device).await {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("Reconnect attempt {} to {} failed: {}", attempt, device.address, e);
                continue;
            }
        };
        if should_stop.load(Ordering::Relaxed) {
            if let Err(e) = transport.disconnect(&handle).await {
                log::warn!("Disconnect after cancelled reconnect failed: {}", e);
            }
            return;
        }

        if let Err(e) = transport.on_unsolicited_disconnect(&handle, events.clone()).await {
            log::warn!("Disconnect notifications unavailable for {}: {}", device.address, e);
        }
        if let Err(e) = transport.subscribe_heart_rate(&handle, events.clone()).await {
            log::warn!("Reconnect attempt {}: stream did not resume: {}", attempt, e);
            if let Err(e) = transport.disconnect(&handle).await {
                log::debug!("Disconnect after failed resubscribe failed: {}", e);
            }
            continue;
        }

        log::info!("Reconnected to {} on attempt {}", device.address, attempt);
        if outcome.send(handle.clone()).is_err() {
            // Recording stopped while the link came back
            if let Err(e) = transport.unsubscribe_heart_rate(&handle).await {
                log::debug!("Unsubscribe of orphaned link failed: {}", e);
            }
            if let Err(e) = transport.disconnect(&handle).await {
                log::warn!("Disconnect of orphaned link failed: {}", e);
            }
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::sink::SessionRecord;
    use chrono::DateTime;
    use tempfile::TempDir;

    const ADDRESS: &str = "A0:9E:1A:00:00:01";

    struct Harness {
        controller: SessionController<MockTransport>,
        transport: Arc<MockTransport>,
        events: Receiver<PresentationEvent>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new(vec![
            DeviceDescriptor::new("Polar Sense B5C3", ADDRESS),
            DeviceDescriptor::new("Polar H10 8C2A", "A0:9E:1A:00:00:02"),
            DeviceDescriptor::new("Wahoo TICKR", "C4:00:00:00:00:03"),
        ]));
        let config = Config {
            output_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let (tx, rx) = unbounded();
        Harness {
            controller: SessionController::new(transport.clone(), config, tx),
            transport,
            events: rx,
            _dir: dir,
        }
    }

    fn statuses(events: &Receiver<PresentationEvent>) -> Vec<String> {
        events
            .try_iter()
            .filter_map(|event| match event {
                PresentationEvent::Status(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    fn at(base: DateTime<Local>, secs: i64) -> DateTime<Local> {
        base + chrono::Duration::seconds(secs)
    }

    async fn recording(h: &mut Harness, interval: Duration) -> PathBuf {
        h.controller.connect(ADDRESS).await.unwrap();
        h.controller.start_recording("subject-1", interval).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_filters_by_device_type() {
        let mut h = harness();

        let found = h.controller.scan().await.unwrap();
        assert_eq!(found, 1);
        assert_eq!(h.controller.state(), SessionState::Idle);

        let listings = h
            .events
            .try_iter()
            .filter_map(|event| match event {
                PresentationEvent::Devices(listings) => Some(listings),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].device.address, ADDRESS);

        h.controller.set_device_type("polar");
        assert_eq!(h.controller.directory().listings("polar").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_device_reports_busy_flag() {
        let mut h = harness();
        assert!(!h.controller.select_device(ADDRESS));
        assert!(statuses(&h.events).contains(&"Select a device from the list first".to_string()));

        h.controller.scan().await.unwrap();
        h.controller.connect(ADDRESS).await.unwrap();
        assert!(h.controller.select_device(ADDRESS));
        let last = statuses(&h.events).pop().unwrap();
        assert!(last.ends_with("(busy locally)"));
        assert_eq!(h.controller.selected().map(|d| d.address.as_str()), Some(ADDRESS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_claims_address() {
        let mut h = harness();

        h.controller.connect(ADDRESS).await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Connected);
        assert_eq!(h.controller.connection(), ConnectionState::Connected);
        assert!(h.controller.directory().is_busy(ADDRESS));
        assert!(statuses(&h.events)
            .contains(&format!("Connected to: Polar Sense B5C3 ({})", ADDRESS)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_three_attempts() {
        let mut h = harness();
        h.transport.fail_next_connects(3);

        let err = h.controller.connect(ADDRESS).await.unwrap_err();
        match err {
            RecorderError::ConnectFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(h.transport.connect_calls(), 3);
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.controller.connection(), ConnectionState::Disconnected);
        assert_eq!(h.controller.directory().busy_count(), 0);
        assert!(statuses(&h.events).last().unwrap().starts_with("Error:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_succeeds_on_last_attempt() {
        let mut h = harness();
        h.transport.fail_next_connects(2);

        h.controller.connect(ADDRESS).await.unwrap();
        assert_eq!(h.transport.connect_calls(), 3);
        assert_eq!(h.controller.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rejects_busy_address() {
        let mut h = harness();
        h.controller.connect(ADDRESS).await.unwrap();

        let err = h.controller.connect(&ADDRESS.to_lowercase()).await.unwrap_err();
        assert!(matches!(err, RecorderError::DeviceBusy(_)));
        assert_eq!(h.controller.state(), SessionState::Connected);
        assert_eq!(h.transport.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_unknown_address() {
        let mut h = harness();

        let err = h.controller.connect("FF:FF:FF:FF:FF:FF").await.unwrap_err();
        assert!(matches!(err, RecorderError::DeviceNotFound(_)));
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.transport.connect_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_recording_requires_link() {
        let mut h = harness();

        let err = h
            .controller
            .start_recording("subject-1", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RecorderError::NotConnected));
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(h.controller.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_are_decimated_but_all_plotted() {
        let mut h = harness();
        recording(&mut h, Duration::from_secs(5)).await;
        let _ = statuses(&h.events);

        let base = Local::now();
        for secs in 0..=10 {
            h.transport.emit(at(base, secs), 60 + secs as u16);
        }
        h.controller.tick().await;

        let session = h.controller.session().unwrap();
        let rates: Vec<u16> = session.records.iter().map(|s| s.heart_rate).collect();
        assert_eq!(rates, vec![60, 65, 70]);

        let plotted = h
            .events
            .try_iter()
            .filter(|event| matches!(event, PresentationEvent::PlotAppend { .. }))
            .count();
        assert_eq!(plotted, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_from_stale_link_are_ignored() {
        let mut h = harness();
        recording(&mut h, Duration::from_secs(1)).await;

        let stale = h.controller.current_link_id().unwrap() + 100;
        h.controller
            .link_tx
            .send(LinkEvent::Sample {
                link: stale,
                sample: Sample::new(Local::now(), 90),
            })
            .unwrap();
        h.controller.tick().await;

        assert!(h.controller.session().unwrap().records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_recording_stalls_and_keeps_records() {
        let mut h = harness();
        recording(&mut h, Duration::from_secs(1)).await;

        let base = Local::now();
        h.transport.emit(base, 70);
        h.transport.emit(at(base, 1), 71);
        h.controller.tick().await;
        assert_eq!(h.controller.battery(), Some(80));

        h.transport.drop_link();
        h.controller.tick().await;

        assert_eq!(h.controller.state(), SessionState::Stalled);
        assert_eq!(h.controller.connection(), ConnectionState::Reconnecting);
        assert_eq!(h.controller.battery(), None);
        assert_eq!(h.controller.session().unwrap().records.len(), 2);
        assert!(h.controller.reconnect_in_flight());
        // Still claimed while the session waits for the device
        assert!(h.controller.directory().is_busy(ADDRESS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connected_returns_to_idle() {
        let mut h = harness();
        h.controller.connect(ADDRESS).await.unwrap();

        h.transport.drop_link();
        h.controller.tick().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.controller.connection(), ConnectionState::Disconnected);
        assert_eq!(h.controller.directory().busy_count(), 0);
        assert!(!h.controller.reconnect_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_only_runs_while_recording() {
        let mut h = harness();
        tokio::time::sleep(Duration::from_secs(30)).await;
        h.controller.tick().await;
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(!h.controller.reconnect_in_flight());

        h.controller.connect(ADDRESS).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        h.controller.tick().await;
        assert_eq!(h.controller.state(), SessionState::Connected);

        h.controller
            .start_recording("subject-1", Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(19)).await;
        h.controller.tick().await;
        assert_eq!(h.controller.state(), SessionState::Recording);

        tokio::time::sleep(Duration::from_secs(2)).await;
        h.controller.tick().await;
        assert_eq!(h.controller.state(), SessionState::Stalled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_death_recovers() {
        let mut h = harness();
        recording(&mut h, Duration::from_secs(1)).await;
        assert!(h.transport.is_streaming());

        h.transport.drop_link_silently();
        tokio::time::sleep(Duration::from_secs(21)).await;
        h.controller.tick().await;
        assert_eq!(h.controller.state(), SessionState::Stalled);
        assert_eq!(h.controller.connection(), ConnectionState::Reconnecting);
        assert!(!h.transport.is_streaming());

        tokio::time::sleep(Duration::from_secs(6)).await;
        h.controller.tick().await;
        assert_eq!(h.controller.state(), SessionState::Recording);
        assert_eq!(h.controller.connection(), ConnectionState::Connected);
        assert!(h.transport.is_streaming());
        assert_eq!(h.transport.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_recording() {
        let mut h = harness();
        recording(&mut h, Duration::from_secs(1)).await;
        let base = Local::now();
        h.transport.emit(base, 70);

        h.transport.drop_link();
        h.controller.tick().await;
        assert_eq!(h.controller.state(), SessionState::Stalled);
        h.transport.fail_next_connects(3);

        // Attempts at 5, 10, 15 fail; the fourth at 20 succeeds
        tokio::time::sleep(Duration::from_secs(21)).await;
        h.controller.tick().await;

        assert_eq!(h.controller.state(), SessionState::Recording);
        assert_eq!(h.controller.connection(), ConnectionState::Connected);
        assert_eq!(h.transport.connect_calls(), 5);
        assert!(!h.controller.reconnect_in_flight());
        assert!(statuses(&h.events).contains(&"Reconnected to Polar Sense B5C3".to_string()));

        h.transport.emit(at(base, 30), 75);
        h.controller.tick().await;
        let rates: Vec<u16> = h
            .controller
            .session()
            .unwrap()
            .records
            .iter()
            .map(|s| s.heart_rate)
            .collect();
        assert_eq!(rates, vec![70, 75]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_reconnect_ends_attempts() {
        let mut h = harness();
        recording(&mut h, Duration::from_secs(1)).await;
        h.transport.emit(Local::now(), 70);

        h.transport.fail_next_connects(u32::MAX);
        h.transport.drop_link();
        h.controller.tick().await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        h.controller.tick().await;
        assert!(statuses(&h.events)
            .contains(&"Connection lost, reconnecting (attempt 1)...".to_string()));

        let path = h.controller.stop_recording().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.controller.directory().busy_count(), 0);

        let calls = h.transport.connect_calls();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.transport.connect_calls(), calls);

        let saved = SessionRecord::load(&path).unwrap();
        assert_eq!(saved.data.len(), 1);
        assert_eq!(saved.subject, "subject-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_adopts_link_restored_between_ticks() {
        let mut h = harness();
        recording(&mut h, Duration::from_secs(1)).await;
        h.transport.drop_link();
        h.controller.tick().await;
        assert_eq!(h.controller.state(), SessionState::Stalled);

        // The loop reconnects, but no tick runs before the stop
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(h.transport.is_streaming());
        h.controller.stop_recording().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Connected);
        assert_eq!(h.controller.connection(), ConnectionState::Connected);
        assert!(!h.transport.is_streaming());

        // A later drop of the restored link must still be noticed
        h.transport.drop_link();
        h.controller.tick().await;
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.controller.connection(), ConnectionState::Disconnected);
        assert!(!h.controller.directory().is_busy(ADDRESS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_final_save_is_retried_by_periodic_flush() {
        let mut h = harness();
        let path = recording(&mut h, Duration::from_secs(1)).await;
        h.transport.emit(Local::now(), 66);
        h.controller.tick().await;
        // A directory where the file should be makes every write fail
        std::fs::create_dir(&path).unwrap();

        let err = h.controller.stop_recording().await.unwrap_err();
        assert!(matches!(err, RecorderError::Persist(_)));
        assert_eq!(h.controller.state(), SessionState::Connected);
        assert!(h.controller.session().is_none());

        std::fs::remove_dir(&path).unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        h.controller.tick().await;

        let saved = SessionRecord::load(&path).unwrap();
        assert_eq!(saved.data.len(), 1);
        assert_eq!(saved.data[0].hr, 66);
        assert!(statuses(&h.events).contains(&format!("Saved: {}", path.display())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_retries_failed_final_save() {
        let mut h = harness();
        let path = recording(&mut h, Duration::from_secs(1)).await;
        h.transport.emit(Local::now(), 66);
        h.controller.tick().await;
        std::fs::create_dir(&path).unwrap();
        assert!(h.controller.stop_recording().await.is_err());

        std::fs::remove_dir(&path).unwrap();
        h.controller.dispose().await;

        assert_eq!(SessionRecord::load(&path).unwrap().data.len(), 1);
        assert_eq!(h.controller.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_writes_to_disk() {
        let mut h = harness();
        let path = recording(&mut h, Duration::from_secs(1)).await;
        let base = Local::now();

        for step in 1..=3 {
            tokio::time::sleep(Duration::from_secs(11)).await;
            h.transport.emit(at(base, step * 11), 80);
            h.controller.tick().await;
        }

        assert_eq!(h.controller.state(), SessionState::Recording);
        let saved = SessionRecord::load(&path).unwrap();
        assert_eq!(saved.data.len(), 3);
        assert!(statuses(&h.events)
            .iter()
            .any(|status| status.starts_with("Auto-saved to ")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_battery_read_keeps_last_value() {
        let mut h = harness();
        h.controller.connect(ADDRESS).await.unwrap();
        h.controller.tick().await;
        assert_eq!(h.controller.battery(), Some(80));

        h.transport.set_battery(None);
        tokio::time::sleep(Duration::from_secs(61)).await;
        h.controller.tick().await;

        assert_eq!(h.transport.battery_reads(), 2);
        assert_eq!(h.controller.battery(), Some(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_is_polled_once_per_interval() {
        let mut h = harness();
        h.controller.connect(ADDRESS).await.unwrap();
        for _ in 0..5 {
            h.controller.tick().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(h.transport.battery_reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_survives_unsubscribe_failure() {
        let mut h = harness();
        let path = recording(&mut h, Duration::from_secs(1)).await;
        h.transport.emit(Local::now(), 64);
        h.controller.tick().await;
        h.transport.fail_unsubscribe(true);

        let saved = h.controller.stop_recording().await.unwrap();
        assert_eq!(saved, path);
        assert_eq!(h.transport.unsubscribe_calls(), 1);
        assert_eq!(h.controller.state(), SessionState::Connected);
        assert!(h.controller.directory().is_busy(ADDRESS));
        assert!(statuses(&h.events).contains(&format!("Saved: {}", path.display())));
        assert_eq!(SessionRecord::load(&path).unwrap().data.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_requires_active_session() {
        let mut h = harness();
        h.controller.connect(ADDRESS).await.unwrap();

        let err = h.controller.stop_recording().await.unwrap_err();
        assert!(matches!(err, RecorderError::InvalidState { .. }));
        assert_eq!(h.controller.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_enters_stalled() {
        let mut h = harness();
        h.controller.connect(ADDRESS).await.unwrap();
        h.transport.fail_subscribe(true);

        h.controller
            .start_recording("subject-1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(h.controller.state(), SessionState::Stalled);
        assert!(h.controller.reconnect_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_saves_and_releases() {
        let mut h = harness();
        let path = recording(&mut h, Duration::from_secs(1)).await;
        h.transport.emit(Local::now(), 64);
        h.controller.tick().await;

        h.controller.dispose().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.controller.connection(), ConnectionState::Disconnected);
        assert_eq!(h.controller.directory().busy_count(), 0);
        assert!(h.transport.disconnect_calls() >= 1);
        assert_eq!(SessionRecord::load(&path).unwrap().data.len(), 1);
    }
}
