use crate::charts::{HrChart, PlotWindow};
use crate::config::Config;
use crate::controller::{ConnectionState, PresentationEvent, SessionState};
use crate::directory::DeviceListing;
use crate::service::Intent;
use crate::ui::styles;
use crossbeam_channel::{Receiver, Sender};
use iced::widget::{button, column, container, pick_list, row, scrollable, text, text_input};
use iced::{Element, Length, Subscription, Task};
use plotters_iced::ChartWidget;
use std::path::PathBuf;

// Iced Application State
pub struct HrRecorder {
    events: Receiver<PresentationEvent>,
    intents: Sender<Intent>,
    pub device_types: Vec<String>,
    pub device_type: String,
    pub subject_id: String,
    pub sampling_input: String,
    pub devices: Vec<DeviceListing>,
    pub selected: Option<String>,
    pub status: String,
    pub battery: Option<u8>,
    pub badge: ConnectionState,
    pub state: SessionState,
    pub plot: PlotWindow,
    pub recording_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum Message {
    Tick,
    SubjectChanged(String),
    SamplingChanged(String),
    DeviceTypeSelected(String),
    ScanDevices,
    SelectDevice(String),
    ConnectDevice,
    StartRecording,
    StopRecording,
}

impl HrRecorder {
    pub fn new(
        config: &Config,
        events: Receiver<PresentationEvent>,
        intents: Sender<Intent>,
    ) -> (Self, Task<Message>) {
        let mut device_types = config.device_types.clone();
        if !device_types.contains(&config.device_type) {
            device_types.push(config.device_type.clone());
        }

        (
            HrRecorder {
                events,
                intents,
                device_types,
                device_type: config.device_type.clone(),
                subject_id: config.subject_id.clone(),
                sampling_input: config.sampling_interval().as_secs().to_string(),
                devices: Vec::new(),
                selected: None,
                status: "Ready".to_string(),
                battery: None,
                badge: ConnectionState::Disconnected,
                state: SessionState::Idle,
                plot: PlotWindow::new(),
                recording_file: None,
            },
            Task::none(),
        )
    }

    fn send(&mut self, intent: Intent) {
        if let Err(e) = self.intents.send(intent) {
            log::error!("Recorder service is not running: {}", e);
            self.status = "Error: recorder service is not running".to_string();
        }
    }

    /// Fold one service event into the view state
    pub fn apply(&mut self, event: PresentationEvent) {
        match event {
            PresentationEvent::Status(status) => self.status = status,
            PresentationEvent::Battery(level) => self.battery = level,
            PresentationEvent::Badge(badge) => self.badge = badge,
            PresentationEvent::State(state) => self.state = state,
            PresentationEvent::Devices(devices) => {
                if let Some(selected) = &self.selected {
                    if !devices.iter().any(|d| d.device.has_address(selected)) {
                        self.selected = None;
                    }
                }
                self.devices = devices;
            }
            PresentationEvent::PlotAppend { x, y } => self.plot.push(x, y),
            PresentationEvent::RecordingFile(path) => {
                self.plot.clear();
                self.recording_file = Some(path);
            }
        }
    }

    pub fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::Tick => {
                // Process all pending events without blocking
                while let Ok(event) = self.events.try_recv() {
                    self.apply(event);
                }
            }
            Message::SubjectChanged(subject_id) => self.subject_id = subject_id,
            Message::SamplingChanged(input) => self.sampling_input = input,
            Message::DeviceTypeSelected(device_type) => {
                self.device_type = device_type.clone();
                self.send(Intent::SetDeviceType(device_type));
            }
            Message::ScanDevices => self.send(Intent::Scan),
            Message::SelectDevice(address) => {
                self.selected = Some(address.clone());
                self.send(Intent::SelectDevice(address));
            }
            Message::ConnectDevice => match self.selected.clone() {
                Some(address) => self.send(Intent::Connect(address)),
                None => self.status = "Select a device from the list first".to_string(),
            },
            Message::StartRecording => match self.sampling_input.trim().parse::<u64>() {
                Ok(interval_secs) if interval_secs >= 1 => {
                    let subject_id = self.subject_id.clone();
                    self.send(Intent::StartRecording {
                        subject_id,
                        interval_secs,
                    });
                }
                _ => {
                    self.status =
                        "Error: sampling interval must be a whole number of seconds".to_string();
                }
            },
            Message::StopRecording => self.send(Intent::StopRecording),
        }
        Task::none()
    }

    pub fn subscription(&self) -> Subscription<Message> {
        iced::time::every(std::time::Duration::from_millis(16)).map(|_| Message::Tick)
    }

    fn is_recording(&self) -> bool {
        matches!(self.state, SessionState::Recording | SessionState::Stalled)
    }

    pub fn view(&'_ self) -> Element<'_, Message> {
        let content = row![self.create_sidebar(), self.create_main_view()].spacing(0);

        container(content)
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }

    fn create_sidebar(&self) -> Element<'_, Message> {
        let title = text("Devices").size(20);
        let idle = self.state == SessionState::Idle;

        let device_type = pick_list(
            self.device_types.as_slice(),
            Some(&self.device_type),
            Message::DeviceTypeSelected,
        )
        .width(Length::Fill);

        let scan_button = button(text(if self.state == SessionState::Scanning {
            "Scanning..."
        } else {
            "Scan"
        }))
        .on_press_maybe(idle.then_some(Message::ScanDevices))
        .padding(10)
        .width(Length::Fill)
        .style(styles::scan_button_style());

        let device_list: Element<'_, Message> = if self.devices.is_empty() {
            text("No devices found. Click 'Scan' to start.").into()
        } else {
            let devices = self.devices.iter().map(|listing| {
                let address = listing.device.address.clone();
                let is_selected = self.selected.as_deref() == Some(address.as_str());
                button(text(listing.label()).size(14))
                    .on_press_maybe(idle.then(|| Message::SelectDevice(address)))
                    .width(Length::Fill)
                    .padding(10)
                    .style(styles::device_button_style(is_selected, listing.busy))
                    .into()
            });
            scrollable(column(devices).spacing(5)).height(Length::Fill).into()
        };

        let connect_button = match self.badge {
            ConnectionState::Connecting => button(text("Connecting...")),
            ConnectionState::Connected | ConnectionState::Reconnecting => button(text("Connected")),
            ConnectionState::Disconnected => button(text("Connect"))
                .on_press_maybe((idle && self.selected.is_some()).then_some(Message::ConnectDevice)),
        }
        .padding(10)
        .width(Length::Fill)
        .style(styles::connect_button_style());

        let sidebar_content = column![title, device_type, scan_button, device_list, connect_button]
            .spacing(10)
            .padding(20)
            .width(300);

        container(sidebar_content)
            .style(container::bordered_box)
            .width(Length::Fixed(300.0))
            .height(Length::Fill)
            .into()
    }

    fn create_main_view(&self) -> Element<'_, Message> {
        let recording = self.is_recording();

        let subject = text_input("Subject ID", &self.subject_id)
            .on_input_maybe((!recording).then_some(Message::SubjectChanged))
            .padding(8);
        let sampling = text_input("Seconds", &self.sampling_input)
            .on_input_maybe((!recording).then_some(Message::SamplingChanged))
            .padding(8)
            .width(Length::Fixed(100.0));

        let badge = text(styles::badge_label(self.badge))
            .size(16)
            .color(styles::badge_color(self.badge));
        let battery = text(match self.battery {
            Some(level) => format!("Battery: {}%", level),
            None => "Battery: --".to_string(),
        })
        .size(16);
        let heart_rate = text(match self.plot.latest() {
            Some(point) => format!("{} bpm", point.y),
            None => "-- bpm".to_string(),
        })
        .size(24);

        let record_button = if recording {
            button(text("Stop Recording")).on_press(Message::StopRecording)
        } else {
            button(text("Start Recording")).on_press_maybe(
                (self.state == SessionState::Connected).then_some(Message::StartRecording),
            )
        }
        .padding(10)
        .style(styles::record_button_style(recording));

        let controls = row![
            text("Subject:"),
            subject,
            text("Sampling (s):"),
            sampling,
            record_button
        ]
        .spacing(10)
        .align_y(iced::alignment::Vertical::Center);

        let indicators = row![badge, battery, heart_rate]
            .spacing(30)
            .align_y(iced::alignment::Vertical::Center);

        let chart = ChartWidget::new(HrChart { plot: &self.plot })
            .width(Length::Fill)
            .height(Length::Fill);

        let file = text(match &self.recording_file {
            Some(path) => format!("File: {}", path.display()),
            None => String::new(),
        })
        .size(12);

        let content = column![controls, indicators, chart, text(&self.status).size(14), file]
            .spacing(15)
            .padding(20);

        container(content)
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }
}

impl Drop for HrRecorder {
    fn drop(&mut self) {
        let _ = self.intents.send(Intent::Shutdown);
    }
}
