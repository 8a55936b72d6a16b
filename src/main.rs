// Hide console window on Windows in release builds
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod app;
mod ble;
mod charts;
mod config;
mod controller;
mod directory;
mod error;
mod heart_rate;
#[cfg(test)]
mod mock;
mod sampling;
mod service;
mod sink;
mod transport;
mod ui;

use app::HrRecorder;
use config::Config;
use controller::PresentationEvent;
use iced::Theme;
use service::RecorderService;

fn main() -> iced::Result {
    // On Windows, force wgpu to use Vulkan backend instead of DirectX 12
    #[cfg(target_os = "windows")]
    std::env::set_var("WGPU_BACKEND", "vulkan");

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load().unwrap_or_else(|e| {
        log::warn!("{}; using default settings", e);
        Config::default()
    });
    log::info!("Session files go to {}", config.output_dir.display());

    // Service thread -> UI thread
    let (event_sender, event_receiver) = crossbeam_channel::unbounded::<PresentationEvent>();
    let (service, intent_sender) = RecorderService::new(config.clone(), event_sender);

    let shutdown = intent_sender.clone();

    let service_thread = std::thread::spawn(move || {
        service.run();
    });

    let result = iced::application("HR Recorder", HrRecorder::update, HrRecorder::view)
        .subscription(HrRecorder::subscription)
        .theme(|_| Theme::Light)
        .window_size((1100.0, 720.0))
        .run_with(move || HrRecorder::new(&config, event_receiver, intent_sender));

    // Wait for the final flush before exiting
    let _ = shutdown.send(service::Intent::Shutdown);
    drop(shutdown);
    if service_thread.join().is_err() {
        log::error!("Recorder service thread panicked");
    }

    result
}
