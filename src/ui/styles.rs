//! # UI Styling Module
//!
//! Button palettes and status colors shared by the recorder window.
//! Every button style is derived from one base color: hovered is lighter,
//! pressed is darker, disabled is a flat gray.

use iced::widget::button;
use iced::{Background, Border, Color};

use crate::controller::ConnectionState;

const SELECTED: Color = Color { r: 0.2, g: 0.6, b: 0.7, a: 1.0 };
const UNSELECTED: Color = Color { r: 0.4, g: 0.4, b: 0.4, a: 1.0 };
const BUSY: Color = Color { r: 0.55, g: 0.45, b: 0.25, a: 1.0 };
const GO: Color = Color { r: 0.2, g: 0.7, b: 0.2, a: 1.0 };
const STOP: Color = Color { r: 0.8, g: 0.2, b: 0.2, a: 1.0 };
const ACTION: Color = Color { r: 0.25, g: 0.45, b: 0.75, a: 1.0 };

fn shade(color: Color, delta: f32) -> Color {
    Color::from_rgb(
        (color.r + delta).clamp(0.0, 1.0),
        (color.g + delta).clamp(0.0, 1.0),
        (color.b + delta).clamp(0.0, 1.0),
    )
}

fn filled(background: Color, border_width: f32) -> button::Style {
    button::Style {
        background: Some(Background::Color(background)),
        text_color: Color::WHITE,
        border: Border {
            color: shade(background, 0.1),
            width: border_width,
            radius: 4.0.into(),
        },
        ..Default::default()
    }
}

fn palette(base: Color, border_width: f32) -> impl Fn(&iced::Theme, button::Status) -> button::Style {
    move |_theme: &iced::Theme, status: button::Status| match status {
        button::Status::Active => filled(base, border_width),
        button::Status::Hovered => filled(shade(base, 0.1), border_width),
        button::Status::Pressed => filled(shade(base, -0.05), border_width),
        button::Status::Disabled => button::Style {
            text_color: Color::from_rgb(0.6, 0.6, 0.6),
            ..filled(Color::from_rgb(0.3, 0.3, 0.3), 1.0)
        },
    }
}

/// Device list entry; busy devices stay selectable but are tinted
pub fn device_button_style(
    is_selected: bool,
    is_busy: bool,
) -> impl Fn(&iced::Theme, button::Status) -> button::Style {
    match (is_selected, is_busy) {
        (true, _) => palette(SELECTED, 2.0),
        (false, true) => palette(BUSY, 1.0),
        (false, false) => palette(UNSELECTED, 1.0),
    }
}

pub fn connect_button_style() -> impl Fn(&iced::Theme, button::Status) -> button::Style {
    palette(GO, 1.0)
}

pub fn scan_button_style() -> impl Fn(&iced::Theme, button::Status) -> button::Style {
    palette(ACTION, 1.0)
}

/// Start/Stop toggle
pub fn record_button_style(is_recording: bool) -> impl Fn(&iced::Theme, button::Status) -> button::Style {
    palette(if is_recording { STOP } else { GO }, 1.0)
}

pub fn badge_color(state: ConnectionState) -> Color {
    match state {
        ConnectionState::Disconnected => Color::from_rgb(0.5, 0.5, 0.5),
        ConnectionState::Connecting => Color::from_rgb(0.85, 0.65, 0.1),
        ConnectionState::Connected => Color::from_rgb(0.15, 0.6, 0.15),
        ConnectionState::Reconnecting => Color::from_rgb(0.85, 0.35, 0.1),
    }
}

pub fn badge_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "Disconnected",
        ConnectionState::Connecting => "Connecting",
        ConnectionState::Connected => "Connected",
        ConnectionState::Reconnecting => "Reconnecting",
    }
}
