use crate::app::Message;
use plotters::chart::ChartBuilder;
use plotters::series::LineSeries;
use plotters::style::{RGBColor, RED};
use plotters_iced::{Chart, DrawingBackend};
use std::collections::VecDeque;

/// Points kept on screen
pub const PLOT_WINDOW: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotPoint {
    /// Seconds since the session started
    pub x: f64,
    pub y: u16,
}

/// Rolling window of raw heart rate samples for the live plot
#[derive(Debug, Default)]
pub struct PlotWindow {
    points: VecDeque<PlotPoint>,
}

impl PlotWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, x: f64, y: u16) {
        if self.points.len() == PLOT_WINDOW {
            self.points.pop_front();
        }
        self.points.push_back(PlotPoint { x, y });
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn latest(&self) -> Option<PlotPoint> {
        self.points.back().copied()
    }

    pub fn points(&self) -> impl Iterator<Item = &PlotPoint> {
        self.points.iter()
    }

    pub fn x_range(&self) -> Option<(f64, f64)> {
        let first = self.points.front()?.x;
        let last = self.points.back()?.x;
        Some((first, last.max(first + 1.0)))
    }

    /// Value range padded by 5 bpm, never narrower than 20 bpm
    pub fn y_range(&self) -> Option<(u16, u16)> {
        let (min, max) = self.points.iter().fold(None, |acc, p| match acc {
            None => Some((p.y, p.y)),
            Some((min, max)) => Some((p.y.min(min), p.y.max(max))),
        })?;
        let low = min.saturating_sub(5);
        let high = max.saturating_add(5).max(low + 20);
        Some((low, high))
    }
}

pub struct HrChart<'a> {
    pub plot: &'a PlotWindow,
}

impl<'a> Chart<Message> for HrChart<'a> {
    type State = ();

    fn build_chart<DB: DrawingBackend>(&self, _state: &Self::State, mut builder: ChartBuilder<DB>) {
        let (min_x, max_x) = self.plot.x_range().unwrap_or((0.0, 1.0));
        let (min_y, max_y) = self.plot.y_range().unwrap_or((40, 120));

        let mut chart = match builder
            .margin(15)
            .caption("Heart Rate (bpm)", ("sans-serif", 20))
            .x_label_area_size(30)
            .y_label_area_size(30)
            .build_cartesian_2d(min_x..max_x, i32::from(min_y)..i32::from(max_y))
        {
            Ok(chart) => chart,
            Err(e) => {
                log::debug!("Failed to build chart: {}", e);
                return;
            }
        };

        let _ = chart.plotting_area().fill(&RGBColor(245, 245, 240));
        let _ = chart
            .configure_mesh()
            .axis_style(RGBColor(60, 60, 60))
            .x_desc("Time (s)")
            .draw();

        if let Err(e) = chart.draw_series(LineSeries::new(
            self.plot.points().map(|p| (p.x, i32::from(p.y))),
            &RED,
        )) {
            log::debug!("Failed to draw heart rate series: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_last_points() {
        let mut plot = PlotWindow::new();
        for i in 0..(PLOT_WINDOW + 20) {
            plot.push(i as f64, 60);
        }
        assert_eq!(plot.len(), PLOT_WINDOW);
        assert_eq!(plot.points().next().unwrap().x, 20.0);
        assert_eq!(plot.latest().unwrap().x, (PLOT_WINDOW + 19) as f64);
    }

    #[test]
    fn test_ranges() {
        let mut plot = PlotWindow::new();
        assert!(plot.y_range().is_none());

        plot.push(3.0, 70);
        assert_eq!(plot.x_range(), Some((3.0, 4.0)));
        assert_eq!(plot.y_range(), Some((65, 85)));

        plot.push(10.0, 110);
        plot.push(11.0, 2);
        assert_eq!(plot.x_range(), Some((3.0, 11.0)));
        assert_eq!(plot.y_range(), Some((0, 115)));

        plot.clear();
        assert!(plot.is_empty());
    }
}
