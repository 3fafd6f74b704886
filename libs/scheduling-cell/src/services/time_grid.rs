//! Maps wall-clock time onto the vertical axis of the week grid.
//!
//! Everything here is a pure coordinate transform: `offset_minutes(t)` is
//! `(hour(t) - visible_start_hour) * 60 + minute(t)`, and pixel values are
//! minutes times `pixels_per_minute`. Occurrences reaching outside the visible
//! hours are clipped at the window edge instead of producing negative offsets.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use shared_config::CalendarSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct TimeGrid {
    visible_start_hour: u32,
    visible_end_hour: u32,
    pixels_per_minute: f32,
    slot_minutes: u32,
    min_height_px: f32,
}

/// Vertical placement of an occurrence within one day cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub top_px: f32,
    pub height_px: f32,
    pub clipped_top: bool,
    pub clipped_bottom: bool,
}

impl TimeGrid {
    pub fn new(settings: &CalendarSettings) -> Self {
        Self {
            visible_start_hour: settings.visible_start_hour,
            visible_end_hour: settings.visible_end_hour,
            pixels_per_minute: settings.pixels_per_minute,
            slot_minutes: settings.slot_minutes,
            min_height_px: settings.min_card_height_px,
        }
    }

    pub fn visible_minutes(&self) -> i64 {
        (self.visible_end_hour as i64 - self.visible_start_hour as i64) * 60
    }

    pub fn total_height_px(&self) -> f32 {
        self.visible_minutes() as f32 * self.pixels_per_minute
    }

    /// Minutes from the top of the window; negative before it.
    pub fn offset_minutes(&self, time: NaiveTime) -> i64 {
        (time.hour() as i64 - self.visible_start_hour as i64) * 60 + time.minute() as i64
    }

    /// Pixel offset of `time`, clamped to the grid.
    pub fn offset_px(&self, time: NaiveTime) -> f32 {
        let minutes = self.offset_minutes(time).clamp(0, self.visible_minutes());
        minutes as f32 * self.pixels_per_minute
    }

    pub fn height_px(&self, duration_minutes: i64) -> f32 {
        (duration_minutes.max(0) as f32 * self.pixels_per_minute).max(self.min_height_px)
    }

    /// Places `[start, end)` inside the cell for `day`.
    ///
    /// Parts before or after the visible hours (or on another day) are cut
    /// off and flagged. An occurrence lying entirely outside the window is
    /// pinned to the nearest edge at minimum height so it stays clickable.
    pub fn place(&self, day: NaiveDate, start: NaiveDateTime, end: NaiveDateTime) -> Placement {
        let window_start = day.and_time(NaiveTime::MIN) + chrono::Duration::hours(self.visible_start_hour as i64);
        let window_end = window_start + chrono::Duration::minutes(self.visible_minutes());

        let clipped_top = start < window_start;
        let clipped_bottom = end > window_end;

        let visible_start = start.clamp(window_start, window_end);
        let visible_end = end.clamp(window_start, window_end).max(visible_start);

        let offset = (visible_start - window_start).num_minutes();
        let length = (visible_end - visible_start).num_minutes();

        let mut top_px = offset as f32 * self.pixels_per_minute;
        let height_px = self.height_px(length);

        // Keep minimum-height cards at the bottom edge inside the grid.
        let overflow = top_px + height_px - self.total_height_px();
        if overflow > 0.0 {
            top_px = (top_px - overflow).max(0.0);
        }

        Placement {
            top_px,
            height_px,
            clipped_top,
            clipped_bottom,
        }
    }

    /// Time at a vertical pixel position, snapped down to the slot grid.
    pub fn time_at(&self, y_px: f32) -> NaiveTime {
        let minutes = (y_px.max(0.0) / self.pixels_per_minute) as i64;
        let minutes = minutes.min(self.visible_minutes() - 1).max(0);
        let snapped = minutes - minutes % self.slot_minutes as i64;
        let total = self.visible_start_hour as i64 * 60 + snapped;
        NaiveTime::from_hms_opt((total / 60) as u32, (total % 60) as u32, 0).unwrap_or(NaiveTime::MIN)
    }

    pub fn hour_labels(&self) -> Vec<String> {
        (self.visible_start_hour..self.visible_end_hour)
            .map(|hour| format!("{:02}:00", hour))
            .collect()
    }

    pub fn slot_starts(&self) -> Vec<NaiveTime> {
        (0..self.visible_minutes())
            .step_by(self.slot_minutes as usize)
            .filter_map(|m| {
                let total = self.visible_start_hour as i64 * 60 + m;
                NaiveTime::from_hms_opt((total / 60) as u32, (total % 60) as u32, 0)
            })
            .collect()
    }
}
