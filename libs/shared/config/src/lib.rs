use std::env;
use std::str::FromStr;

use chrono::FixedOffset;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub notification_webhook_url: Option<String>,
    pub bind_address: String,
    pub soft_delete_occurrences: bool,
    pub calendar: CalendarSettings,
}

/// Rendering and generation parameters for the weekly calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarSettings {
    pub visible_start_hour: u32,
    pub visible_end_hour: u32,
    pub pixels_per_minute: f32,
    pub slot_minutes: u32,
    pub min_card_height_px: f32,
    /// How far past the visible window recurring series are materialized.
    pub lookahead_weeks: u32,
    /// Offset of the clinic's wall clock from UTC, in minutes.
    pub utc_offset_minutes: i32,
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            visible_start_hour: 7,
            visible_end_hour: 21,
            pixels_per_minute: 2.0,
            slot_minutes: 15,
            min_card_height_px: 20.0,
            lookahead_weeks: 12,
            utc_offset_minutes: 0,
        }
    }
}

impl CalendarSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.visible_end_hour > 24 {
            return Err(format!("visible end hour {} is past midnight", self.visible_end_hour));
        }
        if self.visible_end_hour <= self.visible_start_hour {
            return Err(format!(
                "visible window {}:00-{}:00 is empty",
                self.visible_start_hour, self.visible_end_hour
            ));
        }
        if !(self.pixels_per_minute > 0.0) {
            return Err("pixels per minute must be positive".to_string());
        }
        if self.slot_minutes == 0 || 60 % self.slot_minutes != 0 {
            return Err(format!("slot size of {} minutes does not divide an hour", self.slot_minutes));
        }
        if self.min_card_height_px < 0.0 {
            return Err("minimum card height cannot be negative".to_string());
        }
        if self.utc_offset().is_none() {
            return Err(format!("UTC offset of {} minutes is out of range", self.utc_offset_minutes));
        }
        Ok(())
    }

    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        let settings = Self {
            visible_start_hour: env_or("CALENDAR_VISIBLE_START_HOUR", defaults.visible_start_hour),
            visible_end_hour: env_or("CALENDAR_VISIBLE_END_HOUR", defaults.visible_end_hour),
            pixels_per_minute: env_or("CALENDAR_PIXELS_PER_MINUTE", defaults.pixels_per_minute),
            slot_minutes: env_or("CALENDAR_SLOT_MINUTES", defaults.slot_minutes),
            min_card_height_px: env_or("CALENDAR_MIN_CARD_HEIGHT_PX", defaults.min_card_height_px),
            lookahead_weeks: env_or("CALENDAR_LOOKAHEAD_WEEKS", defaults.lookahead_weeks),
            utc_offset_minutes: env_or("CLINIC_UTC_OFFSET_MINUTES", defaults.utc_offset_minutes),
        };

        match settings.validate() {
            Ok(()) => settings,
            Err(reason) => {
                warn!("Invalid calendar settings ({}), using defaults", reason);
                defaults
            }
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            notification_webhook_url: env::var("NOTIFICATION_WEBHOOK_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            soft_delete_occurrences: env_or("SOFT_DELETE_OCCURRENCES", true),
            calendar: CalendarSettings::from_env(),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }
}

fn env_or<T: FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has unparseable value {:?}, using {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
