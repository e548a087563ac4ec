//! Formatting utilities for race data display.

/// Format a place as `City, Country`, substituting `Unknown` for missing or
/// empty parts.
pub fn format_location(city: Option<&str>, country: Option<&str>) -> String {
    let part = |s: Option<&str>| match s {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => "Unknown".to_string(),
    };
    format!("{}, {}", part(city), part(country))
}

/// Round a distance to two decimals for client-facing events.
pub fn round_km(km: f64) -> f64 {
    (km * 100.0).round() / 100.0
}

/// Format elapsed seconds as `M:SS` or `H:MM:SS`.
pub fn format_elapsed(seconds: f64) -> String {
    let secs = seconds.max(0.0) as u64;
    let mins = secs / 60;
    let hours = mins / 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, mins % 60, secs % 60)
    } else {
        format!("{}:{:02}", mins, secs % 60)
    }
}
