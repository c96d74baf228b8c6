use chrono::{DateTime, Local, TimeZone};
use reqwest::Url;

use crate::error::ProctorError;

/// Capture time of a segment, read from its filename stem.
///
/// Segment uploads are named `<unix seconds>.<ext>`, e.g.
/// `https://bucket.example/sub-1/1700000000.webm?X-Amz-Signature=...`.
pub fn capture_timestamp(url: &str) -> Result<i64, ProctorError> {
    let parsed = Url::parse(url).map_err(|_| ProctorError::MalformedUrl(url.to_string()))?;
    let filename = parsed
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ProctorError::MalformedUrl(url.to_string()))?;
    let stem = filename.split('.').next().unwrap_or(filename);
    stem.parse::<i64>()
        .map_err(|_| ProctorError::MalformedUrl(url.to_string()))
}

/// Wall-clock label (`HH:MM:SS`) for a playback position inside a segment.
pub fn capture_clock_in<Tz: TimeZone>(url: &str, offset_secs: f64, tz: &Tz) -> Option<String>
where
    Tz::Offset: std::fmt::Display,
{
    let captured = capture_timestamp(url).ok()?;
    let at = captured.checked_add(offset_secs.max(0.0).floor() as i64)?;
    let utc = DateTime::from_timestamp(at, 0)?;
    Some(utc.with_timezone(tz).format("%H:%M:%S").to_string())
}

pub fn capture_clock(url: &str, offset_secs: f64) -> Option<String> {
    capture_clock_in(url, offset_secs, &Local)
}
