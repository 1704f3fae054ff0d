//! Structural validation of cached analysis results
//!
//! Persisted results may have been written by an older or newer build,
//! so stored JSON is checked field by field before it is deserialized.

use crate::types::AnalysisResult;
use serde_json::Value;
use std::time::Duration;

/// Check that a result carries a usable BPM and key
pub fn validate_result(result: &AnalysisResult) -> Result<(), String> {
    if !result.bpm.is_finite() || result.bpm <= 0.0 {
        return Err(format!("bpm must be a positive number, got {}", result.bpm));
    }
    if result.key.trim().is_empty() {
        return Err("key is empty".to_string());
    }
    if let Some(energy) = result.energy {
        if !energy.is_finite() {
            return Err("energy is not finite".to_string());
        }
    }
    if let Some(confidence) = result.confidence {
        if !confidence.is_finite() {
            return Err("confidence is not finite".to_string());
        }
    }
    if let Some(segments) = &result.segments {
        for seg in segments {
            if !seg.start_secs.is_finite() || !seg.end_secs.is_finite() || seg.end_secs < seg.start_secs {
                return Err(format!(
                    "segment {:.2}-{:.2} is malformed",
                    seg.start_secs, seg.end_secs
                ));
            }
        }
    }
    if let Some(beats) = &result.beats {
        if beats.iter().any(|b| !b.is_finite()) {
            return Err("beat positions contain non-finite values".to_string());
        }
    }
    Ok(())
}

/// Validate a stored JSON value and turn it into a result
pub fn parse_stored(value: &Value) -> Result<AnalysisResult, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "stored result is not an object".to_string())?;

    match obj.get("bpm").and_then(Value::as_f64) {
        Some(bpm) if bpm.is_finite() && bpm > 0.0 => {}
        Some(bpm) => return Err(format!("bpm must be a positive number, got {}", bpm)),
        None => return Err("bpm missing or non-numeric".to_string()),
    }
    match obj.get("key").and_then(Value::as_str) {
        Some(key) if !key.trim().is_empty() => {}
        _ => return Err("key missing, empty or not a string".to_string()),
    }

    let result: AnalysisResult = serde_json::from_value(value.clone())
        .map_err(|e| format!("stored result does not match schema: {}", e))?;
    validate_result(&result)?;
    Ok(result)
}

/// True when an entry cached at `cached_at_ms` is older than `max_age`
pub fn is_expired(cached_at_ms: i64, now_ms: i64, max_age: Duration) -> bool {
    let age_ms = now_ms.saturating_sub(cached_at_ms);
    age_ms > max_age.as_millis() as i64
}
