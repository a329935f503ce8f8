//! Mines the engine's free-text diagnostic output for best-effort metrics.
//!
//! Nothing here is engine telemetry: the upload rate is `speed × 2` Mbps and
//! the dropped-frame counter grows by one per chunk that mentions `drop` or
//! `error`. Callers should treat both as rough indicators.

use std::sync::OnceLock;

use regex::Regex;

/// Mbps reported per unit of the engine's `speed=` multiplier.
pub const MBPS_PER_SPEED: f64 = 2.0;

/// Substrings that mean the ingest side will never accept the stream.
pub const FATAL_PATTERNS: [&str; 5] = [
    "connection refused",
    "404",
    "403",
    "http error",
    "no such file or directory",
];

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metrics {
    pub upload_rate_mbps: f64,
    pub dropped_frames: u64,
}

#[derive(Debug, Default)]
pub struct DiagnosticsParser {
    metrics: Metrics,
}

fn speed_regex() -> &'static Regex {
    static SPEED: OnceLock<Regex> = OnceLock::new();
    SPEED.get_or_init(|| {
        Regex::new(r"speed=\s*([0-9]+(?:\.[0-9]+)?)x").expect("speed pattern is valid")
    })
}

impl DiagnosticsParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one chunk and returns the fatal pattern it contains, if any.
    pub fn feed(&mut self, chunk: &str) -> Option<&'static str> {
        if let Some(speed) = speed_regex()
            .captures_iter(chunk)
            .last()
            .and_then(|caps| caps[1].parse::<f64>().ok())
        {
            self.metrics.upload_rate_mbps = speed * MBPS_PER_SPEED;
        }

        if chunk.contains("drop") || chunk.contains("error") {
            self.metrics.dropped_frames += 1;
        }

        let lowered = chunk.to_lowercase();
        FATAL_PATTERNS
            .iter()
            .copied()
            .find(|pattern| lowered.contains(pattern))
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    pub fn reset(&mut self) {
        self.metrics = Metrics::default();
    }
}
