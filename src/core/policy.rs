use crate::core::error::FailureKind;
use crate::models::{JobRequest, MediaFormat};

/// Format-selector degradation ladder walked on repeated recoverable
/// failures. A policy parameter rather than a constant: callers may supply
/// their own rungs, `{height}` is substituted with the requested cap.
#[derive(Debug, Clone)]
pub struct FallbackLadder {
    /// Rungs used when the quality selector names an explicit tier.
    tiered: Vec<String>,
    /// Rungs used when the quality selector is "best".
    open: Vec<String>,
}

impl FallbackLadder {
    pub fn new(tiered: Vec<String>, open: Vec<String>) -> Self {
        Self { tiered, open }
    }

    /// Selector for the given video quality at the given zero-based attempt.
    /// Attempts past the last rung reuse the last rung.
    pub fn selector(&self, quality: &str, attempt: u32) -> String {
        let open_ended = quality.eq_ignore_ascii_case("best");
        let rungs = if open_ended { &self.open } else { &self.tiered };
        let rung = rungs
            .get(attempt as usize)
            .or_else(|| rungs.last())
            .cloned()
            .unwrap_or_else(|| "best".to_string());
        if open_ended {
            rung
        } else {
            rung.replace("{height}", &parse_height(quality).to_string())
        }
    }
}

impl Default for FallbackLadder {
    fn default() -> Self {
        Self {
            tiered: vec![
                "bv*[height<={height}]+ba/b[height<={height}]/best[height<={height}]/best"
                    .to_string(),
                "best[height<={height}][ext=mp4]/best[height<={height}]/best".to_string(),
                "best".to_string(),
            ],
            open: vec![
                "bv*+ba/best".to_string(),
                "best[ext=mp4]/best".to_string(),
                "best".to_string(),
            ],
        }
    }
}

fn parse_height(quality: &str) -> u32 {
    let digits: String = quality.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(1080)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

/// Decides whether a recoverable failure earns another attempt, and which
/// format selector each attempt uses.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub ladder: FallbackLadder,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, ladder: FallbackLadder) -> Self {
        Self {
            max_attempts,
            ladder,
        }
    }

    /// `attempts` is the number of attempts already consumed.
    pub fn decide(&self, attempts: u32, kind: FailureKind) -> RetryDecision {
        if kind.is_recoverable() && attempts < self.max_attempts {
            RetryDecision::Retry
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Format selector for the given zero-based attempt. Audio requests
    /// always pull the best audio stream; the bitrate is applied by the
    /// extraction post-processor instead.
    pub fn format_for(&self, request: &JobRequest, attempt: u32) -> String {
        match request.format {
            MediaFormat::Audio => "bestaudio/best".to_string(),
            MediaFormat::Video => self.ladder.selector(&request.quality, attempt),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, FallbackLadder::default())
    }
}
