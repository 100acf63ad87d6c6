//! Per-tool progress parsers.
//!
//! Each external tool reports progress in its own textual dialect; the
//! quirks are contained here so the executor only sees normalized
//! 0..=100 gauges. A parser gets every output line and may answer with a
//! step and/or title percentage.

use regex::Regex;
use std::sync::LazyLock;

/// Which parser a step wants for its tool's output.
#[derive(Debug, Clone)]
pub enum ParserKind {
    /// Any "NN%" / "NN.N %" token.
    Percent,
    /// MakeMKV `PRGV:current,total,max` machine-readable progress.
    Makemkv,
    /// HandBrake `task N of M, X.Y %` encode progress.
    Handbrake,
    /// Raw byte counters ("NNN bytes"), scaled against an expected size
    /// when one is known; falls back to percent tokens.
    ByteCount(Option<u64>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    /// Current-step percentage, 0..=100.
    pub step: Option<f64>,
    /// Current-title percentage, only for multi-title tools.
    pub title: Option<f64>,
}

pub trait ProgressParser: Send {
    fn parse_line(&mut self, line: &str) -> Option<ProgressUpdate>;
}

pub fn parser_for(kind: &ParserKind) -> Box<dyn ProgressParser> {
    match kind {
        ParserKind::Percent => Box::new(PercentParser),
        ParserKind::Makemkv => Box::new(MakemkvParser),
        ParserKind::Handbrake => Box::new(HandbrakeParser),
        ParserKind::ByteCount(expected) => Box::new(ByteCountParser { expected: *expected }),
    }
}

// No look-behind in the regex crate; anchor on a non-digit boundary so
// "150%" does not yield a bogus "50".
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\d.])(\d{1,3}(?:\.\d+)?)\s*%").expect("static regex"));
static PRGV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PRGV:(\d+),(\d+),(\d+)").expect("static regex"));
static HB_TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)task\s+(\d+)\s+of\s+(\d+),\s*(\d{1,3}(?:\.\d+)?)\s*%").expect("static regex")
});
static BYTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+bytes").expect("static regex"));

fn find_percent(line: &str) -> Option<f64> {
    let caps = PERCENT_RE.captures(line)?;
    let v: f64 = caps.get(1)?.as_str().parse().ok()?;
    (0.0..=100.0).contains(&v).then_some(v)
}

struct PercentParser;

impl ProgressParser for PercentParser {
    fn parse_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        find_percent(line).map(|p| ProgressUpdate {
            step: Some(p),
            title: None,
        })
    }
}

struct MakemkvParser;

impl ProgressParser for MakemkvParser {
    fn parse_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        let caps = PRGV_RE.captures(line)?;
        let current: f64 = caps.get(1)?.as_str().parse().ok()?;
        let total: f64 = caps.get(2)?.as_str().parse().ok()?;
        let max: f64 = caps.get(3)?.as_str().parse().unwrap_or(65536.0);
        let max = if max > 0.0 { max } else { 65536.0 };

        let pct = |v: f64| (v.clamp(0.0, max) / max) * 100.0;
        Some(ProgressUpdate {
            step: Some(pct(total)),
            title: Some(pct(current)),
        })
    }
}

struct HandbrakeParser;

impl ProgressParser for HandbrakeParser {
    fn parse_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        let caps = HB_TASK_RE.captures(line)?;
        let task: f64 = caps.get(1)?.as_str().parse().ok()?;
        let of: f64 = caps.get(2)?.as_str().parse().ok()?;
        let pct: f64 = caps.get(3)?.as_str().parse().ok()?;
        if of < 1.0 || task < 1.0 {
            return None;
        }
        // Step gauge spans all titles; title gauge is the current encode
        let step = (((task - 1.0) + pct / 100.0) / of) * 100.0;
        Some(ProgressUpdate {
            step: Some(step.clamp(0.0, 100.0)),
            title: Some(pct.clamp(0.0, 100.0)),
        })
    }
}

struct ByteCountParser {
    expected: Option<u64>,
}

impl ProgressParser for ByteCountParser {
    fn parse_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        if let Some(expected) = self.expected.filter(|e| *e > 0)
            && let Some(caps) = BYTES_RE.captures(line)
            && let Ok(done) = caps.get(1).map(|m| m.as_str()).unwrap_or("0").parse::<f64>()
        {
            let pct = ((done / expected as f64) * 100.0).clamp(0.0, 100.0);
            return Some(ProgressUpdate {
                step: Some(pct),
                title: None,
            });
        }
        find_percent(line).map(|p| ProgressUpdate {
            step: Some(p),
            title: None,
        })
    }
}
