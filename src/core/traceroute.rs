//! Traceroute output parsing
//!
//! Turns the text printed by `traceroute` (Unix) or `tracert` (Windows)
//! into hops. Parsing is line-at-a-time so hops can be emitted while the
//! tool is still running. Process handling lives in `service::prober`.

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::Hop;

static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\d{1,3}\.){3}\d{1,3}").expect("valid IPv4 regex"));

/// Unix hop lines start with the hop number: ` 1  192.168.1.1  1.123 ms`
static UNIX_HOP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s+(.+)").expect("valid hop regex"));

/// tracert prints one column per probe: `  3     *        *        *     Request timed out.`
static WINDOWS_SILENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s\*\s+\*\s+\*").expect("valid silent-hop regex"));

/// Messages meaning the target name could not be resolved
const UNRESOLVABLE_MARKERS: &[&str] = &[
    "Unable to resolve",
    "unknown host",
    "Name or service not known",
    "Temporary failure in name resolution",
];

// =============================================================================
// PLATFORM
// =============================================================================

/// Which traceroute flavour produced the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    pub fn default_program(self) -> &'static str {
        match self {
            Platform::Unix => "traceroute",
            Platform::Windows => "tracert",
        }
    }

    /// Arguments for a numeric, IPv4-only trace of `target`
    pub fn args(self, target: &str, max_hops: u32, timeout_ms: u64) -> Vec<String> {
        match self {
            // -d no DNS, -h max hops, -w timeout (ms), -4 IPv4
            Platform::Windows => vec![
                "-d".to_string(),
                "-h".to_string(),
                max_hops.to_string(),
                "-w".to_string(),
                timeout_ms.to_string(),
                "-4".to_string(),
                target.to_string(),
            ],
            // -n numeric, -q 1 one probe per hop, -w timeout (s), -m max hops, -4 IPv4
            Platform::Unix => vec![
                "-n".to_string(),
                "-q".to_string(),
                "1".to_string(),
                "-w".to_string(),
                (timeout_ms / 1000).max(1).to_string(),
                "-m".to_string(),
                max_hops.to_string(),
                "-4".to_string(),
                target.to_string(),
            ],
        }
    }
}

// =============================================================================
// LINE CLASSIFICATION
// =============================================================================

/// What a single output line means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// A hop that answered from this address
    Answered(String),
    /// A hop that did not answer
    Silent,
    /// The target could not be resolved; nothing follows
    Unresolvable,
    /// Header, footer, or anything unrecognised
    Ignored,
}

pub fn first_ipv4(text: &str) -> Option<&str> {
    IPV4_RE.find(text).map(|m| m.as_str())
}

fn is_unresolvable(line: &str) -> bool {
    UNRESOLVABLE_MARKERS.iter().any(|m| line.contains(m))
}

pub fn classify_line(platform: Platform, line: &str) -> LineKind {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineKind::Ignored;
    }
    if is_unresolvable(trimmed) {
        return LineKind::Unresolvable;
    }

    match platform {
        Platform::Windows => {
            // The banner names the target address, so it must be skipped before
            // looking for an address
            if trimmed.starts_with("Tracing route")
                || trimmed.starts_with("over a maximum")
                || trimmed.contains("---")
            {
                return LineKind::Ignored;
            }
            if let Some(ip) = first_ipv4(line) {
                LineKind::Answered(ip.to_string())
            } else if WINDOWS_SILENT_RE.is_match(line) {
                LineKind::Silent
            } else {
                LineKind::Ignored
            }
        }
        Platform::Unix => {
            let Some(caps) = UNIX_HOP_RE.captures(line) else {
                return LineKind::Ignored;
            };
            let rest = caps.get(2).map_or("", |m| m.as_str());
            if let Some(ip) = first_ipv4(rest) {
                LineKind::Answered(ip.to_string())
            } else if rest.contains('*') {
                LineKind::Silent
            } else {
                LineKind::Ignored
            }
        }
    }
}

// =============================================================================
// HOP PARSER
// =============================================================================

/// Stateful line-to-hop converter.
///
/// Numbers hops 1, 2, 3, ... in emission order, stops for good once the
/// target is reported unresolvable or `max_hops` hops have been emitted.
#[derive(Debug, Clone)]
pub struct HopParser {
    platform: Platform,
    max_hops: u32,
    emitted: u32,
    finished: bool,
}

impl HopParser {
    pub fn new(platform: Platform, max_hops: u32) -> Self {
        Self {
            platform,
            max_hops,
            emitted: 0,
            finished: max_hops == 0,
        }
    }

    /// Whether no further hop can be produced
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one line of tool output
    pub fn push_line(&mut self, line: &str) -> Option<Hop> {
        if self.finished {
            return None;
        }
        let address = match classify_line(self.platform, line) {
            LineKind::Answered(ip) => Some(ip),
            LineKind::Silent => None,
            LineKind::Unresolvable => {
                self.finished = true;
                return None;
            }
            LineKind::Ignored => return None,
        };
        self.emitted += 1;
        if self.emitted >= self.max_hops {
            self.finished = true;
        }
        Some(Hop {
            index: self.emitted,
            address,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
