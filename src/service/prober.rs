//! Process-backed path prober
//!
//! Runs the platform traceroute tool and turns its output into hops while
//! it is still running. stdout and stderr are merged into one line feed,
//! so resolver errors the tool prints on stderr end the probe. Dropping
//! the stream kills the process.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::core::traceroute::{HopParser, Platform};
use crate::core::traits::{HopStream, PathProber, ProbeError};
use crate::core::types::Hop;

use super::config::ProbeSettings;

pub struct TracerouteProber {
    program: String,
    platform: Platform,
    max_hops: u32,
    timeout_ms: u64,
}

impl TracerouteProber {
    pub fn new(settings: &ProbeSettings) -> Self {
        let platform = Platform::current();
        Self {
            program: settings
                .program
                .clone()
                .unwrap_or_else(|| platform.default_program().to_string()),
            platform,
            max_hops: settings.max_hops,
            timeout_ms: settings.timeout_ms,
        }
    }
}

impl PathProber for TracerouteProber {
    fn trace(&self, target: &str) -> Result<HopStream, ProbeError> {
        let args = self.platform.args(target, self.max_hops, self.timeout_ms);
        debug!(program = %self.program, ?args, "[PROBE] Spawning");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProbeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let (tx, lines) = unbounded();
        let pumped = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => spawn_pump(stdout, Source::Stdout, tx.clone())
                .and_then(|()| spawn_pump(stderr, Source::Stderr, tx)),
            _ => Err(std::io::Error::other("output not captured")),
        };
        if let Err(e) = pumped {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProbeError::Io(e));
        }

        Ok(Box::new(TracerouteStream {
            child,
            lines,
            parser: HopParser::new(self.platform, self.max_hops),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Stdout,
    Stderr,
}

fn spawn_pump(
    reader: impl Read + Send + 'static,
    source: Source,
    tx: Sender<String>,
) -> std::io::Result<()> {
    let name = match source {
        Source::Stdout => "probe-stdout",
        Source::Stderr => "probe-stderr",
    };
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || pump_lines(reader, source, tx))
        .map(|_| ())
}

/// Forward lines (lossy UTF-8, line ending stripped) until EOF or until
/// the stream is gone
fn pump_lines(reader: impl Read, source: Source, tx: Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if source == Source::Stderr && !line.trim().is_empty() {
                    debug!(line = %line.trim(), "[PROBE] stderr");
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(?source, error = %e, "[PROBE] Read failed");
                break;
            }
        }
    }
}

/// Hops read incrementally from a running traceroute
struct TracerouteStream {
    child: Child,
    lines: Receiver<String>,
    parser: HopParser,
}

impl Iterator for TracerouteStream {
    type Item = Hop;

    fn next(&mut self) -> Option<Hop> {
        while !self.parser.is_finished() {
            // Disconnected once both pipes reached EOF
            let line = self.lines.recv().ok()?;
            if let Some(hop) = self.parser.push_line(&line) {
                return Some(hop);
            }
        }
        None
    }
}

impl Drop for TracerouteStream {
    fn drop(&mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if self.child.kill().is_ok() {
                    debug!(pid = self.child.id(), "[PROBE] Killed traceroute");
                }
                let _ = self.child.wait();
            }
        }
    }
}
