//! Core traits - abstractions over the engine's external collaborators
//!
//! The orchestrator only talks to the outside world through these traits.
//! The real implementations live in the `service` module (process-backed
//! traceroute, HTTP geolocation, database-backed directories); tests use
//! the mocks below.

use std::io;

use thiserror::Error;

use super::model::{Challenge, Participant};
use super::types::{Hop, HopLocation};

/// Lazy, finite, non-restartable sequence of hops
pub type HopStream = Box<dyn Iterator<Item = Hop> + Send>;

// =============================================================================
// PATH PROBER
// =============================================================================

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The path-tracing tool could not be launched
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("probe I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Runs a path probe towards a target
pub trait PathProber: Send + Sync {
    /// Start probing `target`.
    ///
    /// Fails only when the probe cannot start at all; everything after that
    /// is reflected in the hops the stream yields (or doesn't).
    fn trace(&self, target: &str) -> Result<HopStream, ProbeError>;
}

// =============================================================================
// HOP LOCATOR
// =============================================================================

/// Resolves an address to a location.
///
/// Best effort: any failure (network, timeout, bad status, malformed body)
/// is `None`. No caching, no retries.
pub trait HopLocator: Send + Sync {
    fn locate(&self, address: &str) -> Option<HopLocation>;
}

// =============================================================================
// DIRECTORIES
// =============================================================================

/// Read-only view of registered participants
pub trait PlayerDirectory: Send + Sync {
    fn participant(&self, id: &str) -> Option<Participant>;
}

/// Read-only view of challenges
pub trait ChallengeDirectory: Send + Sync {
    /// The challenge whose window contains now; first match wins when
    /// several overlap
    fn active_challenge(&self) -> Option<Challenge>;

    /// A known challenge by id
    fn challenge(&self, id: &str) -> Option<Challenge>;
}

// =============================================================================
// TEST MOCKS
// =============================================================================


// =============================================================================
// TESTS
// =============================================================================
