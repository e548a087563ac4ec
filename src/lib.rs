//! Traceroute Race - geofenced network path racing
//!
//! Participants run path probes; a probe whose last geolocated hop lands
//! inside the active challenge's geofence finishes the race and is ranked
//! in arrival order.
//!
//! `core` holds the engine and has no I/O of its own. `service` wires it to
//! the traceroute process, the geolocation API, SQLite and the observer feed.
//!
//! Lock order, for any path that ever needs more than one:
//! players → challenges → records → sessions → db. Across processes
//! sharing one database file, rank assignment is serialized by an
//! immediate SQLite transaction.
//! Each entity family has its own lock and the orchestrator never holds two
//! at once; the records lock is held across the db lock during a durable
//! write.

pub mod core;
pub mod service;
