//! Probe Engine
//!
//! An instrumented network measurement engine with the Web Connectivity
//! censorship analysis on top of it:
//!
//! - **Tracing transport**: resolvers, dialers, TLS handshakers and an
//!   HTTP transport that record every sub-operation into an event trace
//! - **Archival encoding**: turns a trace into the versioned measurement
//!   sub-documents (queries, TCP connects, TLS handshakes, requests, network
//!   events)
//! - **urlgetter**: one atomic measurement (HTTP fetch, DNS lookup, TLS
//!   handshake, TCP connect) and a concurrent fan-out over many of them
//! - **Web Connectivity**: compares what the probe sees with what a remote
//!   control sees and classifies the difference
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Web Connectivity measurer                     │
//! │   dns_lookup ─► connects (Multi) ─► measure ─► control ─► analyze│
//! └───────────────┬──────────────────────────────────────┬───────────┘
//!                 │                                      │
//!                 ▼                                      ▼
//! ┌──────────────────────────────┐        ┌──────────────────────────┐
//! │  urlgetter: Multi / Getter   │        │ analysis ─► summarize    │
//! │  Configurer ─► Runner        │        └──────────────────────────┘
//! └───────────────┬──────────────┘
//!                 │ one trace per Getter
//!                 ▼
//! ┌──────────────────────────────┐        ┌──────────────────────────┐
//! │  netx: resolver, dialer,     │ events │ archival: queries, tcp,  │
//! │  tlsx, httpx, errorx         ├───────►│ tls, requests, events    │
//! └──────────────────────────────┘        └──────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! probe-engine urlgetter https://www.example.com/
//! probe-engine web-connectivity https://www.example.com/ --helper https://th.example.org
//! probe-engine multi --inputs inputs.yaml
//! ```

pub mod archival;
pub mod context;
pub mod geoip;
pub mod httpheader;
pub mod logging;
pub mod model;
pub mod netx;
pub mod session;
pub mod urlgetter;
pub mod webconnectivity;

// Re-export key types for convenience
pub use context::Context;
pub use model::{ExperimentCallbacks, ExperimentMeasurer, Measurement, PrinterCallbacks};
pub use netx::errorx::NetError;
pub use session::{ExperimentSession, MockableSession, Session, SessionConfig};
