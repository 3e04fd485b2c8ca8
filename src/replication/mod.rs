//! Version resolution and the replication decision core.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Resolver   │────▶│  Constraint  │────▶│   Decision   │
//! │ (list+parse) │     │  (selection) │     │ (state cmp)  │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌──────────────┐                          ┌──────────────┐
//! │ VersionSet   │                          │    Driver    │
//! │ (parse/dedup)│                          │(side effects)│
//! └──────────────┘                          └──────────────┘
//! ```
//!
//! Everything up to the decision is pure computation over plain values; only
//! the driver talks to the registry client and the state store.
//!
//! # Modules
//!
//! - [`version_set`]: permissive version parsing and the ordered, deduped set
//! - [`constraint`]: semver range constraints and best-match selection
//! - [`resolver`]: one-shot latest-version resolution against the client
//! - [`decision`]: the no-downgrade decision state machine
//! - [`driver`]: the full reconciliation pass
//! - [`error`]: error taxonomy for the core

pub mod constraint;
pub mod decision;
pub mod driver;
pub mod error;
pub mod resolver;
pub mod version_set;
