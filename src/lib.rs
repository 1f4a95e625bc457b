//! `ecoscan`: dependency ecosystem analysis across many Cargo repositories.
//!
//! The engine discovers repositories under a root, parses their manifests,
//! resolves the latest version of every distinct dependency (registry or git
//! remote, each call time-bounded), caches the result keyed by a content hash
//! of the tree, and derives conflict / hub / outdated views from the cache.
//!
//! ```no_run
//! use ecoscan::{aggregate::Ecosystem, config::ScanConfig, scanner::Scanner};
//!
//! let config = ScanConfig::new("/src/rust").with_hub("hub");
//! let scanner = Scanner::with_network_resolver(config)?;
//! let outcome = scanner.scan()?;
//! let eco = Ecosystem::new(&outcome.snapshot, Some("hub"));
//! for c in eco.conflicts() {
//!     println!("{}: {:?}", c.name, c.versions.keys().collect::<Vec<_>>());
//! }
//! # Ok::<(), ecoscan::error::Error>(())
//! ```

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod manifest;
pub mod model;
pub mod resolve;
pub mod scanner;
pub mod version;
