//! Sentinel - license validation for Rust applications
//!
//! Sentinel authenticates signed license artifacts against a product's
//! Ed25519 public key, confirms them with a remote license authority and
//! keeps working offline through a bounded grace period. Verdicts are cached
//! so the host can query them cheaply, and a tamper-resistant clock stops a
//! rewound system clock from stretching the grace window.
//!
//! # Features
//!
//! - `http` - `HttpAuthority`, a JSON-over-HTTPS transport to the license
//!   authority. Enabled by default.
//!
//! # Example
//!
//! ```toml
//! # Use defaults (HTTP transport)
//! sentinel = { package = "netviper-sentinel", git = "https://github.com/dmriding/sentinel" }
//!
//! # Bring your own transport
//! sentinel = { package = "netviper-sentinel", git = "https://github.com/dmriding/sentinel", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use sentinel::{license_manager, Product, ProductVersion, PublicKey};
//!
//! let key = PublicKey::from_base64(PRODUCT_KEY)?;
//! let product = Product::new(42, "Parsers", key, None, ProductVersion::new("2.4.1"), None)?;
//!
//! let manager = license_manager(&product)?;
//! manager.load_cached().await?;
//! let validation = manager.validate(&artifact).await?;
//! if validation.verdict.is_usable() && manager.has_entitlement("export") {
//!     // ...
//! }
//! ```

// Ambient
pub mod config;
pub mod encryption;
pub mod errors;
pub mod logging;

// Data model
pub mod payload;
pub mod product;
pub mod verdict;

// Validation engine
pub mod clock;
pub mod manager;
pub mod offline;
pub mod online;
pub mod persistence;
pub mod revocation;
pub mod signature;

pub use clock::{Clock, ClockReading, MockClock, SystemClock, TrustClock};
pub use errors::{LicenseError, LicenseResult, NetworkError};
pub use manager::{license_manager, LicenseManager, LicenseManagerBuilder, ManagerRegistry, Validation};
pub use offline::OfflineValidator;
#[cfg(feature = "http")]
pub use online::HttpAuthority;
pub use online::{AuthorityRequest, AuthorityResponse, AuthorityStatus, AuthorityTransport, OnlineValidator};
pub use payload::{LicenseArtifact, LicensePayload};
pub use persistence::{FilePersistence, MemoryPersistence, Persistence};
pub use product::{Product, ProductVariant, ProductVersion, PublicKey, Store};
pub use revocation::{RevocationChecker, RevocationEntry, RevocationSnapshot, RevocationUpdate};
pub use signature::SignatureVerifier;
pub use verdict::{AuthorityTerms, Verdict, VerdictReason, VerdictSource, VerdictStatus};
