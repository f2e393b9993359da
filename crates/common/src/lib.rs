//! Common types shared by the zonecert crates.
//!
//! - [`Zone`]: validated domain name under certificate management
//! - [`ChallengeType`]: ACME challenge types the responders implement
//! - [`ClientAuthMode`]: client certificate policy for served TLS

pub mod types;
pub mod zone;

pub use types::{ChallengeType, ClientAuthMode, UnknownToken};
pub use zone::{Zone, ZoneError};
