//! imgforge-token: HMAC-signed, repository-scoped push credentials (spec §4.C).
//!
//! The issuer and verifier are always the same process family, so this is
//! MAC-only — no asymmetric signing, no JWKS. Short TTLs bound the blast
//! radius of a leaked credential instead.

pub mod claims;
pub mod secret;
pub mod token;

pub use claims::{Claims, Scope};
pub use secret::HmacSecret;
pub use token::{TokenError, TokenIssuer};
