//! Signed playback URLs: minting, steering, verification and sliding sessions.

pub mod credential;
pub mod http;
pub mod origin;
pub mod service;
pub mod signer;

pub use origin::{CredentialValidator, HttpCredentialValidator, OriginError};
pub use service::{
    AccessError, AccessService, AllowKind, DenyReason, MintGrant, SteerGrant, UnavailableReason,
    VerifyOutcome, VerifyRequest,
};
pub use signer::UrlSigner;
