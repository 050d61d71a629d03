//! Minting and verifying signed playback URLs.
//!
//! A mint validates the caller's credential once, then hands out a short-lived
//! URL whose token binds path, credential and expiry. Edge nodes call verify on
//! every request for that URL. Verify keeps a sliding session per
//! `(token, uid)` so a long playback outlives the token's own expiry, and
//! redirects the client to a healthy node when the one it is talking to has
//! been marked unhealthy. Fresh playback requests are steered to a healthy
//! node up front.
//!
//! Paths handed to this module are already percent-decoded; signatures are
//! computed over the decoded form.

use std::sync::Arc;
use std::time::Duration;

use edgeway_core::{Clock, Selector, SharedNode, SharedRoster, SweeperHandle, TtlCache};
use hyper::StatusCode;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::{error, info, warn};
use url::Url;

use super::credential::mask;
use super::origin::{CredentialValidator, OriginError};
use super::signer::UrlSigner;
use crate::config::AccessConfig;

/// Characters escaped when a decoded path goes back into a URL.
const PATH_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Why a mint was refused.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// No credential was supplied.
    #[error("missing api_key")]
    MissingCredential,
    /// The origin rejected the credential.
    #[error("invalid api_key")]
    InvalidCredential,
    /// The origin could not be asked.
    #[error("credential validation failed: {0}")]
    Origin(#[from] OriginError),
    /// The signing key is unusable.
    #[error("invalid signing secret")]
    Secret,
    /// No healthy node can take the request.
    #[error("no healthy node available")]
    NoHealthyNode,
    /// The selected node's host is not a usable URL.
    #[error("node {0} has an invalid host")]
    InvalidNodeHost(String),
}

impl AccessError {
    /// HTTP status reported to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::InvalidCredential => StatusCode::FORBIDDEN,
            Self::Origin(_) | Self::Secret => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoHealthyNode | Self::InvalidNodeHost(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short label for access logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_api_key",
            Self::InvalidCredential => "invalid_api_key",
            Self::Origin(_) => "validation_error",
            Self::Secret => "signer_error",
            Self::NoHealthyNode => "no_healthy_node",
            Self::InvalidNodeHost(_) => "invalid_node_host",
        }
    }
}

/// A freshly minted playback URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintGrant {
    /// Internal path the URL points at.
    pub internal_path: String,
    /// Signature over path, credential and expiry.
    pub token: String,
    /// Unix second after which the token alone no longer authorizes.
    pub expires: i64,
    /// Identity handle standing in for the credential.
    pub uid: String,
    /// Value for the redirect's `Location` header.
    pub location: String,
}

/// A fresh playback request routed to a healthy node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteerGrant {
    /// Name of the chosen node.
    pub node: String,
    /// Edge-facing URL on that node.
    pub location: String,
}

/// Query parameters of a verify call, plus the requesting node's host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyRequest {
    /// `token` parameter.
    pub token: Option<String>,
    /// `expires` parameter.
    pub expires: Option<String>,
    /// `uid` parameter.
    pub uid: Option<String>,
    /// `path` parameter: the internal path being fetched.
    pub path: Option<String>,
    /// `_retry` parameter.
    pub retry: Option<String>,
    /// Host of the edge node asking, from the forwarding header or `Host`.
    pub node_host: Option<String>,
}

/// How an allowed verification was authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowKind {
    /// First verification; a session was opened.
    SessionCreated,
    /// An open session was found and slid forward.
    SessionExtended,
}

/// Why a verification was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// One of `token`, `expires`, `uid`, `path` is absent.
    MissingParameters,
    /// The token expired and no live session covers it.
    TokenExpired,
    /// The identity handle is unknown or has been evicted.
    UnknownIdentity,
    /// The token does not match path, credential and expiry.
    BadSignature,
    /// The session idled past its sliding deadline.
    SessionExpired,
}

impl DenyReason {
    /// Short label for access logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingParameters => "missing_parameters",
            Self::TokenExpired => "token_expired",
            Self::UnknownIdentity => "invalid_uid",
            Self::BadSignature => "invalid_signature",
            Self::SessionExpired => "session_expired",
        }
    }
}

/// Why a verification could not be served at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// The client has already been redirected too many times.
    RetryLimit,
    /// The requesting node is unhealthy and no healthy replacement exists.
    NoHealthyNode,
    /// The chosen replacement's host is not a usable URL.
    InvalidNodeHost,
}

impl UnavailableReason {
    /// Short label for access logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryLimit => "retry_limit",
            Self::NoHealthyNode => "no_healthy_node",
            Self::InvalidNodeHost => "invalid_node_host",
        }
    }
}

/// Result of a verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Serve the request.
    Allow(AllowKind),
    /// Refuse the request.
    Deny(DenyReason),
    /// Nothing can serve the request.
    Unavailable(UnavailableReason),
    /// Send the client to another node.
    Failover {
        /// Redirect target on the replacement node.
        location: String,
        /// Name of the replacement node.
        node: String,
        /// `_retry` value carried by the redirect.
        retry: u32,
    },
}

impl VerifyOutcome {
    /// HTTP status reported to the edge node.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Allow(_) => StatusCode::OK,
            Self::Deny(_) => StatusCode::FORBIDDEN,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Failover { .. } => StatusCode::TEMPORARY_REDIRECT,
        }
    }

    /// Short label for access logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Allow(AllowKind::SessionCreated) => "session_created",
            Self::Allow(AllowKind::SessionExtended) => "session_extended",
            Self::Deny(reason) => reason.as_str(),
            Self::Unavailable(reason) => reason.as_str(),
            Self::Failover { .. } => "failover",
        }
    }
}

/// The signed URL access service.
pub struct AccessService<V> {
    validator: V,
    signer: UrlSigner,
    clock: Arc<dyn Clock>,
    roster: SharedRoster,
    selector: Selector,
    /// credential -> credential, present while a validation is memoized
    validated: Arc<TtlCache<String, String>>,
    /// identity handle -> credential
    identities: Arc<TtlCache<String, String>>,
    /// `token:uid` -> sliding session expiry in unix seconds
    sessions: Arc<TtlCache<String, i64>>,
    settings: AccessConfig,
}

impl<V> std::fmt::Debug for AccessService<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessService")
            .field("nodes", &self.roster.len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl<V: CredentialValidator> AccessService<V> {
    /// Build the service and its caches.
    pub fn new(
        settings: AccessConfig,
        validator: V,
        roster: SharedRoster,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AccessError> {
        let signer = UrlSigner::new(&settings.secret).map_err(|_| AccessError::Secret)?;
        Ok(Self {
            validator,
            signer,
            clock,
            selector: Selector::new(Arc::clone(&roster)),
            roster,
            validated: Arc::new(TtlCache::new(settings.credential_ttl)),
            identities: Arc::new(TtlCache::new(settings.handle_ttl)),
            sessions: Arc::new(TtlCache::new(settings.session_ttl)),
            settings,
        })
    }

    /// Start background sweeps of all three caches.
    pub fn spawn_sweepers(&self, period: Duration) -> Vec<SweeperHandle> {
        vec![
            self.validated.spawn_sweeper("validated_credentials", period),
            self.identities.spawn_sweeper("identity_handles", period),
            self.sessions.spawn_sweeper("playback_sessions", period),
        ]
    }

    /// Settings the service was built with.
    pub fn settings(&self) -> &AccessConfig {
        &self.settings
    }

    /// Number of tracked sessions, expired ones included until swept.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn token_ttl_secs(&self) -> i64 {
        self.settings.token_ttl.as_secs() as i64
    }

    /// The internal path for `request_path` under the mint prefix.
    pub fn internal_path(&self, request_path: &str) -> String {
        self.rebase(request_path, &self.settings.mint_prefix)
    }

    fn rebase(&self, request_path: &str, prefix: &str) -> String {
        match request_path.strip_prefix(prefix) {
            Some(rest) => format!("{}{rest}", self.settings.internal_prefix),
            None => request_path.to_string(),
        }
    }

    /// Validate `credential` without minting anything.
    pub async fn check(&self, credential: Option<&str>) -> Result<(), AccessError> {
        let credential = credential
            .filter(|c| !c.is_empty())
            .ok_or(AccessError::MissingCredential)?;
        if !self.validate_credential(credential).await? {
            warn!(credential = %mask(credential), "rejected invalid api_key");
            return Err(AccessError::InvalidCredential);
        }
        Ok(())
    }

    /// Validate `credential` and sign a URL for `request_path`.
    pub async fn mint(
        &self,
        request_path: &str,
        credential: Option<&str>,
    ) -> Result<MintGrant, AccessError> {
        self.check(credential).await?;
        let credential = credential.unwrap_or_default();

        let internal_path = self.internal_path(request_path);
        let expires = self.clock.now_unix() + self.token_ttl_secs();
        let token = self.signer.token(&internal_path, credential, expires);
        let uid = self.signer.identity_handle(credential);
        self.identities.set(uid.clone(), credential.to_string());

        let location = format!(
            "{}?token={token}&expires={expires}&uid={uid}",
            utf8_percent_encode(&internal_path, PATH_ESCAPES)
        );
        info!(
            credential = %mask(credential),
            path = %internal_path,
            expires,
            "minted signed url"
        );

        Ok(MintGrant {
            internal_path,
            token,
            expires,
            uid,
            location,
        })
    }

    /// Validate `credential` and send a fresh playback request under the
    /// steering prefix to a healthy node.
    pub async fn steer(
        &self,
        request_path: &str,
        credential: Option<&str>,
    ) -> Result<SteerGrant, AccessError> {
        self.check(credential).await?;
        let credential = credential.unwrap_or_default();

        let Some(node) = self.selector.select_node() else {
            error!(path = request_path, "no healthy node to steer to");
            return Err(AccessError::NoHealthyNode);
        };

        let internal_path = self.rebase(request_path, &self.settings.steer_prefix);
        let location = self
            .edge_location(node.host(), &internal_path, credential, None)
            .map_err(|e| {
                error!(node = node.name(), error = %e, "cannot build edge url");
                AccessError::InvalidNodeHost(node.name().to_string())
            })?;
        info!(node = node.name(), host = node.host(), path = %internal_path, "steered request");

        Ok(SteerGrant {
            node: node.name().to_string(),
            location,
        })
    }

    async fn validate_credential(&self, credential: &str) -> Result<bool, OriginError> {
        if self.validated.get(credential).is_some() {
            return Ok(true);
        }
        let valid = self.validator.validate(credential).await?;
        if valid {
            self.validated.set(credential.to_string(), credential.to_string());
        }
        Ok(valid)
    }

    /// Decide whether an edge node may serve a request for a signed URL.
    ///
    /// Checks run in a fixed order and the first failing one decides the
    /// outcome: parameters, retry cap, expiry, identity, signature, node
    /// health, session.
    pub fn verify(&self, request: &VerifyRequest) -> VerifyOutcome {
        let present =
            |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_owned);
        let (Some(token), Some(expires_raw), Some(uid), Some(path)) = (
            present(&request.token),
            present(&request.expires),
            present(&request.uid),
            present(&request.path),
        ) else {
            warn!("verify called without required parameters");
            return VerifyOutcome::Deny(DenyReason::MissingParameters);
        };

        let retry = parse_retry(request.retry.as_deref());
        if retry >= u64::from(self.settings.max_retries) {
            error!(retry, path = %path, "failover retry limit reached");
            return VerifyOutcome::Unavailable(UnavailableReason::RetryLimit);
        }
        // below the cap, so it fits
        let retry = retry as u32;

        let expires: i64 = expires_raw.parse().unwrap_or(0);
        let now = self.clock.now_unix();
        let session_key = format!("{token}:{uid}");

        // an open session outlives the token's own expiry
        if now > expires && !self.session_is_live(&session_key, now) {
            warn!(path = %path, "token expired");
            return VerifyOutcome::Deny(DenyReason::TokenExpired);
        }

        let Some(credential) = self.identities.get(uid.as_str()) else {
            warn!(path = %path, "unknown identity handle");
            return VerifyOutcome::Deny(DenyReason::UnknownIdentity);
        };

        if !self.signer.token_matches(&path, &credential, expires, &token) {
            warn!(path = %path, credential = %mask(&credential), "token signature mismatch");
            return VerifyOutcome::Deny(DenyReason::BadSignature);
        }

        if let Some(node) = request
            .node_host
            .as_deref()
            .and_then(|host| self.roster.find_by_host(host))
        {
            if !node.is_healthy() {
                return self.fail_over(&node, &path, &credential, retry, &session_key);
            }
        }

        let outcome = self.advance_session(&session_key, now, &credential, &path);
        if let VerifyOutcome::Allow(_) = outcome {
            // the handle lives as long as the session using it
            self.identities.set(uid, credential);
        }
        outcome
    }

    /// Whether a session exists and has not passed its deadline.
    /// An expired session is removed on sight.
    fn session_is_live(&self, session_key: &str, now: i64) -> bool {
        match self.sessions.get(session_key) {
            Some(deadline) if now <= deadline => true,
            Some(_) => {
                self.sessions.delete(session_key);
                false
            }
            None => false,
        }
    }

    fn advance_session(
        &self,
        session_key: &str,
        now: i64,
        credential: &str,
        path: &str,
    ) -> VerifyOutcome {
        let deadline = now + self.token_ttl_secs();

        match self.sessions.get(session_key) {
            Some(current) if now <= current => {
                self.sessions.set(session_key.to_string(), deadline);
                info!(credential = %mask(credential), path, deadline, "session extended");
                VerifyOutcome::Allow(AllowKind::SessionExtended)
            }
            Some(_) => {
                self.sessions.delete(session_key);
                warn!(path, "session idled past its deadline");
                VerifyOutcome::Deny(DenyReason::SessionExpired)
            }
            None => {
                self.sessions.set(session_key.to_string(), deadline);
                info!(credential = %mask(credential), path, deadline, "session created");
                VerifyOutcome::Allow(AllowKind::SessionCreated)
            }
        }
    }

    fn fail_over(
        &self,
        unhealthy: &SharedNode,
        path: &str,
        credential: &str,
        retry: u32,
        session_key: &str,
    ) -> VerifyOutcome {
        warn!(
            node = unhealthy.name(),
            host = unhealthy.host(),
            path,
            "requesting node unhealthy, failing over"
        );
        self.sessions.delete(session_key);

        let Some(replacement) = self.selector.select_node() else {
            error!(path, "no healthy node available for failover");
            return VerifyOutcome::Unavailable(UnavailableReason::NoHealthyNode);
        };

        let next_retry = retry + 1;
        match self.edge_location(replacement.host(), path, credential, Some(next_retry)) {
            Ok(location) => {
                info!(
                    node = replacement.name(),
                    host = replacement.host(),
                    retry = next_retry,
                    "redirecting to healthy node"
                );
                VerifyOutcome::Failover {
                    location,
                    node: replacement.name().to_string(),
                    retry: next_retry,
                }
            }
            Err(e) => {
                error!(node = replacement.name(), error = %e, "cannot build failover url");
                VerifyOutcome::Unavailable(UnavailableReason::InvalidNodeHost)
            }
        }
    }

    /// The edge-facing URL on `node_host` for `internal_path`, carrying the
    /// credential and, on failover, the retry count.
    fn edge_location(
        &self,
        node_host: &str,
        internal_path: &str,
        credential: &str,
        retry: Option<u32>,
    ) -> Result<String, url::ParseError> {
        let mut url = Url::parse(node_host)?;
        let public_path =
            internal_path.replacen(&self.settings.internal_prefix, &self.settings.edge_prefix, 1);
        url.set_path(&utf8_percent_encode(&public_path, PATH_ESCAPES).to_string());
        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api_key", credential);
            if let Some(retry) = retry {
                query.append_pair("_retry", &retry.to_string());
            }
        }
        Ok(url.to_string())
    }
}

/// The `_retry` count. Non-numeric input reads as 0; numbers too large to
/// represent saturate so they stay over any cap.
fn parse_retry(raw: Option<&str>) -> u64 {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return 0;
    };
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    raw.parse().unwrap_or(u64::MAX)
}
