//! HTTP mapping for the mint, steer, auth and verify endpoints.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::Utc;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST, LOCATION, REFERER, USER_AGENT};
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use percent_encoding::percent_decode_str;

use super::credential::{extract_credential, mask, parse_query};
use super::origin::CredentialValidator;
use super::service::{AccessService, VerifyOutcome, VerifyRequest};
use crate::access_log::{AccessLogger, AccessRecord, AccessResult};

/// Response type of every gateway handler.
pub type HttpResponse = Response<Full<Bytes>>;

/// Query parameters whose values are masked before logging.
const SECRET_PARAMS: [&str; 2] = ["api_key", "token"];

/// Mint a signed URL for the requested path and redirect to it.
pub async fn mint<V: CredentialValidator>(
    service: &AccessService<V>,
    log: &AccessLogger,
    parts: &Parts,
    remote: SocketAddr,
) -> HttpResponse {
    let started = Instant::now();
    let params = parse_query(parts.uri.query());
    let credential = extract_credential(&params, &parts.headers);
    let path = decoded_path(parts);

    let outcome = service.mint(&path, credential.as_deref()).await;
    let (response, result, reason, location) = match outcome {
        Ok(grant) => (
            redirect(StatusCode::FOUND, &grant.location),
            AccessResult::Success,
            "redirect".to_string(),
            Some(grant.location),
        ),
        Err(e) => (
            json_error(e.status(), &e.to_string()),
            AccessResult::Failed,
            e.reason().to_string(),
            None,
        ),
    };

    let mut record =
        access_record(parts, remote, &response, started, result, reason, credential.as_deref());
    record.redirect_url = location.map(|l| masked_uri(&l));
    record.original_path = Some(path);
    log.log(record);
    response
}

/// Send a fresh playback request straight to a healthy node.
pub async fn steer<V: CredentialValidator>(
    service: &AccessService<V>,
    log: &AccessLogger,
    parts: &Parts,
    remote: SocketAddr,
) -> HttpResponse {
    let started = Instant::now();
    let params = parse_query(parts.uri.query());
    let credential = extract_credential(&params, &parts.headers);
    let path = decoded_path(parts);

    let outcome = service.steer(&path, credential.as_deref()).await;
    let (response, result, reason, location) = match outcome {
        Ok(grant) => (
            redirect(StatusCode::TEMPORARY_REDIRECT, &grant.location),
            AccessResult::Success,
            "steered".to_string(),
            Some(grant.location),
        ),
        Err(e) => (
            json_error(e.status(), &e.to_string()),
            AccessResult::Failed,
            e.reason().to_string(),
            None,
        ),
    };

    let mut record =
        access_record(parts, remote, &response, started, result, reason, credential.as_deref());
    record.redirect_url = location.map(|l| masked_uri(&l));
    record.original_path = Some(path);
    log.log(record);
    response
}

/// Answer whether the caller's credential is valid.
pub async fn auth<V: CredentialValidator>(
    service: &AccessService<V>,
    log: &AccessLogger,
    parts: &Parts,
    remote: SocketAddr,
) -> HttpResponse {
    let started = Instant::now();
    let params = parse_query(parts.uri.query());
    let credential = extract_credential(&params, &parts.headers);

    let (response, result, reason) = match service.check(credential.as_deref()).await {
        Ok(()) => (empty(StatusCode::OK), AccessResult::Success, "authorized".to_string()),
        Err(e) => (
            json_error(e.status(), &e.to_string()),
            AccessResult::Failed,
            e.reason().to_string(),
        ),
    };

    let record =
        access_record(parts, remote, &response, started, result, reason, credential.as_deref());
    log.log(record);
    response
}

/// Decide whether the calling edge node may serve a request.
pub fn verify<V: CredentialValidator>(
    service: &AccessService<V>,
    log: &AccessLogger,
    parts: &Parts,
    remote: SocketAddr,
) -> HttpResponse {
    let started = Instant::now();
    let mut params = parse_query(parts.uri.query());
    let request = VerifyRequest {
        token: params.remove("token"),
        expires: params.remove("expires"),
        uid: params.remove("uid"),
        path: params.remove("path"),
        retry: params.remove("_retry"),
        node_host: node_host(parts, &service.settings().node_header),
    };

    let outcome = service.verify(&request);
    let response = match &outcome {
        VerifyOutcome::Failover { location, .. } => {
            redirect(StatusCode::TEMPORARY_REDIRECT, location)
        }
        other => empty(other.status()),
    };

    let result = if matches!(outcome, VerifyOutcome::Allow(_)) {
        AccessResult::Success
    } else {
        AccessResult::Failed
    };
    let reason = outcome.reason().to_string();
    let mut record = access_record(parts, remote, &response, started, result, reason, None);
    if let VerifyOutcome::Failover { location, .. } = &outcome {
        record.redirect_url = Some(masked_uri(location));
    }
    record.original_path = request.path;
    log.log(record);
    response
}

/// The request path with percent-escapes decoded.
fn decoded_path(parts: &Parts) -> String {
    percent_decode_str(parts.uri.path()).decode_utf8_lossy().into_owned()
}

/// The requesting node's host: the forwarding header if present, else `Host`.
fn node_host(parts: &Parts, node_header: &str) -> Option<String> {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    header(node_header)
        .or_else(|| header(HOST.as_str()))
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
}

fn access_record(
    parts: &Parts,
    remote: SocketAddr,
    response: &HttpResponse,
    started: Instant,
    result: AccessResult,
    reason: String,
    credential: Option<&str>,
) -> AccessRecord {
    let header = |name: HeaderName| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    AccessRecord {
        timestamp: Utc::now(),
        remote_ip: remote.ip().to_string(),
        method: parts.method.to_string(),
        uri: masked_uri(&parts.uri.to_string()),
        status: response.status().as_u16(),
        credential: credential.map(mask),
        user_agent: header(USER_AGENT),
        referer: header(REFERER),
        duration_ms: started.elapsed().as_millis() as u64,
        result,
        reason,
        redirect_url: None,
        original_path: None,
    }
}

/// `uri` with the values of credential-bearing query parameters masked.
pub fn masked_uri(uri: &str) -> String {
    let Some((base, query)) = uri.split_once('?') else {
        return uri.to_string();
    };
    let masked: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if SECRET_PARAMS.contains(&key) => format!("{key}={}", mask(value)),
            _ => pair.to_string(),
        })
        .collect();
    format!("{base}?{}", masked.join("&"))
}

/// A bodiless response with `status`.
pub fn empty(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// A JSON response with `status`.
pub fn json<T: serde::Serialize>(status: StatusCode, body: &T) -> HttpResponse {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "cannot serialize response body");
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn json_error(status: StatusCode, message: &str) -> HttpResponse {
    json(status, &HashMap::from([("error", message)]))
}

fn redirect(status: StatusCode, location: &str) -> HttpResponse {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = empty(status);
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => {
            tracing::error!("redirect target is not a valid header value");
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
