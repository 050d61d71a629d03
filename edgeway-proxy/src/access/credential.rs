//! Locating and masking caller credentials.

use hyper::header::{HeaderMap, AUTHORIZATION};
use std::collections::HashMap;

/// Header some clients use to carry the credential instead of the query string.
pub const TOKEN_HEADER: &str = "X-Emby-Token";

/// Decode a query string into its first value per key.
pub fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
    }
    params
}

/// The caller's credential from `api_key`, the token header, or a
/// `MediaBrowser Token="…"` authorization header, in that order.
pub fn extract_credential(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(key) = params.get("api_key").filter(|k| !k.is_empty()) {
        return Some(key.clone());
    }
    if let Some(key) = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
    {
        return Some(key.to_string());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(token_from_authorization)
}

fn token_from_authorization(value: &str) -> Option<String> {
    let (_, rest) = value.split_once("Token=")?;
    let token = rest.split(',').next()?.trim().trim_matches('"');
    (!token.is_empty()).then(|| token.to_string())
}

/// Keep only the first and last four characters of a credential for logs.
pub fn mask(credential: &str) -> String {
    if credential.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}
