//! Shared-secret authentication for the HTTP surface.
//!
//! User endpoints accept the API key either as a `key` query parameter
//! (removed from the query before it is forwarded upstream) or as an
//! `Authorization: Bearer` header. Admin endpoints accept only the bearer
//! header with the admin key.

use hyper::header::AUTHORIZATION;
use hyper::http::HeaderMap;
use url::form_urlencoded;

/// Outcome of the user-endpoint gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAuth {
    /// Request is authorized; `forward_query` is the query string to send
    /// upstream, with the `key` parameter stripped.
    Allowed { forward_query: Option<String> },
    /// Wrong or missing credentials.
    Denied,
    /// The query string could not be parsed.
    BadRequest,
}

/// Check a user request against the API key.
pub fn authorize_user(query: Option<&str>, headers: &HeaderMap, api_key: &str) -> UserAuth {
    let Some(query) = query else {
        return match bearer_token(headers) {
            Some(token) if token == api_key => UserAuth::Allowed {
                forward_query: None,
            },
            _ => UserAuth::Denied,
        };
    };

    if !valid_percent_encoding(query) {
        return UserAuth::BadRequest;
    }

    let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    match pairs.iter().find(|(name, _)| name == "key") {
        Some((_, value)) => {
            if value != api_key {
                return UserAuth::Denied;
            }
            UserAuth::Allowed {
                forward_query: strip_key(&pairs),
            }
        }
        None => match bearer_token(headers) {
            Some(token) if token == api_key => UserAuth::Allowed {
                forward_query: Some(query.to_string()),
            },
            _ => UserAuth::Denied,
        },
    }
}

/// Check an admin request against the admin API key.
pub fn authorize_admin(headers: &HeaderMap, admin_api_key: &str) -> bool {
    matches!(bearer_token(headers), Some(token) if token == admin_api_key)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme != "Bearer" || token.is_empty() || token.contains(' ') {
        return None;
    }
    Some(token)
}

/// Re-encode the query without the `key` parameter. `None` when nothing
/// else was in the query.
fn strip_key(pairs: &[(String, String)]) -> Option<String> {
    let rest: Vec<&(String, String)> = pairs.iter().filter(|(name, _)| name != "key").collect();
    if rest.is_empty() {
        return None;
    }
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in rest {
        serializer.append_pair(name, value);
    }
    Some(serializer.finish())
}

/// Every `%` must introduce a two-digit hex escape.
fn valid_percent_encoding(query: &str) -> bool {
    let bytes = query.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}
