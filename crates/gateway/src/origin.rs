//! Cross-origin policy shared by the realtime handshake and the control plane.

use axum::http::{HeaderValue, Method, header};
use tower_http::cors::{Any, CorsLayer};

/// Origins allowed to talk to the gateway from a browser.
#[derive(Debug, Clone, PartialEq)]
pub enum AllowedOrigins {
    /// No restriction (`*` or unset).
    Any,
    /// Exact origin matches only.
    List(Vec<HeaderValue>),
}

impl AllowedOrigins {
    /// Parses a comma-separated origin list. Empty or `*` allows any origin.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "*" {
            return Self::Any;
        }
        let origins: Vec<HeaderValue> = raw
            .split(',')
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect();
        if origins.is_empty() {
            Self::Any
        } else {
            Self::List(origins)
        }
    }

    /// Whether a handshake carrying `origin` may proceed.
    ///
    /// Requests without an `Origin` header come from non-browser clients
    /// and are let through.
    pub fn allows(&self, origin: Option<&HeaderValue>) -> bool {
        match (self, origin) {
            (Self::Any, _) | (Self::List(_), None) => true,
            (Self::List(list), Some(origin)) => list.iter().any(|allowed| allowed == origin),
        }
    }

    /// Builds the CORS layer for the control-plane routes.
    pub fn cors_layer(&self) -> CorsLayer {
        match self {
            Self::Any => CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
            // Credentials cannot be combined with wildcard methods/headers.
            Self::List(list) => CorsLayer::new()
                .allow_origin(list.clone())
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_credentials(true),
        }
    }
}
