use ember_http::HttpRequest;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    ClientIp,
    ApiKey,
    BearerUser,
    IpAndUserAgent,
    EndpointPath,
}

impl Default for KeyStrategy {
    fn default() -> Self {
        Self::ClientIp
    }
}

impl KeyStrategy {
    pub fn extract(self, request: &HttpRequest, peer_ip: &str) -> String {
        match self {
            Self::ClientIp => client_ip(request, peer_ip),
            Self::ApiKey => api_key(request, peer_ip),
            Self::BearerUser => bearer_user(request, peer_ip),
            Self::IpAndUserAgent => ip_and_user_agent(request, peer_ip),
            Self::EndpointPath => request.path.clone(),
        }
    }
}

/// First entry of `X-Forwarded-For` when present (reverse-proxy deployments),
/// then `X-Real-IP`, then the connection's peer address.
pub fn client_ip(request: &HttpRequest, peer_ip: &str) -> String {
    if let Some(forwarded) = request.header("x-forwarded-for") {
        let first = forwarded.split(',').next().unwrap_or(forwarded).trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(real_ip) = request.header("x-real-ip") {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    peer_ip.to_string()
}

pub fn api_key(request: &HttpRequest, peer_ip: &str) -> String {
    if let Some(key) = request.header("x-api-key") {
        return key.to_string();
    }
    if let Some(key) = request.query_param("api_key") {
        return key.to_string();
    }
    client_ip(request, peer_ip)
}

pub fn bearer_user(request: &HttpRequest, peer_ip: &str) -> String {
    if let Some(auth) = request.header("authorization") {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return token.to_string();
        }
    }
    client_ip(request, peer_ip)
}

pub fn ip_and_user_agent(request: &HttpRequest, peer_ip: &str) -> String {
    let user_agent = request.header("user-agent").unwrap_or("unknown");
    format!("{}|{}", client_ip(request, peer_ip), user_agent)
}
