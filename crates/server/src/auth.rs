//! Bearer-token auth gate.
//!
//! All routes except `/health` require `Authorization: Bearer <token>`
//! (or `?token=<token>` for WebSocket upgrades). Loopback peers are
//! auto-trusted — the trust boundary is localhost plus the bearer token.
//!
//! Token resolution: `COMPANION_AUTH_TOKEN` env > `auth.json` > generate
//! 32 random bytes, hex-encode, persist with mode 0600.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::paths;
use crate::persist;

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthFile {
    token: String,
    created_at: String,
}

/// Issues and validates the daemon's long-lived bearer token.
pub struct AuthGate {
    token: String,
}

impl AuthGate {
    /// Load the token, generating and persisting one on first boot.
    pub fn load_or_create() -> anyhow::Result<Self> {
        if let Ok(env_token) = std::env::var("COMPANION_AUTH_TOKEN") {
            let trimmed = env_token.trim().to_string();
            if !trimmed.is_empty() {
                info!(
                    component = "auth",
                    event = "auth.token.from_env",
                    "Using auth token from environment"
                );
                return Ok(Self { token: trimmed });
            }
        }

        let path = paths::auth_path();
        if let Ok(content) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<AuthFile>(&content) {
                Ok(file) if !file.token.is_empty() => {
                    return Ok(Self { token: file.token });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        component = "auth",
                        event = "auth.token.corrupt",
                        error = %e,
                        "auth.json unreadable, regenerating token"
                    );
                }
            }
        }

        let token = generate_token()?;
        let file = AuthFile {
            token: token.clone(),
            created_at: companion_protocol::now_iso(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        persist::write_bytes_with_mode(&path, &json, Some(0o600))?;
        info!(
            component = "auth",
            event = "auth.token.generated",
            path = %path.display(),
            "Generated auth token"
        );
        Ok(Self { token })
    }

    #[cfg(test)]
    pub fn with_token(token: &str) -> Self {
        Self {
            token: token.to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn verify(&self, candidate: &str) -> bool {
        // Constant-time comparison over equal-length tokens.
        candidate.len() == self.token.len()
            && candidate
                .bytes()
                .zip(self.token.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    /// SVG QR code encoding the pairing URL for browser clients.
    pub fn pairing_qr_svg(&self, external_url: &str) -> anyhow::Result<String> {
        use qrcode::render::svg;
        use qrcode::QrCode;

        let payload = format!("{}/#token={}", external_url.trim_end_matches('/'), self.token);
        let code = QrCode::new(payload.as_bytes())?;
        Ok(code
            .render()
            .min_dimensions(240, 240)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#ffffff"))
            .build())
    }
}

fn generate_token() -> anyhow::Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; TOKEN_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("system RNG unavailable"))?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

/// True when the peer address is a loopback interface.
pub fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

/// Axum middleware enforcing the bearer token.
///
/// Skips authentication for `/health` and for loopback peers.
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        if is_loopback(addr) {
            return Ok(next.run(req).await);
        }
    }

    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(value) = auth_header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if gate.verify(token) {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    // ?token= query param (WebSocket upgrades can't set headers)
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if gate.verify(token) {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    Err(StatusCode::UNAUTHORIZED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_is_hex_64() {
        let token = generate_token().unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn verify_rejects_near_miss() {
        let gate = AuthGate::with_token("abc123");
        assert!(gate.verify("abc123"));
        assert!(!gate.verify("abc124"));
        assert!(!gate.verify("abc12"));
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback(&"127.0.0.1:80".parse().unwrap()));
        assert!(is_loopback(&"[::1]:80".parse().unwrap()));
        assert!(!is_loopback(&"192.168.1.4:80".parse().unwrap()));
    }

    #[test]
    fn qr_contains_svg() {
        let gate = AuthGate::with_token("deadbeef");
        let svg = gate.pairing_qr_svg("http://127.0.0.1:4000").unwrap();
        assert!(svg.contains("<svg"));
    }
}
