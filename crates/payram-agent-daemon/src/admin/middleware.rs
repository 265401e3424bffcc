//! Admin authentication: bearer token plus IP allowlist.
//!
//! The gate runs in a fixed order: a server without a configured token
//! refuses everything with 500, a remote address that is neither
//! loopback nor inside an allowlisted CIDR gets 403, and only then is
//! the bearer token compared for 401. Loopback is always allowed
//! through the IP gate so local tooling works with just the token.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use super::response::respond_error;
use super::AppState;

const BEARER_PREFIX: &str = "Bearer ";

/// A parsed CIDR network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parses `addr/prefix`; returns `None` for malformed entries.
    #[must_use]
    pub fn parse(entry: &str) -> Option<Self> {
        let (addr, prefix) = entry.split_once('/')?;
        let network: IpAddr = addr.trim().parse().ok()?;
        let prefix: u8 = prefix.trim().parse().ok()?;

        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix <= max).then_some(Self { network, prefix })
    }

    /// Whether `ip` falls inside this network. Mixed address families
    /// never match.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 32 - u32::from(self.prefix);
                (u32::from(network) >> shift) == (u32::from(ip) >> shift)
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 128 - u32::from(self.prefix);
                (u128::from(network) >> shift) == (u128::from(ip) >> shift)
            }
            _ => false,
        }
    }
}

/// Parses a comma-separated allowlist, skipping malformed entries.
#[must_use]
pub fn parse_allowlist(raw: &str) -> Vec<Cidr> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(Cidr::parse)
        .collect()
}

/// The admin gate configuration.
#[derive(Debug, Clone)]
pub struct AdminGuard {
    token: Option<String>,
    allowlist: Vec<Cidr>,
}

/// One rejection from the gate.
#[derive(Debug)]
pub struct AuthRejection {
    /// HTTP status to answer with.
    pub status: StatusCode,
    /// Stable error code.
    pub code: &'static str,
    /// Human-readable detail.
    pub message: &'static str,
}

impl AdminGuard {
    /// Builds the guard from the configured token and raw allowlist.
    #[must_use]
    pub fn new(token: Option<String>, allowlist_raw: &str) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            allowlist: parse_allowlist(allowlist_raw),
        }
    }

    /// Runs the gate against one request's remote address and
    /// `Authorization` header.
    ///
    /// # Errors
    ///
    /// Returns the rejection to answer with when any check fails.
    pub fn check(
        &self,
        remote: Option<IpAddr>,
        auth_header: Option<&str>,
    ) -> Result<(), AuthRejection> {
        let Some(token) = &self.token else {
            return Err(AuthRejection {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "ADMIN_TOKEN_MISSING",
                message: "admin token not configured",
            });
        };

        if !self.ip_allowed(remote) {
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                code: "FORBIDDEN_IP",
                message: "request IP not allowed",
            });
        }

        let provided = auth_header
            .and_then(|header| header.strip_prefix(BEARER_PREFIX))
            .map(str::trim);
        match provided {
            Some(provided) if provided == token => Ok(()),
            _ => Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                code: "UNAUTHORIZED",
                message: "missing or invalid bearer token",
            }),
        }
    }

    fn ip_allowed(&self, remote: Option<IpAddr>) -> bool {
        let Some(ip) = remote else {
            return false;
        };
        let ip = ip.to_canonical();

        ip.is_loopback() || self.allowlist.iter().any(|cidr| cidr.contains(ip))
    }
}

/// Axum middleware applying the admin gate to every `/admin` route.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match state.guard.check(remote, auth_header) {
        Ok(()) => next.run(request).await,
        Err(rejection) => respond_error(rejection.status, rejection.code, rejection.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn cidr_contains_v4() {
        let cidr = Cidr::parse("10.1.2.0/24").unwrap();
        assert!(cidr.contains(ip("10.1.2.7")));
        assert!(!cidr.contains(ip("10.1.3.7")));
        assert!(!cidr.contains(ip("::1")));
    }

    #[test]
    fn cidr_contains_v6_and_zero_prefix() {
        let cidr = Cidr::parse("fd00::/8").unwrap();
        assert!(cidr.contains(ip("fd00::1")));
        assert!(!cidr.contains(ip("fe80::1")));

        let all = Cidr::parse("0.0.0.0/0").unwrap();
        assert!(all.contains(ip("203.0.113.9")));
    }

    #[test]
    fn malformed_allowlist_entries_are_skipped() {
        let list = parse_allowlist("10.0.0.0/8, not-a-cidr, , 192.168.1.0/33, fd00::/64");
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn missing_token_rejects_with_500_before_anything_else() {
        let guard = AdminGuard::new(None, "");
        let rejection = guard.check(Some(ip("127.0.0.1")), None).unwrap_err();
        assert_eq!(rejection.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(rejection.code, "ADMIN_TOKEN_MISSING");
    }

    #[test]
    fn non_loopback_outside_allowlist_is_forbidden() {
        let guard = AdminGuard::new(Some("tok".to_string()), "");
        let rejection = guard
            .check(Some(ip("203.0.113.9")), Some("Bearer tok"))
            .unwrap_err();
        assert_eq!(rejection.status, StatusCode::FORBIDDEN);
        assert_eq!(rejection.code, "FORBIDDEN_IP");
    }

    #[test]
    fn allowlisted_source_passes_the_ip_gate() {
        let guard = AdminGuard::new(Some("tok".to_string()), "203.0.113.0/24");
        guard
            .check(Some(ip("203.0.113.9")), Some("Bearer tok"))
            .unwrap();
    }

    #[test]
    fn loopback_is_always_allowed_through_the_ip_gate() {
        let guard = AdminGuard::new(Some("tok".to_string()), "");
        guard.check(Some(ip("127.0.0.1")), Some("Bearer tok")).unwrap();
        guard.check(Some(ip("::1")), Some("Bearer tok")).unwrap();
    }

    #[test]
    fn bad_or_missing_bearer_is_unauthorized() {
        let guard = AdminGuard::new(Some("tok".to_string()), "");

        for header in [None, Some("Bearer wrong"), Some("tok"), Some("Basic tok")] {
            let rejection = guard.check(Some(ip("127.0.0.1")), header).unwrap_err();
            assert_eq!(rejection.status, StatusCode::UNAUTHORIZED, "{header:?}");
            assert_eq!(rejection.code, "UNAUTHORIZED");
        }
    }

    #[test]
    fn bearer_token_tolerates_surrounding_whitespace() {
        let guard = AdminGuard::new(Some("tok".to_string()), "");
        guard
            .check(Some(ip("127.0.0.1")), Some("Bearer  tok "))
            .unwrap();
    }

    #[test]
    fn unknown_remote_address_is_forbidden() {
        let guard = AdminGuard::new(Some("tok".to_string()), "0.0.0.0/0");
        let rejection = guard.check(None, Some("Bearer tok")).unwrap_err();
        assert_eq!(rejection.code, "FORBIDDEN_IP");
    }
}
