//! Basic Auth enforcement for virtual hosts
//! Constant-time credential checks with a failure rate limiter per client address

use crate::vhost::AuthPolicy;
use base64::{Engine as _, engine::general_purpose};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long a verified credential pair stays memoized
const VERIFY_MEMO_TTL: Duration = Duration::from_secs(5 * 60);

/// Window over which failed attempts are counted
const FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// How often expired windows and memo entries are swept out
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of an auth check, mapped to a response by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Unauthorized,
    TooManyRequests,
}

/// Memoized bcrypt verification result
struct MemoizedVerify {
    matched: bool,
    at: Instant,
}

/// Failed-attempt window for one client address
struct FailureWindow {
    count: u32,
    window_start: Instant,
}

/// Shared auth state: realm, verification memo and per-client failure windows
pub struct AuthGate {
    realm: String,
    failure_threshold: u32,
    verify_memo: DashMap<(String, String), MemoizedVerify>,
    failures: DashMap<IpAddr, FailureWindow>,
    last_sweep: Mutex<Instant>,
}

impl AuthGate {
    /// Create a gate for the given realm; clients get `failure_threshold`
    /// failed attempts per window before requests are rejected outright
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            failure_threshold: 2,
            verify_memo: DashMap::new(),
            failures: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Check a request against a virtual host's auth policy
    ///
    /// Failed comparisons count toward the client's rate limit; a missing
    /// header does not. Once the limit is hit the credentials are not
    /// evaluated at all.
    pub async fn check(
        &self,
        policy: &AuthPolicy,
        authorization: Option<&str>,
        client_ip: IpAddr,
    ) -> AuthDecision {
        self.sweep_stale();

        let header = match authorization {
            Some(h) => h,
            None => return AuthDecision::Unauthorized,
        };

        if self.is_rate_limited(client_ip) {
            debug!("Rate limited auth attempt from {}", client_ip);
            return AuthDecision::TooManyRequests;
        }

        let (username, password) = match Self::decode_basic(header) {
            Some(creds) => creds,
            None => {
                self.record_failure(client_ip);
                return AuthDecision::Unauthorized;
            }
        };

        let user_ok = constant_time_eq(&username, &policy.username);
        let pass_ok = self.verify_password(&password, &policy.hash).await;

        if user_ok && pass_ok {
            AuthDecision::Allow
        } else {
            self.record_failure(client_ip);
            AuthDecision::Unauthorized
        }
    }

    /// Whether this client has used up its failed attempts for the window
    pub fn is_rate_limited(&self, client_ip: IpAddr) -> bool {
        if let Some(state) = self.failures.get(&client_ip) {
            if state.window_start.elapsed() < FAILURE_WINDOW && state.count >= self.failure_threshold {
                return true;
            }
        }
        false
    }

    /// Count a failed attempt against the client's current window
    pub fn record_failure(&self, client_ip: IpAddr) {
        let now = Instant::now();
        self.failures
            .entry(client_ip)
            .and_modify(|state| {
                if state.window_start.elapsed() >= FAILURE_WINDOW {
                    state.window_start = now;
                    state.count = 1;
                } else {
                    state.count += 1;
                }
            })
            .or_insert(FailureWindow {
                count: 1,
                window_start: now,
            });
    }

    /// Evict entries whose window or memo TTL has lapsed
    ///
    /// Runs at most once per `SWEEP_INTERVAL`; between sweeps the maps hold
    /// at most the addresses and credential pairs seen in one interval plus
    /// whatever is still live.
    fn sweep_stale(&self) {
        {
            let mut last = self.last_sweep.lock();
            if last.elapsed() < SWEEP_INTERVAL {
                return;
            }
            *last = Instant::now();
        }

        self.failures
            .retain(|_, state| state.window_start.elapsed() < FAILURE_WINDOW);
        self.verify_memo
            .retain(|_, entry| entry.at.elapsed() < VERIFY_MEMO_TTL);
    }

    /// bcrypt comparison on the blocking pool, memoized per credential pair
    async fn verify_password(&self, password: &str, hash: &str) -> bool {
        let memo_key = (password.to_string(), hash.to_string());

        if let Some(entry) = self.verify_memo.get(&memo_key) {
            if entry.at.elapsed() < VERIFY_MEMO_TTL {
                return entry.matched;
            }
        }
        self.verify_memo.remove(&memo_key);

        let password = password.to_string();
        let hash = hash.to_string();
        let matched = match tokio::task::spawn_blocking(move || bcrypt::verify(&password, &hash)).await {
            Ok(Ok(matched)) => matched,
            Ok(Err(e)) => {
                warn!("Stored password hash is not verifiable: {}", e);
                false
            }
            Err(e) => {
                warn!("Password verification task failed: {}", e);
                false
            }
        };

        self.verify_memo.insert(
            memo_key,
            MemoizedVerify {
                matched,
                at: Instant::now(),
            },
        );
        matched
    }

    /// Decode a `Basic` authorization header into username and password
    fn decode_basic(header: &str) -> Option<(String, String)> {
        let (scheme, encoded) = header.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }

        let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;

        let (username, password) = decoded.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }
}

/// Compare two strings without short-circuiting on the first difference
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, last))
    }

    fn policy(username: &str, password: &str) -> AuthPolicy {
        AuthPolicy {
            username: username.to_string(),
            hash: bcrypt::hash(password, 4).unwrap(),
        }
    }

    #[test]
    fn test_decode_basic() {
        // "admin:secret"
        let creds = AuthGate::decode_basic("Basic YWRtaW46c2VjcmV0").unwrap();
        assert_eq!(creds, ("admin".to_string(), "secret".to_string()));
    }

    #[test]
    fn test_decode_basic_password_with_colon() {
        let encoded = general_purpose::STANDARD.encode("user:pa:ss");
        let creds = AuthGate::decode_basic(&format!("Basic {}", encoded)).unwrap();
        assert_eq!(creds, ("user".to_string(), "pa:ss".to_string()));
    }

    #[test]
    fn test_decode_basic_rejects_other_schemes() {
        assert!(AuthGate::decode_basic("Bearer token123").is_none());
        assert!(AuthGate::decode_basic("Basic !!!").is_none());
        assert!(AuthGate::decode_basic("junk").is_none());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("admin", "admin"));
        assert!(!constant_time_eq("admin", "admim"));
        assert!(!constant_time_eq("admin", "administrator"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_rate_limit_window() {
        let gate = AuthGate::new("test");
        let ip = test_ip(1);

        assert!(!gate.is_rate_limited(ip));
        gate.record_failure(ip);
        assert!(!gate.is_rate_limited(ip));
        gate.record_failure(ip);
        assert!(gate.is_rate_limited(ip));

        // Other clients are unaffected
        assert!(!gate.is_rate_limited(test_ip(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_expired_state() {
        let gate = AuthGate::new("test");

        gate.failures.insert(
            test_ip(7),
            FailureWindow {
                count: 5,
                window_start: Instant::now(),
            },
        );
        gate.verify_memo.insert(
            ("hunter2".to_string(), "$2b$04$abcdefgh".to_string()),
            MemoizedVerify {
                matched: false,
                at: Instant::now(),
            },
        );

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        gate.failures.insert(
            test_ip(8),
            FailureWindow {
                count: 1,
                window_start: Instant::now(),
            },
        );

        gate.sweep_stale();

        // Lapsed windows and memo entries are gone, live ones stay
        assert!(!gate.failures.contains_key(&test_ip(7)));
        assert!(gate.failures.contains_key(&test_ip(8)));
        assert!(gate.verify_memo.is_empty());

        // Within the interval the sweep does not run again, even over
        // entries that are already due
        gate.failures.insert(
            test_ip(7),
            FailureWindow {
                count: 5,
                window_start: Instant::now() - Duration::from_secs(10 * 60),
            },
        );
        gate.sweep_stale();
        assert!(gate.failures.contains_key(&test_ip(7)));
    }

    #[tokio::test]
    async fn test_check_grants_valid_credentials() {
        let gate = AuthGate::new("test");
        let policy = policy("admin", "secret");
        let header = format!("Basic {}", general_purpose::STANDARD.encode("admin:secret"));

        let decision = gate.check(&policy, Some(&header), test_ip(3)).await;
        assert_eq!(decision, AuthDecision::Allow);

        // Memoized second pass
        let decision = gate.check(&policy, Some(&header), test_ip(3)).await;
        assert_eq!(decision, AuthDecision::Allow);
    }

    #[tokio::test]
    async fn test_check_missing_header_is_unauthorized() {
        let gate = AuthGate::new("test");
        let policy = policy("admin", "secret");

        let decision = gate.check(&policy, None, test_ip(4)).await;
        assert_eq!(decision, AuthDecision::Unauthorized);

        // Missing headers are not counted as failures
        assert!(!gate.is_rate_limited(test_ip(4)));
    }

    #[tokio::test]
    async fn test_check_wrong_password_then_rate_limited() {
        let gate = AuthGate::new("test");
        let policy = policy("admin", "secret");
        let bad = format!("Basic {}", general_purpose::STANDARD.encode("admin:wrong"));

        let ip = test_ip(5);
        assert_eq!(gate.check(&policy, Some(&bad), ip).await, AuthDecision::Unauthorized);
        assert_eq!(gate.check(&policy, Some(&bad), ip).await, AuthDecision::Unauthorized);

        // Third attempt is rejected before credential evaluation
        let good = format!("Basic {}", general_purpose::STANDARD.encode("admin:secret"));
        assert_eq!(gate.check(&policy, Some(&good), ip).await, AuthDecision::TooManyRequests);
    }

    #[tokio::test]
    async fn test_check_wrong_username() {
        let gate = AuthGate::new("test");
        let policy = policy("admin", "secret");
        let header = format!("Basic {}", general_purpose::STANDARD.encode("root:secret"));

        let decision = gate.check(&policy, Some(&header), test_ip(6)).await;
        assert_eq!(decision, AuthDecision::Unauthorized);
    }
}
