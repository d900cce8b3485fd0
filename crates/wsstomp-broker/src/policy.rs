//! Collaborators a session consults: credential checks and the heart-beat interval.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default liveness interval advertised to clients.
pub const DEFAULT_HEART_BEAT: Duration = Duration::from_secs(5);

/// Decides whether a CONNECT frame's credentials are acceptable.
///
/// Called once per CONNECT. Missing `login`/`passcode` headers arrive as
/// empty strings.
pub trait Authenticator: Send + Sync + 'static {
    /// `true` to accept the connection.
    fn authenticate(&self, login: &str, passcode: &str) -> bool;
}

/// Reports the liveness interval a session negotiates with its client.
pub trait HeartBeat: Send + Sync + 'static {
    /// Interval to advertise and enforce. Zero disables heart-beating.
    fn heart_beat(&self) -> Duration;
}

/// Accepts every client.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _login: &str, _passcode: &str) -> bool {
        true
    }
}

/// Fixed login → passcode table.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    /// Build from `(login, passcode)` pairs.
    pub fn new<I, K, V>(users: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            users: users
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Number of known logins.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no login is known.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for StaticCredentials {
    fn authenticate(&self, login: &str, passcode: &str) -> bool {
        self.users.get(login).is_some_and(|p| p == passcode)
    }
}

/// Constant heart-beat interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedHeartBeat(pub Duration);

impl Default for FixedHeartBeat {
    fn default() -> Self {
        Self(DEFAULT_HEART_BEAT)
    }
}

impl HeartBeat for FixedHeartBeat {
    fn heart_beat(&self) -> Duration {
        self.0
    }
}

/// Everything a session needs from the outside world, shared by all connections.
#[derive(Clone)]
pub struct SessionPolicy {
    /// Credential check for CONNECT.
    pub authenticator: Arc<dyn Authenticator>,
    /// Liveness interval source.
    pub heart_beat: Arc<dyn HeartBeat>,
}

impl SessionPolicy {
    /// Policy with the given collaborators.
    pub fn new(authenticator: Arc<dyn Authenticator>, heart_beat: Arc<dyn HeartBeat>) -> Self {
        Self {
            authenticator,
            heart_beat,
        }
    }

    /// Replace the authenticator.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// Replace the heart-beat source with a fixed interval.
    #[must_use]
    pub fn with_heart_beat(mut self, interval: Duration) -> Self {
        self.heart_beat = Arc::new(FixedHeartBeat(interval));
        self
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new(Arc::new(AllowAll), Arc::new(FixedHeartBeat::default()))
    }
}

impl fmt::Debug for SessionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPolicy")
            .field("heart_beat", &self.heart_beat.heart_beat())
            .finish_non_exhaustive()
    }
}
