//! Per-session identity and credentials.
//!
//! A `ClientConfig` pins everything a session stamps onto its outgoing
//! messages: validated username, SHA-512 password digest, a UUID origin id,
//! and a monotonic sequence counter. Ports are claimed process-wide so two
//! live sessions cannot race for the same listener.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha512};
use uuid::Uuid;

/// Username the relay signs its own notices with.
pub const SERVER_USERNAME: &str = "SERVER";

/// Fixed delay applied to every password check, match or not.
const VERIFY_DELAY: Duration = Duration::from_millis(50);

/// Ports held by live configs in this process. Port 0 is the synthetic
/// "no listener" port and is never claimed.
static CLAIMED_PORTS: LazyLock<Mutex<HashSet<u16>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("username must start with an alphabetic character")]
    InvalidUsername,
    #[error("password must be at least 8 characters")]
    PasswordTooShort,
    #[error("port {0} is already in use by another session")]
    PortInUse(u16),
}

/// Identity and credentials for one chat session.
#[derive(Debug)]
pub struct ClientConfig {
    username: String,
    password_hash: [u8; 64],
    origin: String,
    sequence: AtomicU64,
    port: u16,
}

impl ClientConfig {
    /// Validates the credentials, claims the port, and mints a fresh origin
    /// id. The password is hashed immediately and never stored.
    pub fn new(username: &str, password: &str, port: u16) -> Result<Self, ConfigError> {
        if !username.chars().next().is_some_and(|c| c.is_alphabetic()) {
            return Err(ConfigError::InvalidUsername);
        }
        if password.chars().count() < 8 {
            return Err(ConfigError::PasswordTooShort);
        }
        if port != 0 {
            let mut claimed = CLAIMED_PORTS.lock().expect("port registry poisoned");
            if !claimed.insert(port) {
                return Err(ConfigError::PortInUse(port));
            }
        }
        Ok(Self {
            username: username.to_owned(),
            password_hash: hash_password(password),
            origin: Uuid::new_v4().to_string(),
            sequence: AtomicU64::new(0),
            port,
        })
    }

    /// Synthetic identity a relay signs its own notices with. Holds no port
    /// claim; the relay's listener port belongs to the session config.
    pub fn server_identity() -> Self {
        let secret = Uuid::new_v4().to_string();
        // "SERVER" and a 36-char secret always pass validation on port 0.
        Self::new(SERVER_USERNAME, &secret, 0).expect("server identity is always valid")
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The session's globally unique origin id (UUID v4).
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next message sequence number. Starts at 1, never repeats.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Constant-pattern password check: always burns the same fixed delay
    /// so response time reveals nothing about the match.
    pub fn verify_password(&self, password: &str) -> bool {
        std::thread::sleep(VERIFY_DELAY);
        hash_password(password) == self.password_hash
    }
}

impl Drop for ClientConfig {
    fn drop(&mut self) {
        if self.port != 0 {
            if let Ok(mut claimed) = CLAIMED_PORTS.lock() {
                claimed.remove(&self.port);
            }
        }
    }
}

fn hash_password(password: &str) -> [u8; 64] {
    Sha512::digest(password.as_bytes()).into()
}
