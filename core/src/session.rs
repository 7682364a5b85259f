//! Authenticated session with the remote service.

use std::time::Duration;

use chrono::Utc;

use crate::clock::{system_clock, SharedClock};
use crate::expiring::ExpiringValue;
use crate::types::SessionGrant;

/// A session token that is only handed out while it is still valid.
#[derive(Debug, Clone)]
pub struct Session {
    token: ExpiringValue<String>,
}

impl Session {
    /// A session that has not been created yet.
    pub fn none() -> Self {
        Self::none_with_clock(system_clock())
    }

    pub fn none_with_clock(clock: SharedClock) -> Self {
        Self {
            token: ExpiringValue::expired_with_clock(clock),
        }
    }

    /// Converts the server's wall-clock expiry into a lifespan on `clock`.
    pub fn from_grant(grant: &SessionGrant, clock: SharedClock) -> Self {
        let lifespan = (grant.expires - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        Self {
            token: ExpiringValue::expire_in_with_clock(grant.session.clone(), lifespan, clock),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.token.is_alive()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.poll().map(String::as_str)
    }

    /// Value of the `Authorization` header while the session is alive.
    pub fn authorization(&self) -> Option<String> {
        self.token().map(|token| format!("OreApi session={token}"))
    }

    pub fn destroy(&mut self) {
        self.token.destroy();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::none()
    }
}
