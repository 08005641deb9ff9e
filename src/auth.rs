//! Operator authentication and route guarding

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};

use crate::config::AuthConfig;
use crate::errors::FloodScoutError;

pub const LOGIN_PATH: &str = "/";
pub const DASHBOARD_PATH: &str = "/dashboard";
pub const HISTORY_PATH: &str = "/dashboard/history";
pub const COOKIE_NAME: &str = "isAuthenticated";

/// Paths reachable without a session
const PUBLIC_PATHS: [&str; 2] = [LOGIN_PATH, HISTORY_PATH];

/// Checks operator credentials against the configured pair
#[derive(Debug, Clone)]
pub struct Authenticator {
    username: String,
    password: String,
    max_age: Duration,
}

/// An authenticated operator session
///
/// Created at login, invalid after logout or once `max_age` has passed.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    username: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    max_age: Duration,
    invalidated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Allow,
    Redirect(&'static str),
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
            max_age: config.session_max_age,
        }
    }

    pub fn login(&self, username: &str, password: &str) -> Result<Session, FloodScoutError> {
        self.login_at(username, password, Utc::now())
    }

    pub fn login_at(
        &self,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, FloodScoutError> {
        if username != self.username || password != self.password {
            warn!(username, "Rejected login");
            return Err(FloodScoutError::InvalidCredentials);
        }

        let lifetime =
            TimeDelta::from_std(self.max_age).map_err(|e| FloodScoutError::ConfigurationError {
                message: format!("Session max age out of range: {}", e),
            })?;
        info!(username, "Operator logged in");
        Ok(Session {
            username: username.to_string(),
            created_at: now,
            expires_at: now + lifetime,
            max_age: self.max_age,
            invalidated: false,
        })
    }
}

impl Session {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.invalidated && now < self.expires_at
    }

    /// `Ok` while the session may act, otherwise why not
    pub fn ensure_active(&self, now: DateTime<Utc>) -> Result<(), FloodScoutError> {
        if self.is_active(now) {
            Ok(())
        } else {
            Err(FloodScoutError::SessionExpired)
        }
    }

    pub fn logout(&mut self) {
        if !self.invalidated {
            info!(username = %self.username, "Operator logged out");
        }
        self.invalidated = true;
    }

    /// Session marker as a `Set-Cookie` value
    pub fn cookie(&self) -> String {
        format!(
            "{COOKIE_NAME}=true; Path=/; Max-Age={}",
            self.max_age.as_secs()
        )
    }
}

/// Decide whether a request for `path` may proceed
///
/// Without an active session only public paths are reachable; with one,
/// public paths bounce to the dashboard.
pub fn guard(path: &str, session: Option<&Session>, now: DateTime<Utc>) -> RouteDecision {
    let authenticated = session.is_some_and(|s| s.is_active(now));
    let public = PUBLIC_PATHS.contains(&path);

    match (authenticated, public) {
        (false, false) => RouteDecision::Redirect(LOGIN_PATH),
        (true, true) => RouteDecision::Redirect(DASHBOARD_PATH),
        _ => RouteDecision::Allow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn authenticator() -> Authenticator {
        Authenticator::new(&AuthConfig::default())
    }

    #[test]
    fn login_with_valid_credentials() {
        let session = authenticator().login_at("admin", "admin", now()).unwrap();

        assert_eq!(session.username(), "admin");
        assert_eq!(session.created_at(), now());
        assert_eq!(session.expires_at(), now() + TimeDelta::hours(1));
        assert!(session.is_active(now()));
        assert_eq!(session.cookie(), "isAuthenticated=true; Path=/; Max-Age=3600");
    }

    #[test]
    fn login_with_invalid_credentials() {
        let result = authenticator().login_at("admin", "hunter2", now());
        assert!(matches!(result, Err(FloodScoutError::InvalidCredentials)));
        assert_eq!(
            result.unwrap_err().to_string(),
            "Invalid username or password"
        );
    }

    #[test]
    fn session_expires_and_logs_out() {
        let mut session = authenticator().login_at("admin", "admin", now()).unwrap();
        let later = now() + TimeDelta::minutes(61);
        assert!(!session.is_active(later));
        assert!(matches!(
            session.ensure_active(later),
            Err(FloodScoutError::SessionExpired)
        ));

        assert!(session.ensure_active(now()).is_ok());
        session.logout();
        assert!(!session.is_active(now()));
    }

    #[test]
    fn guard_redirects() {
        let session = authenticator().login_at("admin", "admin", now()).unwrap();

        assert_eq!(guard("/dashboard", None, now()), RouteDecision::Redirect("/"));
        assert_eq!(guard("/history", None, now()), RouteDecision::Redirect("/"));
        assert_eq!(guard("/", None, now()), RouteDecision::Allow);
        assert_eq!(guard("/dashboard/history", None, now()), RouteDecision::Allow);

        assert_eq!(guard("/dashboard", Some(&session), now()), RouteDecision::Allow);
        assert_eq!(
            guard("/", Some(&session), now()),
            RouteDecision::Redirect("/dashboard")
        );

        let expired = now() + TimeDelta::hours(2);
        assert_eq!(
            guard("/dashboard", Some(&session), expired),
            RouteDecision::Redirect("/")
        );
    }
}
