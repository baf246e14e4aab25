//! Bounded authentication recovery.
//!
//! The HTTP client resolves unauthorized responses through this state
//! machine: at most one access-token refresh and at most one full re-login
//! per original request. Each state permits a single transition, so the
//! retry budget is structural rather than a flag threaded through calls.

use tracing::debug;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AuthRetryState {
    Initial,
    RefreshAttempted,
    ReloginAttempted,
}

/// Next step the caller should take to recover an unauthorized request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryStep {
    /// Exchange the refresh token for a new token pair, then retry once.
    RefreshToken,
    /// Re-login with stored credentials, then retry once.
    Relogin,
    /// The retry budget is spent; propagate the error unchanged.
    GiveUp,
}

/// Per-request recovery state.
#[derive(Debug)]
pub struct AuthRetry {
    state: AuthRetryState,
}

impl AuthRetry {
    /// Creates the recovery tracker for a fresh request.
    pub fn new() -> Self {
        Self {
            state: AuthRetryState::Initial,
        }
    }

    /// Reports that the request itself was rejected as unauthorized.
    ///
    /// Only the first rejection earns a refresh attempt; a rejection on an
    /// already-retried request gives up.
    pub fn on_unauthorized_response(&mut self) -> RecoveryStep {
        match self.state {
            AuthRetryState::Initial => {
                self.state = AuthRetryState::RefreshAttempted;
                RecoveryStep::RefreshToken
            }
            AuthRetryState::RefreshAttempted | AuthRetryState::ReloginAttempted => {
                debug!(event = "auth_retry_budget_exhausted", state = ?self.state);
                RecoveryStep::GiveUp
            }
        }
    }

    /// Reports that the refresh attempt was itself rejected.
    ///
    /// A re-login is granted only when the refresh was refused on auth
    /// grounds (401/403) and credentials were retained; any other refresh
    /// failure propagates.
    pub fn on_refresh_rejected(
        &mut self,
        auth_rejection: bool,
        credentials_stored: bool,
    ) -> RecoveryStep {
        if self.state == AuthRetryState::RefreshAttempted && auth_rejection && credentials_stored {
            self.state = AuthRetryState::ReloginAttempted;
            RecoveryStep::Relogin
        } else {
            RecoveryStep::GiveUp
        }
    }
}

impl Default for AuthRetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthRetry, RecoveryStep};

    #[test]
    fn first_unauthorized_response_earns_one_refresh() {
        let mut retry = AuthRetry::new();
        assert_eq!(retry.on_unauthorized_response(), RecoveryStep::RefreshToken);
        assert_eq!(retry.on_unauthorized_response(), RecoveryStep::GiveUp);
        assert_eq!(retry.on_unauthorized_response(), RecoveryStep::GiveUp);
    }

    #[test]
    fn rejected_refresh_with_credentials_earns_one_relogin() {
        let mut retry = AuthRetry::new();
        assert_eq!(retry.on_unauthorized_response(), RecoveryStep::RefreshToken);
        assert_eq!(retry.on_refresh_rejected(true, true), RecoveryStep::Relogin);
        // A further unauthorized response after the re-login retry gives up.
        assert_eq!(retry.on_unauthorized_response(), RecoveryStep::GiveUp);
        assert_eq!(retry.on_refresh_rejected(true, true), RecoveryStep::GiveUp);
    }

    #[test]
    fn rejected_refresh_without_credentials_gives_up() {
        let mut retry = AuthRetry::new();
        assert_eq!(retry.on_unauthorized_response(), RecoveryStep::RefreshToken);
        assert_eq!(retry.on_refresh_rejected(true, false), RecoveryStep::GiveUp);
    }

    #[test]
    fn non_auth_refresh_failure_gives_up_even_with_credentials() {
        let mut retry = AuthRetry::new();
        assert_eq!(retry.on_unauthorized_response(), RecoveryStep::RefreshToken);
        assert_eq!(retry.on_refresh_rejected(false, true), RecoveryStep::GiveUp);
    }

    #[test]
    fn refresh_rejection_before_any_unauthorized_response_gives_up() {
        let mut retry = AuthRetry::new();
        assert_eq!(retry.on_refresh_rejected(true, true), RecoveryStep::GiveUp);
    }
}
