//! The join-request gate.
//!
//! A small state machine layered on the connection: it records the
//! pending requester, counts the response window down tick by tick, and
//! tells the engine when to prompt, auto-deny, or clean up.

use presio_protocol::{PartyPrivacy, User};
use tracing::debug;

/// Default response window, in ticks.
pub const DEFAULT_TIMEOUT_TICKS: u32 = 30;

/// Tracks the pending inbound join request, if any.
#[derive(Debug)]
pub struct JoinGate {
    requester: Option<User>,
    remaining: u32,
    timeout_ticks: u32,
}

impl JoinGate {
    /// Gate with the given response window.
    #[must_use]
    pub fn new(timeout_ticks: u32) -> Self {
        Self {
            requester: None,
            remaining: 0,
            timeout_ticks,
        }
    }

    /// Decide whether an inbound request should open a prompt.
    ///
    /// Public parties admit directly and never prompt. A request is also
    /// ignored while the same requester is already pending. Accepting a
    /// request records the requester and arms the countdown.
    pub fn consider(&mut self, user: User, privacy: PartyPrivacy, already_prompting: bool) -> bool {
        if privacy == PartyPrivacy::Public {
            return false;
        }
        if already_prompting && self.requester.as_ref() == Some(&user) {
            debug!(user = %user.username, "Join request already pending");
            return false;
        }
        debug!(user = %user.username, "Join request pending response");
        self.requester = Some(user);
        self.remaining = self.timeout_ticks;
        true
    }

    /// Advance the countdown by one tick.
    ///
    /// Returns `true` when the window has elapsed with a requester still
    /// pending; the caller must auto-deny.
    pub fn tick(&mut self) -> bool {
        if self.requester.is_none() {
            return false;
        }
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }

    /// Clear the pending requester and reset the countdown.
    pub fn take(&mut self) -> Option<User> {
        self.remaining = 0;
        self.requester.take()
    }

    /// The pending requester, if any.
    #[must_use]
    pub fn requester(&self) -> Option<&User> {
        self.requester.as_ref()
    }

    /// Whether a request is waiting for a response.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.requester.is_some()
    }
}

impl Default for JoinGate {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_TICKS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visitor() -> User {
        User::new("42", "visitor")
    }

    #[test]
    fn test_public_party_never_prompts() {
        let mut gate = JoinGate::default();
        assert!(!gate.consider(visitor(), PartyPrivacy::Public, false));
        assert!(!gate.is_pending());
    }

    #[test]
    fn test_private_party_prompts_and_arms_countdown() {
        let mut gate = JoinGate::new(3);
        assert!(gate.consider(visitor(), PartyPrivacy::Private, false));
        assert_eq!(gate.requester(), Some(&visitor()));

        assert!(!gate.tick());
        assert!(!gate.tick());
        assert!(gate.tick());
    }

    #[test]
    fn test_same_requester_does_not_reprompt() {
        let mut gate = JoinGate::new(3);
        assert!(gate.consider(visitor(), PartyPrivacy::Private, false));
        assert!(!gate.consider(visitor(), PartyPrivacy::Private, true));

        // A different requester replaces the pending one.
        let other = User::new("7", "other");
        assert!(gate.consider(other.clone(), PartyPrivacy::Private, true));
        assert_eq!(gate.requester(), Some(&other));
    }

    #[test]
    fn test_take_clears_state() {
        let mut gate = JoinGate::new(3);
        gate.consider(visitor(), PartyPrivacy::Private, false);
        assert_eq!(gate.take(), Some(visitor()));
        assert!(!gate.is_pending());
        assert!(!gate.tick());
    }
}
