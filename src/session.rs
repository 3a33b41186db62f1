//! Per-connection session lifecycle: stream states and the identity record.
//!
//! A `Session` is created on accept, owned by that connection's task, mutated
//! only by the router driving the state machine, and destroyed when the
//! connection closes. Ordering invariants live here: a resource can only be
//! bound after authentication, and the full address exists exactly while a
//! resource is bound.

use crate::error::{EngineError, EngineResult};
use crate::stanza::generate_id;

/// Stream negotiation states. `AwaitingAuth` from the transition table is
/// transient (the authenticator is awaited inline while handling the auth
/// request), so it needs no resting state here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Fresh connection; nothing received yet.
    AwaitingStreamOpen,
    /// Stream header answered, mechanisms advertised; auth may be attempted.
    FeaturesSent,
    /// Credentials accepted; waiting for the client to reopen the stream.
    Authenticated,
    /// Restarted stream answered with bind features; bind may be requested.
    AwaitingBind,
    /// Resource bound, full address assigned.
    Bound,
    /// First query handled; steady state for the rest of the connection.
    Established,
    /// Terminal. Reachable from every other state.
    Closed,
}

/// One connection's negotiation state and identity record.
#[derive(Debug)]
pub struct Session {
    domain: String,
    state: SessionState,
    stream_id: String,
    epoch: u64,
    identity: Option<String>,
    resource: Option<String>,
    order_violations: u32,
}

impl Session {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            state: SessionState::AwaitingStreamOpen,
            stream_id: generate_id(),
            epoch: 0,
            identity: None,
            resource: None,
            order_violations: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Opaque stream id, regenerated on each stream restart.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Stream epoch; increments on each restart.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// `identity@domain/resource`, defined exactly while a resource is bound.
    pub fn full_address(&self) -> Option<String> {
        match (&self.identity, &self.resource) {
            (Some(identity), Some(resource)) => {
                Some(format!("{}@{}/{}", identity, self.domain, resource))
            }
            _ => None,
        }
    }

    /// First stream header accepted; mechanisms are about to be advertised.
    pub fn open_stream(&mut self) {
        self.state = SessionState::FeaturesSent;
    }

    /// Credentials accepted: record the identity and begin a new stream
    /// epoch. The client must now reopen the stream before binding.
    pub fn mark_authenticated(&mut self, identity: impl Into<String>) {
        self.identity = Some(identity.into());
        self.restart_stream();
        self.state = SessionState::Authenticated;
    }

    /// Post-authentication stream header accepted; bind features are about
    /// to be advertised.
    pub fn reopen_stream(&mut self) {
        self.state = SessionState::AwaitingBind;
    }

    /// Bind the requested resource (or a generated one) and derive the full
    /// address. Rejects the call while unauthenticated: `Bound` is not
    /// reachable without `Authenticated` having happened.
    pub fn bind(&mut self, requested: Option<String>) -> EngineResult<String> {
        let identity = self
            .identity
            .as_deref()
            .ok_or_else(|| EngineError::ProtocolOrder("bind before authentication".to_string()))?
            .to_string();
        let resource = requested
            .filter(|r| !r.is_empty())
            .unwrap_or_else(generate_id);
        let jid = format!("{}@{}/{}", identity, self.domain, resource);
        self.resource = Some(resource);
        self.state = SessionState::Bound;
        Ok(jid)
    }

    pub fn mark_established(&mut self) {
        self.state = SessionState::Established;
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Record one out-of-order stanza; returns the consecutive count.
    pub fn note_violation(&mut self) -> u32 {
        self.order_violations += 1;
        self.order_violations
    }

    /// A legal stanza was handled; the consecutive-violation run is broken.
    pub fn reset_violations(&mut self) {
        self.order_violations = 0;
    }

    fn restart_stream(&mut self) {
        self.epoch += 1;
        self.stream_id = generate_id();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_initial_state() {
        let session = Session::new("localhost");
        assert_eq!(session.state(), SessionState::AwaitingStreamOpen);
        assert_eq!(session.epoch(), 0);
        assert!(!session.is_authenticated());
        assert_eq!(session.full_address(), None);
        assert_eq!(session.stream_id().len(), 16);
    }

    #[test]
    fn test_bind_before_authentication_is_rejected() {
        let mut session = Session::new("localhost");
        session.open_stream();
        let err = session.bind(Some("tesla".to_string())).unwrap_err();
        assert!(matches!(err, EngineError::ProtocolOrder(_)));
        // State and identity record untouched
        assert_eq!(session.state(), SessionState::FeaturesSent);
        assert_eq!(session.resource(), None);
        assert_eq!(session.full_address(), None);
    }

    #[test]
    fn test_full_lifecycle_derives_address() {
        let mut session = Session::new("localhost");
        session.open_stream();
        session.mark_authenticated("james");
        assert_eq!(session.state(), SessionState::Authenticated);
        session.reopen_stream();
        let jid = session.bind(Some("tesla".to_string())).unwrap();
        assert_eq!(jid, "james@localhost/tesla");
        assert_eq!(session.state(), SessionState::Bound);
        assert_eq!(session.full_address().as_deref(), Some("james@localhost/tesla"));
        session.mark_established();
        assert_eq!(session.state(), SessionState::Established);
    }

    #[test]
    fn test_bind_generates_resource_when_omitted() {
        let mut session = Session::new("localhost");
        session.open_stream();
        session.mark_authenticated("james");
        session.reopen_stream();
        let jid = session.bind(None).unwrap();
        let resource = session.resource().unwrap();
        assert_eq!(resource.len(), 16);
        assert_eq!(jid, format!("james@localhost/{}", resource));
    }

    #[test]
    fn test_authentication_starts_new_stream_epoch() {
        let mut session = Session::new("localhost");
        session.open_stream();
        let first_stream_id = session.stream_id().to_string();
        session.mark_authenticated("james");
        assert_eq!(session.epoch(), 1);
        assert_ne!(session.stream_id(), first_stream_id);
    }

    #[test]
    fn test_violation_counter_tracks_consecutive_runs() {
        let mut session = Session::new("localhost");
        assert_eq!(session.note_violation(), 1);
        assert_eq!(session.note_violation(), 2);
        session.reset_violations();
        assert_eq!(session.note_violation(), 1);
    }

    #[test]
    fn test_close_is_terminal_from_any_state() {
        let mut session = Session::new("localhost");
        session.open_stream();
        session.close();
        assert!(session.is_closed());

        let mut session = Session::new("localhost");
        session.open_stream();
        session.mark_authenticated("james");
        session.reopen_stream();
        session.bind(None).unwrap();
        session.mark_established();
        session.close();
        assert!(session.is_closed());
    }
}
