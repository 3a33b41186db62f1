//! Stanza routing: the transition table made executable.
//!
//! The router consults the session state first; a handler runs only for
//! (state, stanza-kind) pairs the negotiation allows. Everything else is
//! answered with a correlated protocol-error stanza and counted toward the
//! per-session abuse threshold — out-of-order input never mutates state and
//! never crashes the connection.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::session::{Session, SessionState};
use crate::stanza::{Features, Stanza, StreamHeader, NS_SESSION};

/// Stanza-error condition for an out-of-order request.
const CONDITION_ORDER: &str = "unexpected-request";
/// Stanza-error condition for an unknown stanza or unregistered query kind.
const CONDITION_UNSUPPORTED: &str = "service-unavailable";
/// Stanza-error condition when a registered handler fails.
const CONDITION_INTERNAL: &str = "internal-server-error";

/// Connection-level action the router asks the driver to take after the
/// replies are flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Auth succeeded: discard pre-restart framing and expect a fresh
    /// stream header on the same byte channel.
    RestartStream,
    /// Abuse threshold reached: close the connection.
    Close,
}

/// Outcome of routing one inbound stanza: replies in send order, plus an
/// optional control action.
#[derive(Debug)]
pub struct Routed {
    pub reply: Vec<Stanza>,
    pub control: Option<Control>,
}

impl Routed {
    fn reply(reply: Vec<Stanza>) -> Self {
        Self {
            reply,
            control: None,
        }
    }
}

/// Read-only session snapshot passed to query handlers.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub identity: Option<String>,
    pub full_address: Option<String>,
}

type QueryHandlerFn =
    dyn Fn(SessionContext, String) -> BoxFuture<'static, EngineResult<String>> + Send + Sync;

/// Pluggable query handlers keyed by query kind (the query child's
/// namespace). Populated before the supervisor starts accepting; read-only
/// afterwards.
#[derive(Default)]
pub struct QueryRegistry {
    handlers: HashMap<String, Arc<QueryHandlerFn>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(SessionContext, String) -> BoxFuture<'static, EngineResult<String>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(kind.into(), Arc::new(handler));
    }

    fn get(&self, kind: &str) -> Option<&Arc<QueryHandlerFn>> {
        self.handlers.get(kind)
    }
}

/// Dispatches parsed stanzas against one session's state.
pub struct Router {
    config: Arc<EngineConfig>,
    authenticator: Arc<dyn Authenticator>,
    queries: Arc<QueryRegistry>,
}

impl Router {
    pub fn new(
        config: Arc<EngineConfig>,
        authenticator: Arc<dyn Authenticator>,
        queries: Arc<QueryRegistry>,
    ) -> Self {
        Self {
            config,
            authenticator,
            queries,
        }
    }

    /// Route one inbound stanza. `Err` is returned only for fatal conditions
    /// (an authenticator backend failure); recoverable problems are answered
    /// on the stream via `Routed::reply`.
    pub async fn route(&self, session: &mut Session, stanza: Stanza) -> EngineResult<Routed> {
        debug!(state = ?session.state(), stanza = ?stanza_kind(&stanza), "routing stanza");

        match (session.state(), stanza) {
            (SessionState::AwaitingStreamOpen, Stanza::StreamOpen(header)) => {
                session.open_stream();
                session.reset_violations();
                Ok(Routed::reply(vec![
                    self.stream_open_reply(session, &header),
                    Stanza::Features(Features {
                        mechanisms: self.config.mechanisms.clone(),
                        bind_required: false,
                    }),
                ]))
            }

            (
                SessionState::FeaturesSent,
                Stanza::AuthRequest {
                    mechanism,
                    credentials,
                },
            ) => {
                session.reset_violations();
                // Unsupported mechanisms never reach the authenticator
                if !self.config.supports_mechanism(&mechanism) {
                    info!(mechanism = %mechanism, "auth attempt with unadvertised mechanism");
                    return Ok(Routed::reply(vec![Stanza::AuthResult { ok: false }]));
                }

                match self
                    .authenticator
                    .authenticate(&mechanism, &credentials)
                    .await?
                {
                    Some(identity) => {
                        info!(identity = %identity, mechanism = %mechanism, "authenticated");
                        session.mark_authenticated(identity);
                        Ok(Routed {
                            reply: vec![Stanza::AuthResult { ok: true }],
                            control: Some(Control::RestartStream),
                        })
                    }
                    None => {
                        info!(mechanism = %mechanism, "authentication rejected");
                        Ok(Routed::reply(vec![Stanza::AuthResult { ok: false }]))
                    }
                }
            }

            (SessionState::Authenticated, Stanza::StreamOpen(header)) => {
                session.reopen_stream();
                session.reset_violations();
                Ok(Routed::reply(vec![
                    self.stream_open_reply(session, &header),
                    Stanza::Features(Features {
                        mechanisms: vec![],
                        bind_required: true,
                    }),
                ]))
            }

            (SessionState::AwaitingBind, Stanza::BindRequest { id, resource }) => {
                let jid = session.bind(resource)?;
                session.reset_violations();
                info!(jid = %jid, "resource bound");
                Ok(Routed::reply(vec![Stanza::BindResult { id, jid }]))
            }

            (
                SessionState::Bound | SessionState::Established,
                Stanza::Query { id, kind, payload },
            ) => {
                if session.state() == SessionState::Bound {
                    session.mark_established();
                }
                session.reset_violations();
                self.handle_query(session, id, kind, payload).await
            }

            (_, stanza) => Ok(self.reject(session, &stanza)),
        }
    }

    /// Server-side stream header for the current epoch, echoing the peer's
    /// address when it identified itself.
    fn stream_open_reply(&self, session: &Session, client: &StreamHeader) -> Stanza {
        Stanza::StreamOpen(StreamHeader {
            from: Some(self.config.domain.clone()),
            to: client.from.clone(),
            id: Some(session.stream_id().to_string()),
            version: "1.0".to_string(),
            lang: client.lang.clone(),
        })
    }

    async fn handle_query(
        &self,
        session: &Session,
        id: String,
        kind: String,
        payload: String,
    ) -> EngineResult<Routed> {
        // Session establishment is a negotiation no-op: acknowledge it
        if kind == NS_SESSION {
            return Ok(Routed::reply(vec![Stanza::QueryResult {
                id,
                payload: String::new(),
            }]));
        }

        let Some(handler) = self.queries.get(&kind) else {
            debug!(kind = %kind, "unregistered query kind");
            return Ok(Routed::reply(vec![Stanza::StanzaError {
                id,
                condition: CONDITION_UNSUPPORTED.to_string(),
            }]));
        };

        let context = SessionContext {
            identity: session.identity().map(str::to_string),
            full_address: session.full_address(),
        };
        // Every id-bearing query gets exactly one correlated response, even
        // when the handler fails
        match handler(context, payload).await {
            Ok(result) => Ok(Routed::reply(vec![Stanza::QueryResult {
                id,
                payload: result,
            }])),
            Err(e) => {
                warn!(kind = %kind, error = %e, "query handler failed");
                Ok(Routed::reply(vec![Stanza::StanzaError {
                    id,
                    condition: CONDITION_INTERNAL.to_string(),
                }]))
            }
        }
    }

    /// Reject a stanza illegal in the current state: correlated error reply,
    /// no state change, abuse counter bumped.
    fn reject(&self, session: &mut Session, stanza: &Stanza) -> Routed {
        let count = session.note_violation();
        let condition = match stanza {
            Stanza::Unknown { .. } => CONDITION_UNSUPPORTED,
            _ => CONDITION_ORDER,
        };
        warn!(
            state = ?session.state(),
            stanza = ?stanza_kind(stanza),
            violations = count,
            "rejecting out-of-order stanza"
        );
        let reply = vec![Stanza::StanzaError {
            id: stanza_id(stanza).unwrap_or_default().to_string(),
            condition: condition.to_string(),
        }];
        let control = if count >= self.config.order_violation_limit {
            warn!(violations = count, "order violation limit reached, closing");
            Some(Control::Close)
        } else {
            None
        };
        Routed { reply, control }
    }
}

fn stanza_id(stanza: &Stanza) -> Option<&str> {
    match stanza {
        Stanza::BindRequest { id, .. }
        | Stanza::BindResult { id, .. }
        | Stanza::Query { id, .. }
        | Stanza::QueryResult { id, .. }
        | Stanza::StanzaError { id, .. } => Some(id),
        _ => None,
    }
}

fn stanza_kind(stanza: &Stanza) -> &'static str {
    match stanza {
        Stanza::StreamOpen(_) => "stream-open",
        Stanza::Features(_) => "features",
        Stanza::AuthRequest { .. } => "auth-request",
        Stanza::AuthResult { .. } => "auth-result",
        Stanza::BindRequest { .. } => "bind-request",
        Stanza::BindResult { .. } => "bind-result",
        Stanza::Query { .. } => "query",
        Stanza::QueryResult { .. } => "query-result",
        Stanza::StanzaError { .. } => "stanza-error",
        Stanza::Unknown { .. } => "unknown",
    }
}
