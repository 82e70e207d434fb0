use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::MethodError;
use crate::protocol::method::Method;
use crate::protocol::request::Request;
use crate::protocol::response::Response;
use crate::registry::Registry;
use crate::session::transport::TransportHeader;
use crate::session::{Session, SessionState};
use crate::transport::UdpRelay;

/// What the connection loop does after writing a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// End of stream: tear the connection down after the response.
    Close,
}

/// Response to one request plus the connection's next step.
#[derive(Debug)]
pub struct Reply {
    pub response: Response,
    pub flow: Flow,
}

impl Reply {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            flow: Flow::Continue,
        }
    }

    pub fn close(response: Response) -> Self {
        Self {
            response,
            flow: Flow::Close,
        }
    }
}

/// A method handler. Runs after the method's preconditions passed.
pub type Handler = Box<dyn Fn(&Dispatcher, &Request, &Arc<Session>) -> Result<Reply, MethodError> + Send + Sync>;

/// Routes requests to method handlers.
///
/// The table is closed: a method without a registered handler, or one the
/// relay does not know at all, is answered with 405. Shared by every
/// connection thread.
pub struct Dispatcher {
    handlers: HashMap<Method, Handler>,
    registry: Registry,
    relay: Option<Arc<UdpRelay>>,
    session_timeout: Duration,
}

impl Dispatcher {
    /// An empty table; see [`with_default_handlers`](Self::with_default_handlers).
    pub fn new(registry: Registry, relay: Option<Arc<UdpRelay>>, session_timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            registry,
            relay,
            session_timeout,
        }
    }

    /// Register `handler` for `method`, replacing any previous one.
    pub fn register<F>(&mut self, method: Method, handler: F)
    where
        F: Fn(&Dispatcher, &Request, &Arc<Session>) -> Result<Reply, MethodError> + Send + Sync + 'static,
    {
        self.handlers.insert(method, Box::new(handler));
    }

    /// Registered methods in canonical order, as advertised by `Public`.
    pub fn methods(&self) -> Vec<Method> {
        Method::ALL
            .iter()
            .copied()
            .filter(|m| self.handlers.contains_key(m))
            .collect()
    }

    pub fn public_header(&self) -> String {
        self.methods()
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn relay(&self) -> Option<&Arc<UdpRelay>> {
        self.relay.as_ref()
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// `Session` header value for responses.
    pub fn session_header(&self, session: &Session) -> String {
        session.header_value(self.session_timeout.as_secs())
    }

    /// Handle one request for `session`. Never fails: errors become
    /// responses. `CSeq` is echoed whenever the request carried one.
    pub fn route(&self, request: &Request, session: &Arc<Session>) -> Reply {
        let mut reply = match self.dispatch(request, session) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id(),
                    method = %request.method,
                    uri = %request.uri,
                    status = e.status().code(),
                    error = %e,
                    "request failed"
                );
                let mut response = Response::new(e.status());
                if matches!(e, MethodError::MethodNotAllowed(_)) {
                    response = response.add_header("Public", &self.public_header());
                }
                Reply::new(response)
            }
        };

        if let Some(cseq) = request.cseq() {
            reply.response = reply.response.set_header("CSeq", cseq);
        }
        reply
    }

    fn dispatch(&self, request: &Request, session: &Arc<Session>) -> Result<Reply, MethodError> {
        let method = request
            .method()
            .map_err(|e| MethodError::MethodNotAllowed(e.0))?;
        let handler = self
            .handlers
            .get(&method)
            .ok_or_else(|| MethodError::MethodNotAllowed(method.to_string()))?;

        if let Some(id) = request.session_id()
            && id != session.id()
        {
            return Err(MethodError::SessionNotFound(id.to_string()));
        }
        check_preconditions(method, request, session)?;

        handler(self, request, session)
    }
}

/// States each method is legal in. `None` means any state.
fn legal_states(method: Method) -> Option<&'static [SessionState]> {
    use SessionState::*;
    match method {
        Method::Announce => Some(&[Init, Ready]),
        Method::Record => Some(&[Ready, Recording]),
        Method::Play => Some(&[Ready, Playing]),
        Method::Pause => Some(&[Ready, Playing, Recording]),
        Method::Options | Method::Describe | Method::Setup | Method::Teardown | Method::GetParameter => None,
    }
}

fn check_preconditions(method: Method, request: &Request, session: &Session) -> Result<(), MethodError> {
    if let Some(states) = legal_states(method) {
        let state = session.state();
        if !states.contains(&state) {
            return Err(MethodError::InvalidState {
                method: method.to_string(),
                state,
            });
        }
    }
    if method == Method::Setup {
        transport_of(request)?;
    }
    Ok(())
}

/// The request's validated `Transport` header.
pub(crate) fn transport_of(request: &Request) -> Result<TransportHeader, MethodError> {
    let value = request
        .get_header("Transport")
        .ok_or_else(|| MethodError::UnsupportedTransport("missing Transport header".to_string()))?;
    let transport = TransportHeader::parse(value).map_err(|e| MethodError::UnsupportedTransport(e.to_string()))?;
    transport
        .validate()
        .map_err(|e| MethodError::UnsupportedTransport(e.to_string()))?;
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::pool::PacketPool;
    use crate::protocol::response::StatusCode;
    use crate::transport::testing::MemoryLink;

    fn dispatcher() -> Dispatcher {
        let registry = Registry::new(ChannelConfig::default(), PacketPool::new(4), Some("live"));
        Dispatcher::new(registry, None, Duration::from_secs(60))
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::new(Arc::new(MemoryLink::new("127.0.0.1:5000")), None))
    }

    fn ok(_: &Dispatcher, _: &Request, _: &Arc<Session>) -> Result<Reply, MethodError> {
        Ok(Reply::new(Response::ok()))
    }

    #[test]
    fn unregistered_method_is_405_with_cseq() {
        let mut d = dispatcher();
        d.register(Method::Options, ok);
        let req = Request::new(Method::Play, "rtsp://h/live").add_header("CSeq", "7");
        let reply = d.route(&req, &session());
        assert_eq!(reply.response.status, StatusCode::MethodNotAllowed);
        assert_eq!(reply.response.get_header("CSeq"), Some("7"));
        assert_eq!(reply.response.get_header("Public"), Some("OPTIONS"));
        assert_eq!(reply.flow, Flow::Continue);
    }

    #[test]
    fn unknown_method_is_405() {
        let d = dispatcher();
        let mut req = Request::new(Method::Options, "*").add_header("CSeq", "1");
        req.method = "REDIRECT".to_string();
        assert_eq!(d.route(&req, &session()).response.status, StatusCode::MethodNotAllowed);
    }

    #[test]
    fn state_precondition_is_455() {
        let mut d = dispatcher();
        d.register(Method::Record, ok);
        let req = Request::new(Method::Record, "rtsp://h/live").add_header("CSeq", "3");
        let s = session();
        let reply = d.route(&req, &s);
        assert_eq!(reply.response.status, StatusCode::MethodNotValidInThisState);
        assert_eq!(s.state(), SessionState::Init);
    }

    #[test]
    fn setup_transport_precondition_is_461() {
        let mut d = dispatcher();
        d.register(Method::Setup, ok);
        let s = session();
        for transport in [None, Some("RTP/AVP;multicast"), Some("RTP/AVP/TCP;unicast"), Some("garbage")] {
            let mut req = Request::new(Method::Setup, "rtsp://h/live/t1");
            if let Some(t) = transport {
                req = req.add_header("Transport", t);
            }
            assert_eq!(d.route(&req, &s).response.status, StatusCode::UnsupportedTransport);
        }
    }

    #[test]
    fn foreign_session_header_is_454() {
        let mut d = dispatcher();
        d.register(Method::Options, ok);
        let s = session();
        let req = Request::new(Method::Options, "*").add_header("Session", "DEADBEEF;timeout=60");
        assert_eq!(d.route(&req, &s).response.status, StatusCode::SessionNotFound);

        let header = d.session_header(&s);
        let req = Request::new(Method::Options, "*").add_header("Session", &header);
        assert_eq!(d.route(&req, &s).response.status, StatusCode::Ok);
    }

    #[test]
    fn methods_follow_canonical_order() {
        let mut d = dispatcher();
        d.register(Method::Teardown, ok);
        d.register(Method::Options, ok);
        d.register(Method::Setup, ok);
        assert_eq!(d.methods(), vec![Method::Options, Method::Setup, Method::Teardown]);
        assert_eq!(d.public_header(), "OPTIONS, SETUP, TEARDOWN");
    }
}
