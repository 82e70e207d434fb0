//! Method handlers for the default dispatch table.
//!
//! Each handler runs after [`Dispatcher`] checked the method's legal states
//! (and, for SETUP, the `Transport` header). Handlers mutate the session and
//! its channel and build the success response; failures are returned as
//! [`MethodError`] and turned into status responses by the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::error::MethodError;
use crate::protocol::dispatch::{Dispatcher, Reply, transport_of};
use crate::protocol::method::Method;
use crate::protocol::request::Request;
use crate::protocol::response::Response;
use crate::protocol::sdp::Description;
use crate::registry::{Registry, split_target};
use crate::session::{Direction, Media, Session};
use crate::transport::UdpRelay;

const SDP_CONTENT_TYPE: &str = "application/sdp";

impl Dispatcher {
    /// Dispatcher serving every method the relay implements.
    pub fn with_default_handlers(
        registry: Registry,
        relay: Option<Arc<UdpRelay>>,
        session_timeout: Duration,
    ) -> Self {
        let mut dispatcher = Dispatcher::new(registry, relay, session_timeout);
        dispatcher.register(Method::Options, options);
        dispatcher.register(Method::Describe, describe);
        dispatcher.register(Method::Announce, announce);
        dispatcher.register(Method::Setup, setup);
        dispatcher.register(Method::Play, play);
        dispatcher.register(Method::Pause, pause);
        dispatcher.register(Method::Record, record);
        dispatcher.register(Method::Teardown, teardown);
        dispatcher.register(Method::GetParameter, get_parameter);
        dispatcher
    }
}

/// Channel name addressed by a request target.
fn channel_name<'a>(d: &'a Dispatcher, uri: &'a str) -> Result<&'a str, MethodError> {
    let (name, _) = split_target(uri);
    d.registry()
        .resolve_name(name)
        .ok_or_else(|| MethodError::NotFound(uri.to_string()))
}

fn existing_channel(d: &Dispatcher, name: &str) -> Result<Arc<Channel>, MethodError> {
    d.registry()
        .get(name)
        .ok_or_else(|| MethodError::NotFound(format!("channel {name}")))
}

/// The channel this session is bound to.
fn session_channel(d: &Dispatcher, request: &Request, session: &Session) -> Result<Arc<Channel>, MethodError> {
    let name = match session.channel_name() {
        Some(name) => name,
        None => channel_name(d, &request.uri)?.to_string(),
    };
    existing_channel(d, &name)
}

fn bound_elsewhere(session: &Session) -> MethodError {
    MethodError::BadRequest(format!(
        "session is bound to channel {}",
        session.channel_name().unwrap_or_default()
    ))
}

fn bind(session: &Session, name: &str) -> Result<(), MethodError> {
    if session.bind_channel(name) {
        Ok(())
    } else {
        Err(bound_elsewhere(session))
    }
}

/// Like [`bind`], without binding an unbound session.
fn check_binding(session: &Session, name: &str) -> Result<(), MethodError> {
    match session.channel_name() {
        Some(current) if current != name => Err(bound_elsewhere(session)),
        _ => Ok(()),
    }
}

fn described(channel: &Channel) -> Result<Arc<Description>, MethodError> {
    channel
        .description()
        .ok_or_else(|| MethodError::Internal(format!("channel {} has no description", channel.name())))
}

fn options(d: &Dispatcher, _: &Request, _: &Arc<Session>) -> Result<Reply, MethodError> {
    Ok(Reply::new(Response::ok().add_header("Public", &d.public_header())))
}

fn describe(d: &Dispatcher, request: &Request, _: &Arc<Session>) -> Result<Reply, MethodError> {
    let channel = existing_channel(d, channel_name(d, &request.uri)?)?;
    let raw = channel
        .raw_description()
        .ok_or_else(|| MethodError::Internal(format!("channel {} has no description", channel.name())))?;

    tracing::debug!(channel = %channel.name(), uri = %request.uri, "DESCRIBE");
    Ok(Reply::new(
        Response::ok()
            .add_header("Content-Type", SDP_CONTENT_TYPE)
            .add_header("Content-Base", &request.uri)
            .with_body(raw.to_vec()),
    ))
}

fn announce(d: &Dispatcher, request: &Request, session: &Arc<Session>) -> Result<Reply, MethodError> {
    match request.content_type() {
        Some(ct) if ct.eq_ignore_ascii_case(SDP_CONTENT_TYPE) => {}
        other => {
            return Err(MethodError::BadRequest(format!(
                "unsupported content type {}",
                other.unwrap_or("(none)")
            )));
        }
    }
    let description = Description::parse(&request.body).map_err(|e| MethodError::BadRequest(e.to_string()))?;

    let name = channel_name(d, &request.uri)?;
    check_binding(session, name)?;
    let channel = d.registry().get_or_create(name);
    let medias = description.medias.len();
    if !channel.set_description(session, description, &request.body) {
        return Err(MethodError::Internal(format!("channel {name} has another producer")));
    }
    bind(session, name)?;

    tracing::info!(session_id = %session.id(), channel = %name, medias, "ANNOUNCE");
    Ok(Reply::new(Response::ok().add_header("Session", &d.session_header(session))))
}

fn setup(d: &Dispatcher, request: &Request, session: &Arc<Session>) -> Result<Reply, MethodError> {
    let mut transport = transport_of(request)?;
    let (_, control) = split_target(&request.uri);
    let name = channel_name(d, &request.uri)?;
    let channel = existing_channel(d, name)?;
    let description = described(&channel)?;

    // A single-media description may be set up through the bare channel URL.
    let ordinal = description
        .ordinal_of(control)
        .or_else(|| (control.is_empty() && description.medias.len() == 1).then_some(0))
        .ok_or_else(|| MethodError::NotFound(format!("media {control} in channel {name}")))?;
    let control = description.medias[ordinal].control.clone();

    bind(session, name)?;
    let media = Media::from_transport(&control, ordinal, &transport)
        .ok_or_else(|| MethodError::UnsupportedTransport("no channel or port pair".to_string()))?;
    let ready = session.add_media(media, &description)?;

    if !transport.is_interleaved() {
        let relay = d
            .relay()
            .ok_or_else(|| MethodError::UnsupportedTransport("UDP relay disabled".to_string()))?;
        transport.server_port = Some(relay.ports());
    }

    tracing::info!(
        session_id = %session.id(),
        channel = %name,
        control = %control,
        ordinal,
        record = transport.record,
        interleaved = transport.is_interleaved(),
        ready,
        "SETUP"
    );
    Ok(Reply::new(
        Response::ok()
            .add_header("Transport", &transport.to_string())
            .add_header("Session", &d.session_header(session)),
    ))
}

fn record(d: &Dispatcher, request: &Request, session: &Arc<Session>) -> Result<Reply, MethodError> {
    let channel = session_channel(d, request, session)?;
    let description = described(&channel)?;
    let interleaved = session.check_media(&description, Direction::Record)?;

    if !channel.claim_producer(session) {
        return Err(MethodError::Internal(format!(
            "channel {} has another producer",
            channel.name()
        )));
    }
    session.start(Direction::Record, interleaved);

    tracing::info!(session_id = %session.id(), channel = %channel.name(), interleaved, "RECORD");
    Ok(Reply::new(Response::ok().add_header("Session", &d.session_header(session))))
}

fn play(d: &Dispatcher, request: &Request, session: &Arc<Session>) -> Result<Reply, MethodError> {
    let channel = session_channel(d, request, session)?;
    let description = described(&channel)?;
    let interleaved = session.check_media(&description, Direction::Play)?;

    session.start(Direction::Play, interleaved);
    channel.subscribe(session);

    tracing::info!(session_id = %session.id(), channel = %channel.name(), interleaved, "PLAY");
    Ok(Reply::new(
        Response::ok()
            .add_header("Session", &d.session_header(session))
            .add_header("Range", "npt=0.000-"),
    ))
}

fn pause(d: &Dispatcher, _: &Request, session: &Arc<Session>) -> Result<Reply, MethodError> {
    session.pause();
    tracing::info!(session_id = %session.id(), "PAUSE");
    Ok(Reply::new(Response::ok().add_header("Session", &d.session_header(session))))
}

fn teardown(d: &Dispatcher, _: &Request, session: &Arc<Session>) -> Result<Reply, MethodError> {
    let removed = d.registry().teardown(session);
    session.reset();
    tracing::info!(session_id = %session.id(), removed, "TEARDOWN");
    Ok(Reply::close(Response::ok().add_header("Session", &d.session_header(session))))
}

fn get_parameter(d: &Dispatcher, request: &Request, session: &Arc<Session>) -> Result<Reply, MethodError> {
    let mut response = Response::ok();
    if request.session_id().is_some() {
        response = response.add_header("Session", &d.session_header(session));
    }
    Ok(Reply::new(response))
}
