//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: parsing
//! requests, building responses, routing methods, and reading the SDP
//! descriptions recorders announce.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! ```text
//! ANNOUNCE rtsp://server/cam1 RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Content-Type: application/sdp\r\n
//! Content-Length: 120\r\n
//! \r\n
//! v=0\r\n...
//! ```
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve the channel's announced SDP |
//! | ANNOUNCE | §10.3 | Publish a channel description |
//! | SETUP | §10.4 | Negotiate interleaved channels or UDP ports |
//! | PLAY | §10.5 | Start receiving a channel |
//! | PAUSE | §10.6 | Suspend delivery or ingest |
//! | RECORD | §10.11 | Start feeding a channel |
//! | TEARDOWN | §10.7 | Destroy session and close |
//! | GET_PARAMETER | §10.8 | Keepalive |

pub mod dispatch;
pub mod handler;
pub mod method;
pub mod request;
pub mod response;
pub mod sdp;

pub use dispatch::{Dispatcher, Flow, Reply};
pub use method::Method;
pub use request::Request;
pub use response::{Response, StatusCode};
