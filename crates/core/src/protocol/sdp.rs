//! SDP (Session Description Protocol) reading (RFC 4566 / RFC 8866).
//!
//! The relay never rewrites a description: the recorder's ANNOUNCE body is
//! stored verbatim and served to viewers by DESCRIBE. Only the media list is
//! extracted, because SETUP must map each `a=control` id to a media ordinal:
//!
//! ```text
//! v=0
//! o=- 0 0 IN IP4 127.0.0.1
//! s=Stream
//! t=0 0
//! m=video 0 RTP/AVP 96          ← media 0
//! a=rtpmap:96 H264/90000
//! a=control:streamid=0          ← control id of media 0
//! m=audio 0 RTP/AVP 97          ← media 1
//! a=control:streamid=1
//! ```

use crate::registry::split_target;

/// Why a description body was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SdpError {
    #[error("description is not valid UTF-8")]
    InvalidUtf8,
    #[error("description does not start with v=0")]
    MissingVersion,
    #[error("description has no media section")]
    NoMedia,
}

/// One `m=` section of a description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// Media type from the `m=` line (`video`, `audio`, ...).
    pub kind: String,
    /// Normalized `a=control` id; empty when the section has none.
    pub control: String,
}

/// The parts of a presentation description the relay acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub medias: Vec<MediaDescription>,
}

impl Description {
    pub fn parse(raw: &[u8]) -> Result<Self, SdpError> {
        let text = std::str::from_utf8(raw).map_err(|_| SdpError::InvalidUtf8)?;
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        if lines.next() != Some("v=0") {
            return Err(SdpError::MissingVersion);
        }

        let mut medias: Vec<MediaDescription> = Vec::new();
        for line in lines {
            if let Some(m) = line.strip_prefix("m=") {
                medias.push(MediaDescription {
                    kind: m.split_whitespace().next().unwrap_or("").to_string(),
                    control: String::new(),
                });
            } else if let Some(control) = line.strip_prefix("a=control:")
                && let Some(media) = medias.last_mut()
            {
                media.control = normalize_control(control.trim());
            }
        }

        if medias.is_empty() {
            return Err(SdpError::NoMedia);
        }
        Ok(Description { medias })
    }

    /// Ordinal (position among the `m=` sections) of a control id.
    pub fn ordinal_of(&self, control: &str) -> Option<usize> {
        self.medias.iter().position(|m| m.control == control)
    }

    pub fn controls(&self) -> impl Iterator<Item = &str> {
        self.medias.iter().map(|m| m.control.as_str())
    }
}

/// Reduce a control attribute to the id SETUP targets are compared with.
///
/// `rtsp://host/cam1/streamid=0` → `streamid=0`, `trackID=1` → `trackID=1`.
fn normalize_control(control: &str) -> String {
    if control.contains("://") {
        split_target(control).1.to_string()
    } else {
        control.trim_start_matches('/').to_string()
    }
}
