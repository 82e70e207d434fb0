use std::fmt;

/// Lower transport named by the `Transport` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    /// `RTP/AVP` or `RTP/AVP/UDP`.
    Udp,
    /// `RTP/AVP/TCP`: interleaved on the RTSP connection.
    Tcp,
}

/// Parsed `Transport` request header (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Transport: RTP/AVP/TCP;unicast;interleaved=0-1;mode=record
/// Transport: RTP/AVP;unicast;client_port=8000-8001
/// ```
///
/// Parameters are semicolon-separated; unknown ones are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    pub lower: LowerTransport,
    pub multicast: bool,
    pub record: bool,
    pub interleaved: Option<(u8, u8)>,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
}

/// Why a `Transport` header cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no RTP/AVP profile")]
    MissingProfile,
    #[error("neither unicast nor multicast")]
    MissingDelivery,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("multicast is not supported")]
    Multicast,
    #[error("TCP transport without interleaved channels")]
    MissingInterleaved,
    #[error("UDP transport without client ports")]
    MissingClientPort,
}

impl TransportHeader {
    /// Parse the `Transport` header value.
    ///
    /// A syntactically valid header is returned even when it asks for
    /// something the relay refuses (multicast); see [`validate`](Self::validate).
    ///
    /// ```
    /// use relay::session::transport::{LowerTransport, TransportHeader};
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
    /// assert_eq!(th.lower, LowerTransport::Tcp);
    /// assert_eq!(th.interleaved, Some((2, 3)));
    ///
    /// assert!(TransportHeader::parse("unicast;client_port=8000-8001").is_err());
    /// ```
    pub fn parse(header: &str) -> Result<Self, TransportError> {
        let mut lower = None;
        let mut unicast = false;
        let mut multicast = false;
        let mut record = false;
        let mut interleaved = None;
        let mut client_port = None;
        let mut server_port = None;

        // Only the first transport spec of a comma-separated list is used.
        let spec = header.split(',').next().unwrap_or(header);
        for part in spec.split(';').map(str::trim) {
            match part {
                "RTP/AVP" | "RTP/AVP/UDP" => lower = Some(LowerTransport::Udp),
                "RTP/AVP/TCP" => lower = Some(LowerTransport::Tcp),
                "unicast" => unicast = true,
                "multicast" => multicast = true,
                _ => {
                    if let Some(mode) = part.strip_prefix("mode=") {
                        record = mode.trim_matches('"').eq_ignore_ascii_case("record");
                    } else if let Some(v) = part.strip_prefix("interleaved=") {
                        interleaved = Some(parse_pair::<u8>(v, part)?);
                    } else if let Some(v) = part.strip_prefix("client_port=") {
                        client_port = Some(parse_pair::<u16>(v, part)?);
                    } else if let Some(v) = part.strip_prefix("server_port=") {
                        server_port = Some(parse_pair::<u16>(v, part)?);
                    }
                }
            }
        }

        let lower = lower.ok_or(TransportError::MissingProfile)?;
        if !unicast && !multicast {
            return Err(TransportError::MissingDelivery);
        }

        Ok(TransportHeader {
            lower,
            multicast,
            record,
            interleaved,
            client_port,
            server_port,
        })
    }

    /// Check the header describes something the relay can serve.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.multicast {
            return Err(TransportError::Multicast);
        }
        match self.lower {
            LowerTransport::Tcp if self.interleaved.is_none() => Err(TransportError::MissingInterleaved),
            LowerTransport::Udp if self.client_port.is_none() => Err(TransportError::MissingClientPort),
            _ => Ok(()),
        }
    }

    pub fn is_interleaved(&self) -> bool {
        self.lower == LowerTransport::Tcp
    }
}

impl fmt::Display for TransportHeader {
    /// Response form of the header, echoing what was negotiated.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lower {
            LowerTransport::Tcp => write!(f, "RTP/AVP/TCP")?,
            LowerTransport::Udp => write!(f, "RTP/AVP")?,
        }
        write!(f, ";{}", if self.multicast { "multicast" } else { "unicast" })?;
        if let Some((a, b)) = self.interleaved {
            write!(f, ";interleaved={a}-{b}")?;
        }
        if let Some((a, b)) = self.client_port {
            write!(f, ";client_port={a}-{b}")?;
        }
        if let Some((a, b)) = self.server_port {
            write!(f, ";server_port={a}-{b}")?;
        }
        if self.record {
            write!(f, ";mode=record")?;
        }
        Ok(())
    }
}

/// `0-1` → (0, 1). A single value `n` means `n-(n+1)`.
fn parse_pair<T>(value: &str, part: &str) -> Result<(T, T), TransportError>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    let invalid = || TransportError::InvalidParameter(part.to_string());
    match value.split_once('-') {
        Some((a, b)) => {
            let a = a.trim().parse::<T>().map_err(|_| invalid())?;
            let b = b.trim().parse::<T>().map_err(|_| invalid())?;
            Ok((a, b))
        }
        None => {
            let a = value.trim().parse::<T>().map_err(|_| invalid())?;
            let b = T::try_from(u32::from(a) + 1).map_err(|_| invalid())?;
            Ok((a, b))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_record() {
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1;mode=record").unwrap();
        assert_eq!(th.lower, LowerTransport::Tcp);
        assert!(th.record);
        assert_eq!(th.interleaved, Some((0, 1)));
        assert!(th.validate().is_ok());
    }

    #[test]
    fn parse_udp_play() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(th.lower, LowerTransport::Udp);
        assert!(!th.record);
        assert_eq!(th.client_port, Some((5000, 5001)));
        assert!(th.validate().is_ok());
    }

    #[test]
    fn quoted_record_mode() {
        let th = TransportHeader::parse("RTP/AVP/UDP;unicast;client_port=5000-5001;mode=\"RECORD\"").unwrap();
        assert!(th.record);
    }

    #[test]
    fn multicast_is_rejected_by_validate() {
        let th = TransportHeader::parse("RTP/AVP;multicast").unwrap();
        assert_eq!(th.validate(), Err(TransportError::Multicast));
    }

    #[test]
    fn missing_parts() {
        assert_eq!(
            TransportHeader::parse("unicast;client_port=1-2"),
            Err(TransportError::MissingProfile)
        );
        assert_eq!(
            TransportHeader::parse("RTP/AVP;client_port=1-2"),
            Err(TransportError::MissingDelivery)
        );
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast").unwrap();
        assert_eq!(th.validate(), Err(TransportError::MissingInterleaved));
        let th = TransportHeader::parse("RTP/AVP;unicast").unwrap();
        assert_eq!(th.validate(), Err(TransportError::MissingClientPort));
    }

    #[test]
    fn invalid_numbers() {
        assert!(matches!(
            TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-300"),
            Err(TransportError::InvalidParameter(_))
        ));
    }

    #[test]
    fn single_interleaved_value() {
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=4").unwrap();
        assert_eq!(th.interleaved, Some((4, 5)));
    }

    #[test]
    fn display_echoes_negotiation() {
        let mut th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        th.server_port = Some((8000, 8001));
        assert_eq!(
            th.to_string(),
            "RTP/AVP;unicast;client_port=5000-5001;server_port=8000-8001"
        );
    }
}
