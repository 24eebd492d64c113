//! PCP MAP wire format, see [RFC 6887](https://datatracker.ietf.org/doc/html/rfc6887).
//!
//! Only the MAP opcode is implemented; PEER and ANNOUNCE have no use here.
//! PCP options are not used and therefore not implemented.

use std::net::{Ipv4Addr, Ipv6Addr};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Port the gateway listens on for PCP requests. Shared with NAT-PMP, see
/// [RFC 6887 §19](https://datatracker.ietf.org/doc/html/rfc6887#section-19).
pub const SERVER_PORT: u16 = 5351;

/// PCP protocol version, per
/// [RFC 6887 §9](https://datatracker.ietf.org/doc/html/rfc6887#section-9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    Pcp = 2,
}

/// Opcodes as assigned in
/// [RFC 6887 §19](https://datatracker.ietf.org/doc/html/rfc6887#section-19).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Endpoint-independent mapping
    /// ([RFC 6887 §11](https://datatracker.ietf.org/doc/html/rfc6887#section-11)).
    Map = 1,
}

/// Transport protocol of a mapping. IANA numbers; only UDP is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MapProtocol {
    Udp = 17,
}

/// Non-zero result codes
/// ([RFC 6887 §7.4](https://datatracker.ietf.org/doc/html/rfc6887#section-7.4)).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, derive_more::Display,
)]
#[repr(u8)]
pub enum ErrorCode {
    #[display("sent version is not supported")]
    UnsuppVersion = 1,
    #[display("operation not authorized")]
    NotAuthorized = 2,
    #[display("could not parse the request")]
    MalformedRequest = 3,
    #[display("opcode is not supported")]
    UnsuppOpcode = 4,
    #[display("option is not supported")]
    UnsuppOption = 5,
    #[display("option could not be parsed")]
    MalformedOption = 6,
    #[display("spurious network failure")]
    NetworkFailure = 7,
    /// The server has no resources for the request. On deletion this means
    /// the mapping is already gone, which callers treat as success.
    #[display("not enough resources for this request")]
    NoResources = 8,
    #[display("unsupported protocol")]
    UnsuppProtocol = 9,
    #[display("quota exceeded")]
    UserExQuota = 10,
    #[display("requested external address cannot be provided")]
    CannotProvideExternal = 11,
    #[display("sender and declared ip do not match")]
    AddressMismatch = 12,
    #[display("excessive remote peers in filter option")]
    ExcessiveRemotePeers = 13,
}

/// A PCP MAP request.
///
/// Deletion is the same request with a zero lifetime and the nonce of the
/// mapping being deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest {
    /// Requested lifetime in seconds. Zero deletes the mapping named by the
    /// nonce.
    pub lifetime_seconds: u32,
    /// Address of the requesting client, carried IPv4-mapped on the wire.
    pub client_ip: Ipv4Addr,
    /// Nonce tying responses and later modifications to this mapping.
    pub nonce: [u8; 12],
    /// Port to map on this host.
    pub local_port: u16,
    /// Suggested external port; zero when the client has no preference.
    pub external_port: u16,
    /// Suggested external address; `None` when the client has no preference.
    pub external_address: Option<Ipv4Addr>,
}

impl MapRequest {
    /// Size of an encoded MAP request: the 24-byte common header plus the
    /// 36-byte MAP payload.
    pub const SIZE: usize = 60;

    /// Encode this [`MapRequest`].
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let MapRequest {
            lifetime_seconds,
            client_ip,
            nonce,
            local_port,
            external_port,
            external_address,
        } = self;
        let mut buf = [0u8; Self::SIZE];
        buf[0] = Version::Pcp.into();
        buf[1] = Opcode::Map.into();
        // buf[2..4] reserved
        buf[4..8].copy_from_slice(&lifetime_seconds.to_be_bytes());
        buf[8..24].copy_from_slice(&client_ip.to_ipv6_mapped().octets());
        buf[24..36].copy_from_slice(nonce);
        buf[36] = MapProtocol::Udp.into();
        // buf[37..40] reserved
        buf[40..42].copy_from_slice(&local_port.to_be_bytes());
        buf[42..44].copy_from_slice(&external_port.to_be_bytes());
        // no preference is the unspecified address, still IPv4-mapped
        let suggested = external_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
        buf[44..60].copy_from_slice(&suggested.to_ipv6_mapped().octets());
        buf
    }
}

/// A successful PCP MAP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapResponse {
    /// Granted lifetime in seconds.
    pub lifetime_seconds: u32,
    /// Server epoch, useful to detect gateway restarts.
    pub epoch_time: u32,
    /// Echo of the request nonce; must match before trusting the rest.
    pub nonce: [u8; 12],
    /// Echo of the mapped local port.
    pub local_port: u16,
    /// External port assigned by the gateway.
    pub external_port: u16,
    /// External address, IPv4-mapped for IPv4 gateways.
    pub external_address: Ipv6Addr,
}

/// Errors decoding a [`MapResponse`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("response is malformed")]
    Malformed,
    #[error("packet does not appear to be a response")]
    NotAResponse,
    #[error("invalid version received")]
    InvalidVersion,
    #[error("invalid opcode received")]
    InvalidOpcode,
    #[error("invalid result code received")]
    InvalidResultCode,
    #[error("mapping is not for udp")]
    InvalidProtocol,
    #[error("gateway refused the request: {0}")]
    Failure(ErrorCode),
}

impl MapResponse {
    /// Size of a MAP response without options.
    pub const SIZE: usize = 60;

    /// Max size of a PCP packet, per
    /// [RFC 6887 §7](https://datatracker.ietf.org/doc/html/rfc6887#section-7).
    pub const MAX_SIZE: usize = 1100;

    /// Indicator ORd into the [`Opcode`] to mark a response packet.
    pub const RESPONSE_INDICATOR: u8 = 1u8 << 7;

    /// Decode a response.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::SIZE || buf.len() > Self::MAX_SIZE {
            return Err(Error::Malformed);
        }

        let _: Version = buf[0].try_into().map_err(|_| Error::InvalidVersion)?;

        let opcode = buf[1];
        if opcode & Self::RESPONSE_INDICATOR != Self::RESPONSE_INDICATOR {
            return Err(Error::NotAResponse);
        }
        let _: Opcode = (opcode & !Self::RESPONSE_INDICATOR)
            .try_into()
            .map_err(|_| Error::InvalidOpcode)?;

        // buf[2] reserved

        let result_code = buf[3];
        if result_code != 0 {
            let code: ErrorCode = result_code
                .try_into()
                .map_err(|_| Error::InvalidResultCode)?;
            return Err(Error::Failure(code));
        }

        let lifetime_bytes = buf[4..8].try_into().expect("slice has the right len");
        let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);

        let epoch_bytes = buf[8..12].try_into().expect("slice has the right len");
        let epoch_time = u32::from_be_bytes(epoch_bytes);

        // buf[12..24] reserved

        let nonce = buf[24..36].try_into().expect("slice has the right len");

        let _: MapProtocol = buf[36].try_into().map_err(|_| Error::InvalidProtocol)?;

        // buf[37..40] reserved

        let local_port_bytes = buf[40..42].try_into().expect("slice has the right len");
        let local_port = u16::from_be_bytes(local_port_bytes);

        let external_port_bytes = buf[42..44].try_into().expect("slice has the right len");
        let external_port = u16::from_be_bytes(external_port_bytes);

        let external_addr_bytes: [u8; 16] =
            buf[44..60].try_into().expect("slice has the right len");
        let external_address = Ipv6Addr::from(external_addr_bytes);

        Ok(MapResponse {
            lifetime_seconds,
            epoch_time,
            nonce,
            local_port,
            external_port,
            external_address,
        })
    }

    #[cfg(test)]
    fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = Version::Pcp.into();
        buf[1] = Self::RESPONSE_INDICATOR | u8::from(Opcode::Map);
        buf[4..8].copy_from_slice(&self.lifetime_seconds.to_be_bytes());
        buf[8..12].copy_from_slice(&self.epoch_time.to_be_bytes());
        buf[24..36].copy_from_slice(&self.nonce);
        buf[36] = MapProtocol::Udp.into();
        buf[40..42].copy_from_slice(&self.local_port.to_be_bytes());
        buf[42..44].copy_from_slice(&self.external_port.to_be_bytes());
        buf[44..60].copy_from_slice(&self.external_address.octets());
        buf
    }
}
