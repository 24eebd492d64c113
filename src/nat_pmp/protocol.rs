//! NAT-PMP wire format, see [RFC 6886](https://datatracker.ietf.org/doc/html/rfc6886).

use std::net::Ipv4Addr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Port the gateway listens on for NAT-PMP requests.
pub const SERVER_PORT: u16 = 5351;

/// NAT-PMP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    NatPmp = 0,
}

/// Request opcodes. Only UDP mappings are used here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Ask the gateway for its external address (RFC 6886 §3.2).
    DetermineExternalAddress = 0,
    /// Request a UDP mapping (RFC 6886 §3.3).
    MapUdp = 1,
}

/// Result codes a gateway can answer with (RFC 6886 §3.5).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, derive_more::Display,
)]
#[repr(u16)]
pub enum ResultCode {
    #[display("success")]
    Success = 0,
    #[display("unsupported version")]
    UnsupportedVersion = 1,
    /// The gateway speaks NAT-PMP but mapping is administratively disabled.
    #[display("not authorized or refused")]
    NotAuthorizedOrRefused = 2,
    /// E.g. the gateway has not obtained a DHCP lease itself yet.
    #[display("network failure")]
    NetworkFailure = 3,
    /// The gateway cannot create more mappings at this time.
    #[display("out of resources")]
    OutOfResources = 4,
    #[display("unsupported opcode")]
    UnsupportedOpcode = 5,
}

/// A NAT-PMP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask the gateway for its external address.
    ExternalAddress,
    /// Request a UDP mapping. A zero external port lets the gateway pick;
    /// a zero lifetime together with a zero external port deletes.
    Mapping {
        local_port: u16,
        external_port: u16,
        lifetime_seconds: u32,
    },
}

impl Request {
    /// Encode this [`Request`].
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::ExternalAddress => vec![
                Version::NatPmp.into(),
                Opcode::DetermineExternalAddress.into(),
            ],
            Request::Mapping {
                local_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut buf = vec![Version::NatPmp.into(), Opcode::MapUdp.into()];
                buf.push(0); // reserved
                buf.push(0); // reserved
                buf.extend_from_slice(&local_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
                buf
            }
        }
    }
}

/// A NAT-PMP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Answer to [`Request::ExternalAddress`].
    PublicAddress { epoch_time: u32, public_ip: Ipv4Addr },
    /// Answer to [`Request::Mapping`]. The granted external port may differ
    /// from the requested one when it was already taken.
    PortMap {
        epoch_time: u32,
        private_port: u16,
        external_port: u16,
        lifetime_seconds: u32,
    },
}

/// Errors decoding a [`Response`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("response is malformed")]
    Malformed,
    #[error("packet does not appear to be a response")]
    NotAResponse,
    #[error("invalid opcode received")]
    InvalidOpcode,
    #[error("invalid version received")]
    InvalidVersion,
    #[error("invalid result code received")]
    InvalidResultCode,
    #[error("gateway refused the request: {0}")]
    Failure(ResultCode),
}

impl Response {
    /// Size of an external-address response, the smallest a server sends.
    pub const MIN_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        4; // external address

    /// Size of a mapping response, the largest a server sends.
    pub const MAX_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        2 + // private port
        2 + // external port
        4; // lifetime

    /// Indicator ORd into the [`Opcode`] to mark a response packet.
    pub const INDICATOR: u8 = 1u8 << 7;

    /// Decode a response.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::MIN_SIZE || buf.len() > Self::MAX_SIZE {
            return Err(Error::Malformed);
        }
        let _: Version = buf[0].try_into().map_err(|_| Error::InvalidVersion)?;

        let opcode = buf[1];
        if opcode & Self::INDICATOR != Self::INDICATOR {
            return Err(Error::NotAResponse);
        }
        let opcode: Opcode = (opcode & !Self::INDICATOR)
            .try_into()
            .map_err(|_| Error::InvalidOpcode)?;

        let result_bytes =
            u16::from_be_bytes(buf[2..4].try_into().expect("slice has the right len"));
        let result_code: ResultCode = result_bytes
            .try_into()
            .map_err(|_| Error::InvalidResultCode)?;
        if result_code != ResultCode::Success {
            return Err(Error::Failure(result_code));
        }

        let epoch_bytes = buf[4..8].try_into().expect("slice has the right len");
        let epoch_time = u32::from_be_bytes(epoch_bytes);

        let response = match opcode {
            Opcode::DetermineExternalAddress => {
                let ip_bytes: [u8; 4] = buf[8..12].try_into().expect("slice has the right len");
                Response::PublicAddress {
                    epoch_time,
                    public_ip: ip_bytes.into(),
                }
            }
            Opcode::MapUdp => {
                if buf.len() < Self::MAX_SIZE {
                    return Err(Error::Malformed);
                }
                let private_port_bytes = buf[8..10].try_into().expect("slice has the right len");
                let private_port = u16::from_be_bytes(private_port_bytes);

                let external_port_bytes = buf[10..12].try_into().expect("slice has the right len");
                let external_port = u16::from_be_bytes(external_port_bytes);

                let lifetime_bytes = buf[12..16].try_into().expect("slice has the right len");
                let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);

                Response::PortMap {
                    epoch_time,
                    private_port,
                    external_port,
                    lifetime_seconds,
                }
            }
        };

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_request_layout() {
        let encoded = Request::Mapping {
            local_port: 0xabcd,
            external_port: 0x1234,
            lifetime_seconds: 7200,
        }
        .encode();

        assert_eq!(encoded.len(), 12);
        assert_eq!(encoded[0], 0); // version
        assert_eq!(encoded[1], 1); // opcode
        assert_eq!(&encoded[2..4], &[0, 0]); // reserved
        assert_eq!(&encoded[4..6], &0xabcdu16.to_be_bytes());
        assert_eq!(&encoded[6..8], &0x1234u16.to_be_bytes());
        assert_eq!(&encoded[8..12], &7200u32.to_be_bytes());
    }

    #[test]
    fn external_address_request_layout() {
        assert_eq!(Request::ExternalAddress.encode(), vec![0, 0]);
    }

    #[test]
    fn decodes_public_address_response() {
        let mut buf = vec![0u8, Response::INDICATOR, 0, 0];
        buf.extend_from_slice(&77u32.to_be_bytes());
        buf.extend_from_slice(&[81, 82, 83, 84]);

        let response = Response::decode(&buf).unwrap();
        assert_eq!(
            response,
            Response::PublicAddress {
                epoch_time: 77,
                public_ip: Ipv4Addr::new(81, 82, 83, 84),
            }
        );
    }

    #[test]
    fn decodes_port_map_response() {
        let mut buf = vec![0u8, Response::INDICATOR | 1, 0, 0];
        buf.extend_from_slice(&99u32.to_be_bytes());
        buf.extend_from_slice(&60000u16.to_be_bytes());
        buf.extend_from_slice(&60001u16.to_be_bytes());
        buf.extend_from_slice(&1800u32.to_be_bytes());

        let response = Response::decode(&buf).unwrap();
        assert_eq!(
            response,
            Response::PortMap {
                epoch_time: 99,
                private_port: 60000,
                external_port: 60001,
                lifetime_seconds: 1800,
            }
        );
    }

    #[test]
    fn negative_result_code_is_an_error() {
        let mut buf = vec![0u8, Response::INDICATOR | 1, 0, 4];
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&[0; 8]);

        assert_eq!(
            Response::decode(&buf),
            Err(Error::Failure(ResultCode::OutOfResources))
        );
    }

    #[test]
    fn missing_indicator_is_not_a_response() {
        let buf = Request::Mapping {
            local_port: 1,
            external_port: 2,
            lifetime_seconds: 3,
        }
        .encode();
        assert_eq!(Response::decode(&buf), Err(Error::NotAResponse));
    }

    #[test]
    fn truncated_packet_is_malformed() {
        assert_eq!(Response::decode(&[0, 128, 0]), Err(Error::Malformed));
    }
}
