// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Forward Daemon Contributors

// SOCKS5 wire codec: the two-message handshake preceding proxied data.
// Decoding is generic over AsyncRead so the state machine is testable
// against raw byte fixtures without a socket.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;

#[derive(Debug, Error)]
pub enum SocksError {
    /// Version byte other than 0x05; the connection is closed with no reply
    #[error("unsupported SOCKS version: {0:#04x}")]
    BadVersion(u8),

    /// Only CONNECT is supported
    #[error("unsupported SOCKS command: {0:#04x}")]
    BadCommand(u8),

    #[error("unsupported SOCKS address type: {0:#04x}")]
    BadAddressType(u8),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Method-negotiation greeting: `[0x05, n, methods...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

/// Destination requested by a CONNECT command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

impl SocksAddr {
    /// Host string suitable for a direct-tcpip channel open
    pub fn host(&self) -> String {
        match self {
            SocksAddr::V4(ip) => ip.to_string(),
            SocksAddr::Domain(name) => name.clone(),
            SocksAddr::V6(ip) => ip.to_string(),
        }
    }
}

/// Connection request: `[0x05, CMD, RSV, ATYP, ADDR..., PORT_HI, PORT_LO]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub addr: SocksAddr,
    pub port: u16,
}

/// Read and validate the method-negotiation greeting
pub async fn read_greeting<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Greeting, SocksError> {
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(SocksError::BadVersion(head[0]));
    }
    let mut methods = vec![0u8; head[1] as usize];
    reader.read_exact(&mut methods).await?;
    Ok(Greeting { methods })
}

/// Read and decode the connection request that follows method negotiation
pub async fn read_connect_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ConnectRequest, SocksError> {
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(SocksError::BadVersion(head[0]));
    }
    if head[1] != CMD_CONNECT {
        return Err(SocksError::BadCommand(head[1]));
    }

    let addr = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            SocksAddr::V4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            reader.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            reader.read_exact(&mut name).await?;
            SocksAddr::Domain(String::from_utf8_lossy(&name).to_string())
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            SocksAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(SocksError::BadAddressType(other)),
    };

    let mut port = [0u8; 2];
    reader.read_exact(&mut port).await?;

    Ok(ConnectRequest {
        addr,
        port: u16::from_be_bytes(port),
    })
}

/// Encode a reply. The bound address is elided as all-zero IPv4, the minimal
/// form standard SOCKS5 clients accept.
pub fn encode_reply(status: u8) -> [u8; 10] {
    [VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn greeting_no_auth() {
        let mut input: &[u8] = &[0x05, 0x01, 0x00];
        let greeting = read_greeting(&mut input).await.unwrap();
        assert_eq!(greeting.methods, vec![0x00]);
    }

    #[tokio::test]
    async fn greeting_multiple_methods() {
        let mut input: &[u8] = &[0x05, 0x03, 0x00, 0x01, 0x02];
        let greeting = read_greeting(&mut input).await.unwrap();
        assert_eq!(greeting.methods, vec![0x00, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn greeting_rejects_socks4() {
        let mut input: &[u8] = &[0x04, 0x01, 0x00];
        match read_greeting(&mut input).await {
            Err(SocksError::BadVersion(0x04)) => {}
            other => panic!("expected BadVersion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn greeting_truncated() {
        let mut input: &[u8] = &[0x05];
        assert!(matches!(
            read_greeting(&mut input).await,
            Err(SocksError::Io(_))
        ));
    }

    #[tokio::test]
    async fn connect_ipv4() {
        // CONNECT 93.184.216.34:80
        let mut input: &[u8] = &[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0, 80];
        let request = read_connect_request(&mut input).await.unwrap();
        assert_eq!(request.addr, SocksAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(request.addr.host(), "93.184.216.34");
        assert_eq!(request.port, 80);
    }

    #[tokio::test]
    async fn connect_domain() {
        let mut input: Vec<u8> = vec![0x05, 0x01, 0x00, 0x03, 0x0b];
        input.extend_from_slice(b"example.com");
        input.extend_from_slice(&443u16.to_be_bytes());
        let mut cursor: &[u8] = &input;
        let request = read_connect_request(&mut cursor).await.unwrap();
        assert_eq!(request.addr, SocksAddr::Domain("example.com".to_string()));
        assert_eq!(request.port, 443);
    }

    #[tokio::test]
    async fn connect_ipv6() {
        let mut input: Vec<u8> = vec![0x05, 0x01, 0x00, 0x04];
        input.extend_from_slice(&[
            0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01,
        ]);
        input.extend_from_slice(&22u16.to_be_bytes());
        let mut cursor: &[u8] = &input;
        let request = read_connect_request(&mut cursor).await.unwrap();
        assert_eq!(request.addr.host(), "2001:db8::1");
        assert_eq!(request.port, 22);
    }

    #[tokio::test]
    async fn connect_rejects_bind_command() {
        let mut input: &[u8] = &[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
        assert!(matches!(
            read_connect_request(&mut input).await,
            Err(SocksError::BadCommand(0x02))
        ));
    }

    #[tokio::test]
    async fn connect_rejects_unknown_address_type() {
        let mut input: &[u8] = &[0x05, 0x01, 0x00, 0x05, 0, 0];
        assert!(matches!(
            read_connect_request(&mut input).await,
            Err(SocksError::BadAddressType(0x05))
        ));
    }

    #[test]
    fn reply_byte_layout() {
        assert_eq!(
            encode_reply(REP_SUCCESS),
            [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            encode_reply(REP_GENERAL_FAILURE),
            [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }
}
