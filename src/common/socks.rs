//! SOCKS5 client side: greeting probe and CONNECT through the tunnel

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// SOCKS5 version
pub const SOCKS5_VERSION: u8 = 0x05;

// SOCKS5 authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

// SOCKS5 address types
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;

/// SOCKS dialect spoken by the shadow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SocksVersion {
    Socks4,
    #[default]
    Socks5,
}

impl SocksVersion {
    /// URL scheme for proxy environment variables
    pub fn scheme(&self) -> &'static str {
        match self {
            SocksVersion::Socks4 => "socks4",
            SocksVersion::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for SocksVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// SOCKS5 authentication request
#[derive(Debug)]
pub struct AuthRequest {
    pub methods: Vec<u8>,
}

impl AuthRequest {
    pub fn no_auth() -> Self {
        AuthRequest {
            methods: vec![AUTH_NO_AUTH],
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(2 + self.methods.len());
        buf.push(SOCKS5_VERSION);
        buf.push(self.methods.len() as u8);
        buf.extend_from_slice(&self.methods);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// SOCKS5 authentication response
pub struct AuthResponse {
    pub method: u8,
}

impl AuthResponse {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await?;

        if buf[0] != SOCKS5_VERSION {
            return Err(Error::tunnel_lost(format!(
                "unexpected SOCKS version from shadow: {}",
                buf[0]
            )));
        }

        Ok(AuthResponse { method: buf[1] })
    }
}

/// Check that the stream is answered by a SOCKS server of the given dialect.
///
/// SOCKS4 has no greeting, so only reachability is verified there.
pub async fn probe<S>(stream: &mut S, version: SocksVersion) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if version == SocksVersion::Socks4 {
        return Ok(());
    }

    AuthRequest::no_auth().write_to(stream).await?;
    let response = AuthResponse::read_from(stream).await?;
    match response.method {
        AUTH_NO_AUTH => Ok(()),
        AUTH_NO_ACCEPTABLE => Err(Error::tunnel_lost(
            "shadow SOCKS server rejected unauthenticated access",
        )),
        other => Err(Error::tunnel_lost(format!(
            "shadow SOCKS server chose unsupported method {}",
            other
        ))),
    }
}

/// Open a CONNECT to `target` on a SOCKS5 stream; on success the stream carries the target's bytes
pub async fn connect<S>(stream: &mut S, target: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    probe(stream, SocksVersion::Socks5).await?;

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match target {
        SocketAddr::V4(addr) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&addr.ip().octets());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(Error::tunnel_lost(format!(
            "unexpected SOCKS version from shadow: {}",
            reply[0]
        )));
    }
    if reply[1] != REP_SUCCEEDED {
        return Err(Error::system(format!(
            "shadow refused CONNECT to {}: {}",
            target,
            reply_message(reply[1])
        )));
    }

    // bound address, unused
    match reply[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4 + 2];
            stream.read_exact(&mut buf).await?;
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16 + 2];
            stream.read_exact(&mut buf).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
        }
        other => {
            return Err(Error::tunnel_lost(format!(
                "unknown address type {} in SOCKS reply",
                other
            )));
        }
    }
    Ok(())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_probe_socks5_accepts() {
        let mut mock = Builder::new()
            .write(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH])
            .read(&[SOCKS5_VERSION, AUTH_NO_AUTH])
            .build();
        probe(&mut mock, SocksVersion::Socks5).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_socks5_rejected() {
        let mut mock = Builder::new()
            .write(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH])
            .read(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
            .build();
        let err = probe(&mut mock, SocksVersion::Socks5).await.unwrap_err();
        assert!(matches!(err, Error::TunnelLost(_)));
    }

    #[tokio::test]
    async fn test_probe_wrong_version() {
        let mut mock = Builder::new()
            .write(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH])
            .read(&[0x04, 0x5a])
            .build();
        assert!(probe(&mut mock, SocksVersion::Socks5).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_socks4_no_io() {
        let mut mock = Builder::new().build();
        probe(&mut mock, SocksVersion::Socks4).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_ipv4_target() {
        let mut mock = Builder::new()
            .write(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH])
            .read(&[SOCKS5_VERSION, AUTH_NO_AUTH])
            .write(&[SOCKS5_VERSION, CMD_CONNECT, 0, ATYP_IPV4, 10, 96, 0, 10, 0x1f, 0x90])
            .read(&[SOCKS5_VERSION, REP_SUCCEEDED, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .build();
        connect(&mut mock, "10.96.0.10:8080".parse().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut mock = Builder::new()
            .write(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH])
            .read(&[SOCKS5_VERSION, AUTH_NO_AUTH])
            .write(&[SOCKS5_VERSION, CMD_CONNECT, 0, ATYP_IPV4, 10, 96, 0, 10, 0, 80])
            .read(&[SOCKS5_VERSION, 0x05, 0, ATYP_IPV4])
            .build();
        let err = connect(&mut mock, "10.96.0.10:80".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "System state error: shadow refused CONNECT to 10.96.0.10:80: connection refused"
        );
    }

    #[test]
    fn test_scheme() {
        assert_eq!(SocksVersion::Socks5.to_string(), "socks5");
        assert_eq!(SocksVersion::Socks4.scheme(), "socks4");
    }
}
