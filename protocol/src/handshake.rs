//! Plain-text datagrams exchanged on the connect port before a session exists.

use crate::error::HandshakeError;

/// Protocol version the server speaks.
pub const PROTOCOL_VERSION: &str = "0.83";

const HELLO: &str = "HELLO";
const HELLO_RESPONSE: &str = "HELLOD00D";
const TOO_MANY_USERS: &str = "TOO";
const PING: &str = "PING";
const PONG: &str = "PONG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMessage {
    /// Client asks for a session, naming its protocol version.
    Hello { version: String },
    /// Server accepts and names the dedicated port for the session.
    HelloResponse { port: u16 },
    /// Server is full.
    TooManyUsers,
    Ping,
    Pong,
}

impl ConnectMessage {
    pub fn parse(datagram: &[u8]) -> Result<Self, HandshakeError> {
        let end = datagram
            .iter()
            .position(|&b| b == 0)
            .ok_or(HandshakeError::Unterminated)?;
        let text: String = datagram[..end].iter().map(|&b| b as char).collect();

        if let Some(rest) = text.strip_prefix(HELLO_RESPONSE) {
            return rest
                .parse()
                .map(|port| ConnectMessage::HelloResponse { port })
                .map_err(|_| HandshakeError::Unrecognised(text.clone()));
        }
        if let Some(version) = text.strip_prefix(HELLO) {
            return Ok(ConnectMessage::Hello {
                version: version.to_string(),
            });
        }
        match text.as_str() {
            TOO_MANY_USERS => Ok(ConnectMessage::TooManyUsers),
            PING => Ok(ConnectMessage::Ping),
            PONG => Ok(ConnectMessage::Pong),
            _ => Err(HandshakeError::Unrecognised(text)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let text = match self {
            ConnectMessage::Hello { version } => format!("{HELLO}{version}"),
            ConnectMessage::HelloResponse { port } => format!("{HELLO_RESPONSE}{port}"),
            ConnectMessage::TooManyUsers => TOO_MANY_USERS.to_string(),
            ConnectMessage::Ping => PING.to_string(),
            ConnectMessage::Pong => PONG.to_string(),
        };
        let mut bytes = text.into_bytes();
        bytes.push(0);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_hello() {
        assert_eq!(
            ConnectMessage::parse(b"HELLO0.83\0").unwrap(),
            ConnectMessage::Hello {
                version: "0.83".into()
            }
        );
    }

    #[test]
    fn test_server_responses() {
        assert_eq!(
            ConnectMessage::HelloResponse { port: 27889 }.encode(),
            b"HELLOD00D27889\0".to_vec()
        );
        assert_eq!(ConnectMessage::TooManyUsers.encode(), b"TOO\0".to_vec());
        assert_eq!(
            ConnectMessage::parse(b"HELLOD00D27889\0").unwrap(),
            ConnectMessage::HelloResponse { port: 27889 }
        );
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(ConnectMessage::parse(b"PING\0").unwrap(), ConnectMessage::Ping);
        assert_eq!(ConnectMessage::Pong.encode(), b"PONG\0".to_vec());
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(
            ConnectMessage::parse(b"PING"),
            Err(HandshakeError::Unterminated)
        );
        assert!(matches!(
            ConnectMessage::parse(b"HOWDY\0"),
            Err(HandshakeError::Unrecognised(_))
        ));
    }
}
