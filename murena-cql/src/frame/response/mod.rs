//! CQL responses sent by the server.

pub mod error;
pub mod result;
pub mod supported;

pub use error::Error;
pub use supported::Supported;

use crate::frame::frame_errors::ParseError;
use crate::frame::TryFromPrimitiveError;

/// Opcode of a response, used to identify the response type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x00 => Ok(Self::Error),
            0x02 => Ok(Self::Ready),
            0x03 => Ok(Self::Authenticate),
            0x06 => Ok(Self::Supported),
            0x08 => Ok(Self::Result),
            0x0C => Ok(Self::Event),
            0x0E => Ok(Self::AuthChallenge),
            0x10 => Ok(Self::AuthSuccess),
            _ => Err(TryFromPrimitiveError::new("ResponseOpcode", value)),
        }
    }
}

/// A deserialized response body.
#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Result(result::Result),
    /// The server requests SASL authentication; carries the authenticator
    /// class name. The driver does not implement the authentication
    /// exchange, so this only ever turns into an error upstream.
    Authenticate(String),
    Supported(Supported),
}

impl Response {
    pub fn deserialize(opcode: ResponseOpcode, buf: &mut &[u8]) -> Result<Response, ParseError> {
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => {
                Response::Authenticate(crate::frame::types::read_string(buf)?.to_owned())
            }
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Result => Response::Result(result::deserialize(buf)?),
            ResponseOpcode::Event | ResponseOpcode::AuthChallenge | ResponseOpcode::AuthSuccess => {
                return Err(ParseError::BadIncomingData(format!(
                    "Unsolicited response frame: {:?}",
                    opcode
                )));
            }
        };

        Ok(response)
    }

    /// A short name of the response kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Error(_) => "ERROR",
            Response::Ready => "READY",
            Response::Result(_) => "RESULT",
            Response::Authenticate(_) => "AUTHENTICATE",
            Response::Supported(_) => "SUPPORTED",
        }
    }
}
