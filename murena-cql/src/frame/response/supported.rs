use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use std::collections::HashMap;

/// Options supported by the server, sent in response to OPTIONS.
#[derive(Debug, Clone)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Supported, ParseError> {
        let options = types::read_string_multimap(buf)?;

        Ok(Supported { options })
    }
}
