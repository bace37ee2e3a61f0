use std::collections::HashMap;
use std::fmt;

use shared::error::Result;

use super::name::Name;
use super::{DnsClass, DnsType};

// A Question is a DNS query.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub typ: DnsType,
    pub class: DnsClass,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Question{{Name: {}, Type: {}, Class: {}}}",
            self.name, self.typ, self.class
        )
    }
}

impl Question {
    // pack appends the wire format of the Question to msg.
    pub(crate) fn pack(
        &self,
        msg: Vec<u8>,
        compression: &mut Option<HashMap<String, usize>>,
        compression_off: usize,
    ) -> Result<Vec<u8>> {
        let msg = self.name.pack(msg, compression, compression_off)?;
        let msg = self.typ.pack(msg);
        Ok(self.class.pack(msg))
    }

    pub(crate) fn unpack(&mut self, msg: &[u8], off: usize) -> Result<usize> {
        let off = self.name.unpack(msg, off)?;
        let off = self.typ.unpack(msg, off)?;
        self.class.unpack(msg, off)
    }
}
