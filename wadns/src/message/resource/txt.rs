use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use super::ResourceBody;
use crate::message::DnsType;
use crate::message::packer::*;
use shared::error::{Error, Result};

// A TxtResource is a TXT Resource record.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct TxtResource {
    pub txt: Vec<String>,
    pub(crate) length: usize,
}

impl fmt::Display for TxtResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxtResource{{TXT: {:?}}}", self.txt)
    }
}

impl ResourceBody for TxtResource {
    fn real_type(&self) -> DnsType {
        DnsType::Txt
    }

    fn pack(
        &self,
        mut msg: Vec<u8>,
        _compression: &mut Option<HashMap<String, usize>>,
        _compression_off: usize,
    ) -> Result<Vec<u8>> {
        for s in &self.txt {
            msg = pack_str(msg, s)?;
        }
        Ok(msg)
    }

    fn unpack(&mut self, msg: &[u8], off: usize, length: usize) -> Result<usize> {
        let mut txts = vec![];
        let mut n = 0;
        let mut off = off;
        while n < length {
            let (t, new_off) = unpack_str(msg, off)?;
            // Check if we got too many bytes.
            if length < new_off - off + n {
                return Err(Error::ErrCalcLen);
            }
            n += new_off - off;
            txts.push(t);
            off = new_off;
        }
        self.txt = txts;
        Ok(off)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
