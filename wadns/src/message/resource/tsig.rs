use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use super::ResourceBody;
use crate::message::DnsType;
use crate::message::name::Name;
use crate::message::packer::*;
use shared::error::{Error, Result};

// TSIG rcodes carried in the record's error field (RFC 2845).
pub const TSIG_ERR_BAD_SIG: u16 = 16;
pub const TSIG_ERR_BAD_KEY: u16 = 17;
pub const TSIG_ERR_BAD_TIME: u16 = 18;

// A TsigResource is a TSIG transaction signature record (RFC 2845).
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct TsigResource {
    pub alg_name: Name,
    /// 48-bit seconds since the epoch.
    pub time_signed: u64,
    pub fudge: u16,
    pub mac: Vec<u8>,
    pub orig_id: u16,
    pub error: u16,
    pub other: Vec<u8>,
}

impl fmt::Display for TsigResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TsigResource{{Alg: {}, Time: {}, Fudge: {}, MAC: {} bytes, OrigID: {}, Error: {}}}",
            self.alg_name,
            self.time_signed,
            self.fudge,
            self.mac.len(),
            self.orig_id,
            self.error
        )
    }
}

impl ResourceBody for TsigResource {
    fn real_type(&self) -> DnsType {
        DnsType::Tsig
    }

    fn pack(
        &self,
        msg: Vec<u8>,
        _compression: &mut Option<HashMap<String, usize>>,
        _compression_off: usize,
    ) -> Result<Vec<u8>> {
        // Algorithm name is never compressed.
        let mut msg = self.alg_name.pack(msg, &mut None, 0)?;
        msg.extend_from_slice(&self.time_signed.to_be_bytes()[2..8]);
        let msg = pack_uint16(msg, self.fudge);
        let mut msg = pack_uint16(msg, self.mac.len() as u16);
        msg.extend_from_slice(&self.mac);
        let msg = pack_uint16(msg, self.orig_id);
        let mut msg = pack_uint16(msg, self.error);
        msg.extend_from_slice(&(self.other.len() as u16).to_be_bytes());
        msg.extend_from_slice(&self.other);
        Ok(msg)
    }

    fn unpack(&mut self, msg: &[u8], off: usize, _length: usize) -> Result<usize> {
        let off = self.alg_name.unpack(msg, off)?;
        if off + 6 > msg.len() {
            return Err(Error::ErrBaseLen);
        }
        let mut t = [0u8; 8];
        t[2..8].copy_from_slice(&msg[off..off + 6]);
        self.time_signed = u64::from_be_bytes(t);
        let (fudge, off) = unpack_uint16(msg, off + 6)?;
        self.fudge = fudge;
        let (mac_len, off) = unpack_uint16(msg, off)?;
        let mac_end = off + mac_len as usize;
        if mac_end > msg.len() {
            return Err(Error::ErrCalcLen);
        }
        self.mac = msg[off..mac_end].to_vec();
        let (orig_id, off) = unpack_uint16(msg, mac_end)?;
        self.orig_id = orig_id;
        let (error, off) = unpack_uint16(msg, off)?;
        self.error = error;
        let (other_len, off) = unpack_uint16(msg, off)?;
        let other_end = off + other_len as usize;
        if other_end > msg.len() {
            return Err(Error::ErrCalcLen);
        }
        self.other = msg[off..other_end].to_vec();
        Ok(other_end)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
