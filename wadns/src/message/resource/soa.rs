use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use super::ResourceBody;
use crate::message::DnsType;
use crate::message::name::Name;
use crate::message::packer::*;
use shared::error::Result;

// An SoaResource is an SOA Resource record.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct SoaResource {
    pub ns: Name,
    pub mbox: Name,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,

    // min_ttl the is the amount of time to cache a negative response.
    pub min_ttl: u32,
}

impl fmt::Display for SoaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SoaResource{{NS: {}, MBox: {}, Serial: {}, Refresh: {}, Retry: {}, Expire: {}, MinTTL: {}}}",
            self.ns, self.mbox, self.serial, self.refresh, self.retry, self.expire, self.min_ttl
        )
    }
}

impl ResourceBody for SoaResource {
    fn real_type(&self) -> DnsType {
        DnsType::Soa
    }

    fn pack(
        &self,
        msg: Vec<u8>,
        compression: &mut Option<HashMap<String, usize>>,
        compression_off: usize,
    ) -> Result<Vec<u8>> {
        let msg = self.ns.pack(msg, compression, compression_off)?;
        let msg = self.mbox.pack(msg, compression, compression_off)?;
        let msg = pack_uint32(msg, self.serial);
        let msg = pack_uint32(msg, self.refresh);
        let msg = pack_uint32(msg, self.retry);
        let msg = pack_uint32(msg, self.expire);
        Ok(pack_uint32(msg, self.min_ttl))
    }

    fn unpack(&mut self, msg: &[u8], off: usize, _length: usize) -> Result<usize> {
        let off = self.ns.unpack(msg, off)?;
        let off = self.mbox.unpack(msg, off)?;
        let (serial, off) = unpack_uint32(msg, off)?;
        self.serial = serial;
        let (refresh, off) = unpack_uint32(msg, off)?;
        self.refresh = refresh;
        let (retry, off) = unpack_uint32(msg, off)?;
        self.retry = retry;
        let (expire, off) = unpack_uint32(msg, off)?;
        self.expire = expire;
        let (min_ttl, off) = unpack_uint32(msg, off)?;
        self.min_ttl = min_ttl;
        Ok(off)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
