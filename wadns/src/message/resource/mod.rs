pub(crate) mod a;
pub(crate) mod aaaa;
pub(crate) mod cname;
pub(crate) mod opt;
pub(crate) mod ptr;
pub(crate) mod soa;
pub(crate) mod srv;
pub(crate) mod tsig;
pub(crate) mod txt;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use a::*;
use aaaa::*;
use cname::*;
use opt::*;
use ptr::*;
use soa::*;
use srv::*;
use tsig::*;
use txt::*;

use super::name::Name;
use super::packer::*;
use super::*;
use shared::error::*;

// A Resource is a DNS resource record.
#[derive(Default, Debug)]
pub struct Resource {
    pub header: ResourceHeader,
    pub body: Option<Box<dyn ResourceBody>>,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Resource{{Header: {}, Body: {}}}",
            self.header,
            if let Some(body) = &self.body {
                body.to_string()
            } else {
                "None".to_owned()
            }
        )
    }
}

impl Resource {
    // pack appends the wire format of the Resource to msg.
    //
    // A body-less Resource packs with a zero-length RDATA section; dynamic
    // updates use this shape for RRset deletions.
    pub(crate) fn pack(
        &mut self,
        msg: Vec<u8>,
        compression: &mut Option<HashMap<String, usize>>,
        compression_off: usize,
    ) -> Result<Vec<u8>> {
        if let Some(body) = &self.body {
            self.header.typ = body.real_type();
        }
        let (mut msg, len_off) = self.header.pack(msg, compression, compression_off)?;
        let pre_len = msg.len();
        if let Some(body) = &self.body {
            msg = body.pack(msg, compression, compression_off)?;
            self.header.fix_len(&mut msg, len_off, pre_len)?;
        }
        Ok(msg)
    }

    pub(crate) fn unpack(&mut self, msg: &[u8], mut off: usize) -> Result<usize> {
        off = self.header.unpack(msg, off)?;
        let (rb, off) =
            unpack_resource_body(self.header.typ, msg, off, self.header.length as usize)?;
        self.body = rb;
        Ok(off)
    }

    pub(crate) fn skip(msg: &[u8], off: usize) -> Result<usize> {
        let mut new_off = Name::skip(msg, off)?;
        new_off = DnsType::skip(msg, new_off)?;
        new_off = DnsClass::skip(msg, new_off)?;
        new_off = skip_uint32(msg, new_off)?;
        let (length, mut new_off) = unpack_uint16(msg, new_off)?;
        new_off += length as usize;
        if new_off > msg.len() {
            return Err(Error::ErrResourceLen);
        }
        Ok(new_off)
    }
}

/// Common header of every resource record: name, type, class, TTL and the
/// length of the record data that follows.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct ResourceHeader {
    pub name: Name,

    /// Filled in from the body type during packing when a body is present.
    pub typ: DnsType,

    pub class: DnsClass,

    pub ttl: u32,

    /// Length of the RDATA; set automatically during packing.
    pub length: u16,
}

impl fmt::Display for ResourceHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResourceHeader{{Name: {}, Type: {}, Class: {}, TTL: {}, Length: {}}}",
            self.name, self.typ, self.class, self.ttl, self.length,
        )
    }
}

impl ResourceHeader {
    // pack appends the wire format of the ResourceHeader to msg.
    //
    // Returns the extended buffer and the offset of the Length field, so the
    // caller can patch it once the body length is known.
    pub(crate) fn pack(
        &self,
        mut msg: Vec<u8>,
        compression: &mut Option<HashMap<String, usize>>,
        compression_off: usize,
    ) -> Result<(Vec<u8>, usize)> {
        msg = self.name.pack(msg, compression, compression_off)?;
        msg = self.typ.pack(msg);
        msg = self.class.pack(msg);
        msg = pack_uint32(msg, self.ttl);
        let len_off = msg.len();
        msg = pack_uint16(msg, self.length);
        Ok((msg, len_off))
    }

    pub(crate) fn unpack(&mut self, msg: &[u8], off: usize) -> Result<usize> {
        let mut new_off = off;
        new_off = self.name.unpack(msg, new_off)?;
        new_off = self.typ.unpack(msg, new_off)?;
        new_off = self.class.unpack(msg, new_off)?;
        let (ttl, new_off) = unpack_uint32(msg, new_off)?;
        self.ttl = ttl;
        let (l, new_off) = unpack_uint16(msg, new_off)?;
        self.length = l;
        Ok(new_off)
    }

    // fix_len patches the Length field at len_off once the body has been
    // packed; pre_len is the buffer length just before the body.
    pub(crate) fn fix_len(&mut self, msg: &mut [u8], len_off: usize, pre_len: usize) -> Result<()> {
        if msg.len() < pre_len || msg.len() > pre_len + u16::MAX as usize {
            return Err(Error::ErrResourceLen);
        }

        let con_len = msg.len() - pre_len;
        msg[len_off] = ((con_len >> 8) & 0xFF) as u8;
        msg[len_off + 1] = (con_len & 0xFF) as u8;
        self.length = con_len as u16;

        Ok(())
    }
}

// A ResourceBody is a DNS resource record minus the header.
pub trait ResourceBody: fmt::Display + fmt::Debug {
    // real_type returns the actual type of the Resource, used to fill in the
    // header Type field.
    fn real_type(&self) -> DnsType;

    // pack packs a Resource except for its header.
    fn pack(
        &self,
        msg: Vec<u8>,
        compression: &mut Option<HashMap<String, usize>>,
        compression_off: usize,
    ) -> Result<Vec<u8>>;

    fn unpack(&mut self, msg: &[u8], off: usize, length: usize) -> Result<usize>;

    fn as_any(&self) -> &dyn Any;
}

// An opaque body preserving the RDATA of record types the engine has no
// parser for.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct OpaqueResource {
    pub typ: DnsType,
    pub data: Vec<u8>,
}

impl fmt::Display for OpaqueResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueResource{{{} bytes}}", self.data.len())
    }
}

impl ResourceBody for OpaqueResource {
    fn real_type(&self) -> DnsType {
        self.typ
    }

    fn pack(
        &self,
        msg: Vec<u8>,
        _compression: &mut Option<HashMap<String, usize>>,
        _compression_off: usize,
    ) -> Result<Vec<u8>> {
        Ok(pack_bytes(msg, &self.data))
    }

    fn unpack(&mut self, msg: &[u8], off: usize, length: usize) -> Result<usize> {
        if off + length > msg.len() {
            return Err(Error::ErrCalcLen);
        }
        self.data = msg[off..off + length].to_vec();
        Ok(off + length)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn unpack_resource_body(
    typ: DnsType,
    msg: &[u8],
    mut off: usize,
    length: usize,
) -> Result<(Option<Box<dyn ResourceBody>>, usize)> {
    if length == 0 {
        // Zero-length RDATA is legitimate in dynamic updates (RRset
        // deletion); there is nothing to parse.
        return Ok((None, off));
    }

    let mut rb: Box<dyn ResourceBody> = match typ {
        DnsType::A => Box::<AResource>::default(),
        DnsType::Aaaa => Box::<AaaaResource>::default(),
        DnsType::Cname => Box::<CnameResource>::default(),
        DnsType::Soa => Box::<SoaResource>::default(),
        DnsType::Ptr => Box::<PtrResource>::default(),
        DnsType::Txt => Box::new(TxtResource {
            length,
            ..Default::default()
        }),
        DnsType::Srv => Box::<SrvResource>::default(),
        DnsType::Opt => Box::new(OptResource {
            length,
            ..Default::default()
        }),
        DnsType::Tsig => Box::<TsigResource>::default(),
        _ => Box::new(OpaqueResource {
            typ,
            ..Default::default()
        }),
    };

    off = rb.unpack(msg, off, length)?;
    Ok((Some(rb), off))
}
