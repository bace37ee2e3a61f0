#[cfg(test)]
mod message_test;

pub(crate) mod header;
pub(crate) mod name;
mod packer;
pub(crate) mod question;
pub(crate) mod resource;
pub(crate) mod tsig;
pub(crate) mod update;

use std::collections::HashMap;
use std::fmt;

use header::*;
use packer::*;

pub use header::Header;
pub use name::Name;
pub use question::Question;
pub use resource::{Resource, ResourceBody, ResourceHeader};

use shared::error::*;

// Message formats

// A DnsType is a type of DNS request and response.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DnsType {
    A = 1,
    Ns = 2,
    Cname = 5,
    Soa = 6,
    Ptr = 12,
    Txt = 16,
    Aaaa = 28,
    Srv = 33,
    Opt = 41,
    Tsig = 250,

    // question-only type
    Any = 255,

    #[default]
    Unsupported = 0,
}

impl From<u16> for DnsType {
    fn from(v: u16) -> Self {
        match v {
            1 => DnsType::A,
            2 => DnsType::Ns,
            5 => DnsType::Cname,
            6 => DnsType::Soa,
            12 => DnsType::Ptr,
            16 => DnsType::Txt,
            28 => DnsType::Aaaa,
            33 => DnsType::Srv,
            41 => DnsType::Opt,
            250 => DnsType::Tsig,
            255 => DnsType::Any,
            _ => DnsType::Unsupported,
        }
    }
}

impl fmt::Display for DnsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            DnsType::A => "A",
            DnsType::Ns => "NS",
            DnsType::Cname => "CNAME",
            DnsType::Soa => "SOA",
            DnsType::Ptr => "PTR",
            DnsType::Txt => "TXT",
            DnsType::Aaaa => "AAAA",
            DnsType::Srv => "SRV",
            DnsType::Opt => "OPT",
            DnsType::Tsig => "TSIG",
            DnsType::Any => "ANY",
            _ => "Unsupported",
        };
        write!(f, "{s}")
    }
}

impl DnsType {
    // pack appends the wire format of the type to msg.
    pub(crate) fn pack(&self, msg: Vec<u8>) -> Vec<u8> {
        pack_uint16(msg, *self as u16)
    }

    pub(crate) fn unpack(&mut self, msg: &[u8], off: usize) -> Result<usize> {
        let (t, o) = unpack_uint16(msg, off)?;
        *self = DnsType::from(t);
        Ok(o)
    }

    pub(crate) fn skip(msg: &[u8], off: usize) -> Result<usize> {
        skip_uint16(msg, off)
    }
}

// A DnsClass is a class of network.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct DnsClass(pub u16);

/// Internet class (IN), used by every ordinary record and question.
pub const DNSCLASS_INET: DnsClass = DnsClass(1);

/// NONE class, used by dynamic updates to delete a specific record.
pub const DNSCLASS_NONE: DnsClass = DnsClass(254);

/// ANY class, used by dynamic updates to delete RRsets and by TSIG records.
pub const DNSCLASS_ANY: DnsClass = DnsClass(255);

impl fmt::Display for DnsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let other = format!("{}", self.0);
        let s = match *self {
            DNSCLASS_INET => "ClassINET",
            DNSCLASS_NONE => "ClassNONE",
            DNSCLASS_ANY => "ClassANY",
            _ => other.as_str(),
        };
        write!(f, "{s}")
    }
}

impl DnsClass {
    pub(crate) fn pack(&self, msg: Vec<u8>) -> Vec<u8> {
        pack_uint16(msg, self.0)
    }

    pub(crate) fn unpack(&mut self, msg: &[u8], off: usize) -> Result<usize> {
        let (c, o) = unpack_uint16(msg, off)?;
        *self = DnsClass(c);
        Ok(o)
    }

    pub(crate) fn skip(msg: &[u8], off: usize) -> Result<usize> {
        skip_uint16(msg, off)
    }
}

// An OpCode is a DNS operation code.
pub type OpCode = u16;

/// Standard query opcode.
pub const OPCODE_QUERY: OpCode = 0;

/// Dynamic update opcode (RFC 2136).
pub const OPCODE_UPDATE: OpCode = 5;

// An RCode is a DNS response status code.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub enum RCode {
    #[default]
    Success = 0,
    FormatError = 1,
    ServerFailure = 2,
    NameError = 3,
    NotImplemented = 4,
    Refused = 5,
    YxDomain = 6,
    YxRrset = 7,
    NxRrset = 8,
    NotAuth = 9,
    NotZone = 10,
    Unsupported = 15,
}

impl From<u8> for RCode {
    fn from(v: u8) -> Self {
        match v {
            0 => RCode::Success,
            1 => RCode::FormatError,
            2 => RCode::ServerFailure,
            3 => RCode::NameError,
            4 => RCode::NotImplemented,
            5 => RCode::Refused,
            6 => RCode::YxDomain,
            7 => RCode::YxRrset,
            8 => RCode::NxRrset,
            9 => RCode::NotAuth,
            10 => RCode::NotZone,
            _ => RCode::Unsupported,
        }
    }
}

impl fmt::Display for RCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RCode::Success => "RCodeSuccess",
            RCode::FormatError => "RCodeFormatError",
            RCode::ServerFailure => "RCodeServerFailure",
            RCode::NameError => "RCodeNameError",
            RCode::NotImplemented => "RCodeNotImplemented",
            RCode::Refused => "RCodeRefused",
            RCode::YxDomain => "RCodeYXDomain",
            RCode::YxRrset => "RCodeYXRRSet",
            RCode::NxRrset => "RCodeNXRRSet",
            RCode::NotAuth => "RCodeNotAuth",
            RCode::NotZone => "RCodeNotZone",
            RCode::Unsupported => "RCodeUnsupported",
        };
        write!(f, "{s}")
    }
}

// Internal constants.

// PACK_STARTING_CAP is the default initial buffer size allocated during
// packing. Most DNS messages over UDP stay under 512 bytes.
const PACK_STARTING_CAP: usize = 512;

// UINT16LEN is the length (in bytes) of a uint16.
pub(crate) const UINT16LEN: usize = 2;

// UINT32LEN is the length (in bytes) of a uint32.
pub(crate) const UINT32LEN: usize = 4;

// HEADER_LEN is the length (in bytes) of a DNS header: 6 uint16s, no padding.
pub(crate) const HEADER_LEN: usize = 6 * UINT16LEN;

pub(crate) const HEADER_BIT_QR: u16 = 1 << 15; // query/response (response=1)
pub(crate) const HEADER_BIT_AA: u16 = 1 << 10; // authoritative
pub(crate) const HEADER_BIT_TC: u16 = 1 << 9; // truncated
pub(crate) const HEADER_BIT_RD: u16 = 1 << 8; // recursion desired
pub(crate) const HEADER_BIT_RA: u16 = 1 << 7; // recursion available

// Message is a representation of a DNS message.
//
// For dynamic updates the four sections double as Zone (questions),
// Prerequisite (answers), Update (authorities) and Additional, per RFC 2136.
#[derive(Default, Debug)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Resource>,
    pub authorities: Vec<Resource>,
    pub additionals: Vec<Resource>,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message{{Header: {}, Questions: {}, Answers: {}, Authorities: {}, Additionals: {}}}",
            self.header,
            self.questions.len(),
            self.answers.len(),
            self.authorities.len(),
            self.additionals.len(),
        )
    }
}

impl Message {
    // unpack parses a full Message.
    pub fn unpack(&mut self, msg: &[u8]) -> Result<()> {
        let mut hi = HeaderInternal::default();
        let mut off = hi.unpack(msg, 0)?;
        self.header = hi.header();

        self.questions.clear();
        for _ in 0..hi.questions {
            let mut q = Question::default();
            off = q.unpack(msg, off)?;
            self.questions.push(q);
        }
        for (count, section) in [
            (hi.answers, &mut self.answers),
            (hi.authorities, &mut self.authorities),
            (hi.additionals, &mut self.additionals),
        ] {
            section.clear();
            for _ in 0..count {
                let mut r = Resource::default();
                off = r.unpack(msg, off)?;
                section.push(r);
            }
        }
        Ok(())
    }

    // pack packs a full Message.
    pub fn pack(&mut self) -> Result<Vec<u8>> {
        self.append_pack(Vec::with_capacity(PACK_STARTING_CAP))
    }

    // append_pack is like pack but appends the full Message to b and returns
    // the extended buffer.
    pub(crate) fn append_pack(&mut self, b: Vec<u8>) -> Result<Vec<u8>> {
        if self.questions.len() > u16::MAX as usize {
            return Err(Error::ErrTooManyQuestions);
        }
        if self.answers.len() > u16::MAX as usize {
            return Err(Error::ErrTooManyAnswers);
        }
        if self.authorities.len() > u16::MAX as usize {
            return Err(Error::ErrTooManyAuthorities);
        }
        if self.additionals.len() > u16::MAX as usize {
            return Err(Error::ErrTooManyAdditionals);
        }

        let (id, bits) = self.header.pack();

        let h = HeaderInternal {
            id,
            bits,
            questions: self.questions.len() as u16,
            answers: self.answers.len() as u16,
            authorities: self.authorities.len() as u16,
            additionals: self.additionals.len() as u16,
        };

        let compression_off = b.len();
        let mut msg = h.pack(b);

        // RFC 1035 allows compression for packing; unpacking implementations
        // are required to support it, so enabling it unconditionally is fine
        // and keeps UDP messages under the 512-byte limit more often.
        let mut compression = Some(HashMap::new());

        for question in &self.questions {
            msg = question.pack(msg, &mut compression, compression_off)?;
        }
        for answer in &mut self.answers {
            msg = answer.pack(msg, &mut compression, compression_off)?;
        }
        for authority in &mut self.authorities {
            msg = authority.pack(msg, &mut compression, compression_off)?;
        }
        for additional in &mut self.additionals {
            msg = additional.pack(msg, &mut compression, compression_off)?;
        }

        Ok(msg)
    }

    /// Builds a plain one-shot query message.
    pub fn query(id: u16, name: Name, typ: DnsType) -> Message {
        Message {
            header: Header {
                id,
                recursion_desired: true,
                ..Default::default()
            },
            questions: vec![Question {
                name,
                typ,
                class: DNSCLASS_INET,
            }],
            ..Default::default()
        }
    }

    /// First answer of the given type with a non-empty body, when present.
    pub fn answer_of_type(&self, typ: DnsType) -> Option<&Resource> {
        self.answers
            .iter()
            .find(|r| r.header.typ == typ && r.body.is_some())
    }

    /// The LLQ option data out of the additionals, when present.
    pub fn llq_option(&self) -> Option<resource::opt::LlqData> {
        self.additionals.iter().find_map(|r| {
            r.body
                .as_ref()?
                .as_any()
                .downcast_ref::<resource::opt::OptResource>()?
                .llq()
                .copied()
        })
    }

    /// The update-lease option out of the additionals, when present.
    pub fn update_lease_option(&self) -> Option<u32> {
        self.additionals.iter().find_map(|r| {
            r.body
                .as_ref()?
                .as_any()
                .downcast_ref::<resource::opt::OptResource>()?
                .update_lease()
        })
    }
}

/// Reads the id field of a packed message.
pub(crate) fn raw_id(raw: &[u8]) -> Option<u16> {
    if raw.len() >= 2 {
        Some(u16::from_be_bytes([raw[0], raw[1]]))
    } else {
        None
    }
}
