use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use super::ResourceBody;
use crate::message::DnsType;
use crate::message::packer::*;
use shared::error::{Error, Result};

// EDNS0 option codes understood by the engine.

/// Long-lived query metadata option.
pub const OPT_LLQ: u16 = 1;

/// Dynamic-update lease option.
pub const OPT_UPDATE_LEASE: u16 = 2;

// LLQ opcodes.
pub const LLQ_OP_SETUP: u16 = 1;
pub const LLQ_OP_REFRESH: u16 = 2;
pub const LLQ_OP_EVENT: u16 = 3;

// LLQ error codes (carried in the 16-bit error field; on stream setup and
// refresh requests the same field carries the UDP event port instead).
pub const LLQ_ERR_NO_ERROR: u16 = 0;
pub const LLQ_ERR_SERV_FULL: u16 = 1;
pub const LLQ_ERR_STATIC: u16 = 2;
pub const LLQ_ERR_FORM_ERR: u16 = 3;
pub const LLQ_ERR_NO_SUCH_LLQ: u16 = 4;
pub const LLQ_ERR_BAD_VERS: u16 = 5;
pub const LLQ_ERR_UNKNOWN: u16 = 6;

/// Wire payload of the LLQ EDNS0 option: version, opcode, error/event-port,
/// 64-bit session id and 32-bit lease.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlqData {
    pub vers: u16,
    pub op: u16,
    pub err: u16,
    pub id: u64,
    pub lease: u32,
}

impl LlqData {
    pub(crate) fn pack(&self, msg: Vec<u8>) -> Vec<u8> {
        let msg = pack_uint16(msg, self.vers);
        let msg = pack_uint16(msg, self.op);
        let mut msg = pack_uint16(msg, self.err);
        msg.extend_from_slice(&self.id.to_be_bytes());
        pack_uint32(msg, self.lease)
    }

    pub(crate) fn unpack(msg: &[u8], off: usize) -> Result<(LlqData, usize)> {
        let (vers, off) = unpack_uint16(msg, off)?;
        let (op, off) = unpack_uint16(msg, off)?;
        let (err, off) = unpack_uint16(msg, off)?;
        if off + 8 > msg.len() {
            return Err(Error::ErrBaseLen);
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&msg[off..off + 8]);
        let (lease, off) = unpack_uint32(msg, off + 8)?;
        Ok((
            LlqData {
                vers,
                op,
                err,
                id: u64::from_be_bytes(id),
                lease,
            },
            off,
        ))
    }
}

/// One EDNS0 option inside an OPT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsOption {
    Llq(LlqData),
    UpdateLease(u32),
    Unknown { code: u16, data: Vec<u8> },
}

impl DnsOption {
    fn code(&self) -> u16 {
        match self {
            DnsOption::Llq(_) => OPT_LLQ,
            DnsOption::UpdateLease(_) => OPT_UPDATE_LEASE,
            DnsOption::Unknown { code, .. } => *code,
        }
    }
}

// An OptResource is an OPT pseudo resource record carrying EDNS0 options.
#[derive(Default, Debug)]
pub struct OptResource {
    pub options: Vec<DnsOption>,
    pub(crate) length: usize,
}

impl fmt::Display for OptResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OptResource{{Options: {:?}}}", self.options)
    }
}

impl OptResource {
    /// The LLQ option, when this OPT record carries one.
    pub fn llq(&self) -> Option<&LlqData> {
        self.options.iter().find_map(|o| match o {
            DnsOption::Llq(d) => Some(d),
            _ => None,
        })
    }

    /// The update-lease option, when this OPT record carries one.
    pub fn update_lease(&self) -> Option<u32> {
        self.options.iter().find_map(|o| match o {
            DnsOption::UpdateLease(l) => Some(*l),
            _ => None,
        })
    }
}

impl ResourceBody for OptResource {
    fn real_type(&self) -> DnsType {
        DnsType::Opt
    }

    fn pack(
        &self,
        mut msg: Vec<u8>,
        _compression: &mut Option<HashMap<String, usize>>,
        _compression_off: usize,
    ) -> Result<Vec<u8>> {
        for opt in &self.options {
            let payload = match opt {
                DnsOption::Llq(d) => d.pack(vec![]),
                DnsOption::UpdateLease(l) => pack_uint32(vec![], *l),
                DnsOption::Unknown { data, .. } => data.clone(),
            };
            if payload.len() > u16::MAX as usize {
                return Err(Error::ErrOptionTooLong);
            }
            msg = pack_uint16(msg, opt.code());
            msg = pack_uint16(msg, payload.len() as u16);
            msg = pack_bytes(msg, &payload);
        }
        Ok(msg)
    }

    fn unpack(&mut self, msg: &[u8], off: usize, length: usize) -> Result<usize> {
        let mut options = vec![];
        let end = off + length;
        if end > msg.len() {
            return Err(Error::ErrCalcLen);
        }
        let mut off = off;
        while off < end {
            let (code, new_off) = unpack_uint16(msg, off)?;
            let (olen, new_off) = unpack_uint16(msg, new_off)?;
            let olen = olen as usize;
            if new_off + olen > end {
                return Err(Error::ErrCalcLen);
            }
            match code {
                OPT_LLQ => {
                    let (d, _) = LlqData::unpack(msg, new_off)?;
                    options.push(DnsOption::Llq(d));
                }
                OPT_UPDATE_LEASE => {
                    let (lease, _) = unpack_uint32(msg, new_off)?;
                    options.push(DnsOption::UpdateLease(lease));
                }
                _ => {
                    options.push(DnsOption::Unknown {
                        code,
                        data: msg[new_off..new_off + olen].to_vec(),
                    });
                }
            }
            off = new_off + olen;
        }
        self.options = options;
        Ok(off)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llq_option_round_trip() {
        let llq = LlqData {
            vers: 1,
            op: LLQ_OP_SETUP,
            err: LLQ_ERR_NO_ERROR,
            id: 0x0102030405060708,
            lease: 7200,
        };
        let opt = OptResource {
            options: vec![DnsOption::Llq(llq), DnsOption::UpdateLease(3600)],
            length: 0,
        };
        let packed = opt.pack(vec![], &mut None, 0).unwrap();

        let mut out = OptResource {
            length: packed.len(),
            ..Default::default()
        };
        let off = out.unpack(&packed, 0, packed.len()).unwrap();
        assert_eq!(off, packed.len());
        assert_eq!(out.llq(), Some(&llq));
        assert_eq!(out.update_lease(), Some(3600));
    }
}
