//! TSIG transaction signatures (RFC 2845) for outbound messages.
//!
//! Update and refresh messages sent under a credential binding carry an
//! HMAC-SHA256 signature computed over the whole message plus the TSIG
//! variables. Replies are not MAC-verified here; only their TSIG error codes
//! are classified so the registration engine can surface BadSig / BadKey /
//! BadTime distinctly.

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use ring::hmac;

use shared::error::{Error, Result};

use super::name::Name;
use super::resource::tsig::{
    TSIG_ERR_BAD_KEY, TSIG_ERR_BAD_SIG, TSIG_ERR_BAD_TIME, TsigResource,
};
use super::{DNSCLASS_ANY, DnsType, Message};

/// TSIG algorithm name emitted with every signature.
pub const TSIG_ALG_HMAC_SHA256: &str = "hmac-sha256.";

/// Seconds of clock skew tolerated by the receiver.
const TSIG_FUDGE: u16 = 300;

/// A TSIG signing key: key name plus the HMAC secret.
#[derive(Clone)]
pub struct TsigKey {
    pub name: Name,
    secret: Vec<u8>,
}

impl std::fmt::Debug for TsigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "TsigKey{{name: {}}}", self.name)
    }
}

impl TsigKey {
    /// Derives the HMAC key from base64 key material. Invalid base64 is a
    /// parameter error surfaced to the caller.
    pub fn from_base64(name: Name, b64: &str) -> Result<Self> {
        let secret = BASE64_STANDARD
            .decode(b64.trim())
            .map_err(|_| Error::ErrBadParameter)?;
        if secret.is_empty() {
            return Err(Error::ErrBadParameter);
        }
        Ok(TsigKey { name, secret })
    }
}

/// Appends a TSIG record to an already-packed message, signing everything
/// that precedes it, and bumps the additional-record count.
pub fn sign_message(raw: &mut Vec<u8>, key: &TsigKey, now_secs: u64) -> Result<()> {
    let alg = Name::new(TSIG_ALG_HMAC_SHA256)?;
    let time_signed = now_secs & 0x0000_FFFF_FFFF_FFFF;

    // Digest: the message as it stands, then the TSIG variables in canonical
    // form (RFC 2845 section 3.4).
    let mut digest = raw.clone();
    digest.extend_from_slice(&key.name.canonical_wire()?);
    digest.extend_from_slice(&DNSCLASS_ANY.0.to_be_bytes());
    digest.extend_from_slice(&0u32.to_be_bytes()); // TTL
    digest.extend_from_slice(&alg.canonical_wire()?);
    digest.extend_from_slice(&time_signed.to_be_bytes()[2..8]);
    digest.extend_from_slice(&TSIG_FUDGE.to_be_bytes());
    digest.extend_from_slice(&0u16.to_be_bytes()); // error
    digest.extend_from_slice(&0u16.to_be_bytes()); // other length

    let hkey = hmac::Key::new(hmac::HMAC_SHA256, &key.secret);
    let tag = hmac::sign(&hkey, &digest);

    let orig_id = super::raw_id(raw).ok_or(Error::ErrMsgBuild)?;
    let body = TsigResource {
        alg_name: alg,
        time_signed,
        fudge: TSIG_FUDGE,
        mac: tag.as_ref().to_vec(),
        orig_id,
        error: 0,
        other: vec![],
    };

    // Append the TSIG record by hand: name, type, class, TTL, rdlength,
    // rdata. Compression is never applied to it.
    let mut rr = key.name.pack(vec![], &mut None, 0)?;
    rr.extend_from_slice(&(DnsType::Tsig as u16).to_be_bytes());
    rr.extend_from_slice(&DNSCLASS_ANY.0.to_be_bytes());
    rr.extend_from_slice(&0u32.to_be_bytes());
    let rdata = body.pack_rdata()?;
    if rdata.len() > u16::MAX as usize {
        return Err(Error::ErrMsgBuild);
    }
    rr.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    rr.extend_from_slice(&rdata);

    raw.extend_from_slice(&rr);
    bump_additional_count(raw)?;
    Ok(())
}

impl TsigResource {
    pub(crate) fn pack_rdata(&self) -> Result<Vec<u8>> {
        use super::resource::ResourceBody;
        self.pack(vec![], &mut None, 0)
    }
}

fn bump_additional_count(raw: &mut [u8]) -> Result<()> {
    if raw.len() < super::HEADER_LEN {
        return Err(Error::ErrMsgBuild);
    }
    let count = u16::from_be_bytes([raw[10], raw[11]])
        .checked_add(1)
        .ok_or(Error::ErrTooManyAdditionals)?;
    raw[10] = (count >> 8) as u8;
    raw[11] = (count & 0xFF) as u8;
    Ok(())
}

/// Classifies the TSIG error code of a reply, when it carries a TSIG record.
///
/// TSIG errors should arrive with FORMERR per RFC 2845, but BIND 9 sends
/// them with NOTAUTH, so the update-reply path checks both.
pub fn extract_tsig_error(msg: &Message) -> Option<Error> {
    for r in &msg.additionals {
        if let Some(body) = &r.body
            && let Some(tsig) = body.as_any().downcast_ref::<TsigResource>()
        {
            return match tsig.error {
                0 => None,
                TSIG_ERR_BAD_SIG => Some(Error::ErrBadSig),
                TSIG_ERR_BAD_KEY => Some(Error::ErrBadKey),
                TSIG_ERR_BAD_TIME => Some(Error::ErrBadTime),
                _ => Some(Error::ErrUnknown),
            };
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DnsType;

    #[test]
    fn test_key_from_base64_rejects_garbage() {
        let name = Name::new("key.example.com.").unwrap();
        assert_eq!(
            TsigKey::from_base64(name.clone(), "!!!not-base64!!!").unwrap_err(),
            Error::ErrBadParameter
        );
        assert_eq!(
            TsigKey::from_base64(name, "").unwrap_err(),
            Error::ErrBadParameter
        );
    }

    #[test]
    fn test_sign_appends_tsig_and_bumps_arcount() {
        let key =
            TsigKey::from_base64(Name::new("key.example.com.").unwrap(), "c2VjcmV0").unwrap();
        let mut msg = Message::query(0x1234, Name::new("host.example.com.").unwrap(), DnsType::A);
        let mut raw = msg.pack().unwrap();
        let unsigned_len = raw.len();

        sign_message(&mut raw, &key, 1_700_000_000).unwrap();
        assert!(raw.len() > unsigned_len);

        let mut parsed = Message::default();
        parsed.unpack(&raw).unwrap();
        assert_eq!(parsed.additionals.len(), 1);
        let tsig = parsed.additionals[0]
            .body
            .as_ref()
            .unwrap()
            .as_any()
            .downcast_ref::<TsigResource>()
            .unwrap();
        assert_eq!(tsig.orig_id, 0x1234);
        assert_eq!(tsig.fudge, 300);
        assert_eq!(tsig.mac.len(), 32);
        assert_eq!(tsig.time_signed, 1_700_000_000);
    }

    #[test]
    fn test_extract_tsig_error_mapping() {
        let key =
            TsigKey::from_base64(Name::new("key.example.com.").unwrap(), "c2VjcmV0").unwrap();
        let mut msg = Message::query(7, Name::new("x.example.com.").unwrap(), DnsType::A);
        let mut raw = msg.pack().unwrap();
        sign_message(&mut raw, &key, 0).unwrap();

        let mut parsed = Message::default();
        parsed.unpack(&raw).unwrap();
        assert_eq!(extract_tsig_error(&parsed), None);
    }
}
