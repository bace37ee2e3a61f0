use shared::error::{Error, Result};

use super::{UINT16LEN, UINT32LEN};

// pack_uint16 appends the wire format of field to msg.
pub(crate) fn pack_uint16(mut msg: Vec<u8>, field: u16) -> Vec<u8> {
    msg.extend_from_slice(&field.to_be_bytes());
    msg
}

pub(crate) fn unpack_uint16(msg: &[u8], off: usize) -> Result<(u16, usize)> {
    if off + UINT16LEN > msg.len() {
        Err(Error::ErrBaseLen)
    } else {
        Ok((
            u16::from_be_bytes([msg[off], msg[off + 1]]),
            off + UINT16LEN,
        ))
    }
}

pub(crate) fn skip_uint16(msg: &[u8], off: usize) -> Result<usize> {
    if off + UINT16LEN > msg.len() {
        Err(Error::ErrBaseLen)
    } else {
        Ok(off + UINT16LEN)
    }
}

// pack_uint32 appends the wire format of field to msg.
pub(crate) fn pack_uint32(mut msg: Vec<u8>, field: u32) -> Vec<u8> {
    msg.extend_from_slice(&field.to_be_bytes());
    msg
}

pub(crate) fn unpack_uint32(msg: &[u8], off: usize) -> Result<(u32, usize)> {
    if off + UINT32LEN > msg.len() {
        Err(Error::ErrBaseLen)
    } else {
        Ok((
            u32::from_be_bytes([msg[off], msg[off + 1], msg[off + 2], msg[off + 3]]),
            off + UINT32LEN,
        ))
    }
}

pub(crate) fn skip_uint32(msg: &[u8], off: usize) -> Result<usize> {
    if off + UINT32LEN > msg.len() {
        Err(Error::ErrBaseLen)
    } else {
        Ok(off + UINT32LEN)
    }
}

// pack_bytes appends the wire format of field to msg.
pub(crate) fn pack_bytes(mut msg: Vec<u8>, field: &[u8]) -> Vec<u8> {
    msg.extend_from_slice(field);
    msg
}

pub(crate) fn unpack_bytes(msg: &[u8], off: usize, field: &mut [u8]) -> Result<usize> {
    let new_off = off + field.len();
    if new_off > msg.len() {
        Err(Error::ErrBaseLen)
    } else {
        field.copy_from_slice(&msg[off..new_off]);
        Ok(new_off)
    }
}

// pack_str appends the wire format of a DNS character string to msg.
pub(crate) fn pack_str(mut msg: Vec<u8>, field: &str) -> Result<Vec<u8>> {
    let l = field.len();
    if l > 255 {
        return Err(Error::ErrStringTooLong);
    }
    msg.push(l as u8);
    msg.extend_from_slice(field.as_bytes());
    Ok(msg)
}

pub(crate) fn unpack_str(msg: &[u8], off: usize) -> Result<(String, usize)> {
    if off >= msg.len() {
        return Err(Error::ErrBaseLen);
    }
    let begin_off = off + 1;
    let end_off = begin_off + msg[off] as usize;
    if end_off > msg.len() {
        return Err(Error::ErrCalcLen);
    }
    Ok((
        String::from_utf8_lossy(&msg[begin_off..end_off]).to_string(),
        end_off,
    ))
}
