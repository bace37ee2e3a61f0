#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // wire codec
    #[error("unexpected EOF")]
    ErrUnexpectedEof,
    #[error("segment prefix is reserved")]
    ErrReservedLabelPrefix,
    #[error("segment length too long")]
    ErrLabelTooLong,
    #[error("name too long")]
    ErrNameTooLong,
    #[error("zero length segment")]
    ErrZeroSegLen,
    #[error("too many compression pointers")]
    ErrTooManyPtr,
    #[error("invalid compression pointer")]
    ErrInvalidPtr,
    #[error("insufficient data for base length type")]
    ErrBaseLen,
    #[error("insufficient data for calculated length type")]
    ErrCalcLen,
    #[error("character string exceeds maximum length")]
    ErrStringTooLong,
    #[error("compressed name in SRV resource data")]
    ErrCompressedSrv,
    #[error("nil resource body")]
    ErrNilResourceBody,
    #[error("resource length too long")]
    ErrResourceLen,
    #[error("too many questions")]
    ErrTooManyQuestions,
    #[error("too many answers")]
    ErrTooManyAnswers,
    #[error("too many authorities")]
    ErrTooManyAuthorities,
    #[error("too many additionals")]
    ErrTooManyAdditionals,
    #[error("option data too long")]
    ErrOptionTooLong,

    // stream framing
    #[error("stream frame shorter than a DNS header")]
    ErrFrameTooShort,
    #[error("stream connection closed")]
    ErrConnClosed,
    #[error("stream connection failed")]
    ErrConnFailed,

    // engine state
    #[error("engine is closed")]
    ErrEngineClosed,
    #[error("bad parameter")]
    ErrBadParameter,
    #[error("already registered")]
    ErrAlreadyRegistered,
    #[error("no such registration")]
    ErrNoSuchRegistration,
    #[error("no such question")]
    ErrNoSuchQuestion,
    #[error("no such NAT operation")]
    ErrNoSuchNatOperation,
    #[error("no such name")]
    ErrNoSuchName,
    #[error("no such record")]
    ErrNoSuchRecord,
    #[error("no usable DNS server")]
    ErrNoServer,
    #[error("message build failed")]
    ErrMsgBuild,

    // protocol-level server results
    #[error("update refused")]
    ErrRefused,
    #[error("name conflict")]
    ErrNameConflict,
    #[error("TSIG bad signature")]
    ErrBadSig,
    #[error("TSIG bad key")]
    ErrBadKey,
    #[error("TSIG bad time")]
    ErrBadTime,
    #[error("server returned unknown error")]
    ErrUnknown,

    // NAT traversal results
    #[error("NAT port mapping unsupported by gateway")]
    ErrNatPortMappingUnsupported,
    #[error("NAT port mapping disabled on gateway")]
    ErrNatPortMappingDisabled,
    #[error("double NAT (gateway external address is private)")]
    ErrDoubleNat,
    #[error("NAT-PMP message too short")]
    ErrNatPmpTooShort,
    #[error("NAT-PMP version mismatch")]
    ErrNatPmpVersion,
    #[error("NAT-PMP unknown opcode")]
    ErrNatPmpOpcode,

    #[error("invalid remote address: {0}")]
    InvalidRemoteAddress(SocketAddr),
    #[error("io error: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
