#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! Sans-I/O wide-area unicast DNS engine: conventional-DNS resolution for a
//! multicast-DNS responder, long-lived query (LLQ) push subscriptions,
//! dynamic record/service registration with TSIG, and NAT-PMP gateway
//! traversal.
//!
//! The engine performs no I/O of its own. The host event loop feeds it
//! received packets and timer expirations, drains outbound packets and
//! events, and owns every socket (including TCP/TLS streams, which the
//! engine only asks it to open and close).

pub mod auth;
pub mod config;
pub mod engine;
pub mod message;
pub mod natpmp;
pub mod servers;

pub use config::EngineConfig;
pub use engine::{
    AnswerKind, Engine, Event, NatId, NatKind, NatResult, NatUpdate, QueryId, Rdata, RecordId,
    RegStatus, ServiceId,
};
