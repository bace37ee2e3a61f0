//! Dynamic update message assembly (RFC 2136).
//!
//! An update message reuses the four DNS sections as Zone, Prerequisite,
//! Update and Additional. Deletions are encoded through the class field:
//! ANY deletes an RRset (or, with type ANY, every RRset at a name), NONE
//! deletes one specific record.

use super::name::Name;
use super::question::Question;
use super::resource::opt::{DnsOption, OptResource};
use super::resource::{Resource, ResourceHeader};
use super::{DNSCLASS_ANY, DNSCLASS_INET, DNSCLASS_NONE, DnsType, Header, Message, OPCODE_UPDATE};

/// Builder for one dynamic update message against a single zone.
pub struct UpdateBuilder {
    msg: Message,
}

impl UpdateBuilder {
    pub fn new(id: u16, zone: Name) -> Self {
        UpdateBuilder {
            msg: Message {
                header: Header {
                    id,
                    op_code: OPCODE_UPDATE,
                    ..Default::default()
                },
                questions: vec![Question {
                    name: zone,
                    typ: DnsType::Soa,
                    class: DNSCLASS_INET,
                }],
                ..Default::default()
            },
        }
    }

    /// Value-dependent prerequisite: the given record must exist exactly.
    pub fn prereq_record_exists(&mut self, mut rec: Resource) -> &mut Self {
        rec.header.class = DNSCLASS_INET;
        rec.header.ttl = 0;
        self.msg.answers.push(rec);
        self
    }

    /// Deletes the whole RRset of the given type at a name.
    pub fn delete_rrset(&mut self, name: Name, typ: DnsType) -> &mut Self {
        self.msg.authorities.push(Resource {
            header: ResourceHeader {
                name,
                typ,
                class: DNSCLASS_ANY,
                ttl: 0,
                length: 0,
            },
            body: None,
        });
        self
    }

    /// Deletes every RRset at a name.
    pub fn delete_all_rrsets(&mut self, name: Name) -> &mut Self {
        self.delete_rrset(name, DnsType::Any)
    }

    /// Deletes one specific record (name, type and data must match).
    pub fn delete_record(&mut self, mut rec: Resource) -> &mut Self {
        rec.header.class = DNSCLASS_NONE;
        rec.header.ttl = 0;
        self.msg.authorities.push(rec);
        self
    }

    /// Adds a record with the given TTL.
    pub fn add_record(&mut self, mut rec: Resource, ttl: u32) -> &mut Self {
        rec.header.class = DNSCLASS_INET;
        rec.header.ttl = ttl;
        self.msg.authorities.push(rec);
        self
    }

    /// Requests the given update lease via the EDNS0 lease option.
    pub fn lease(&mut self, lease: u32) -> &mut Self {
        self.msg.additionals.push(Resource {
            header: ResourceHeader {
                name: Name::root(),
                typ: DnsType::Opt,
                // For OPT pseudo-records the class carries the UDP payload
                // size the sender can accept.
                class: super::DnsClass(1440),
                ttl: 0,
                length: 0,
            },
            body: Some(Box::new(OptResource {
                options: vec![DnsOption::UpdateLease(lease)],
                length: 0,
            })),
        });
        self
    }

    pub fn finish(self) -> Message {
        self.msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::resource::a::AResource;

    fn a_record(name: &str, ip: [u8; 4]) -> Resource {
        Resource {
            header: ResourceHeader {
                name: Name::new(name).unwrap(),
                ..Default::default()
            },
            body: Some(Box::new(AResource { a: ip })),
        }
    }

    #[test]
    fn test_update_message_sections() {
        let zone = Name::new("example.com.").unwrap();
        let mut b = UpdateBuilder::new(42, zone.clone());
        b.delete_rrset(Name::new("host.example.com.").unwrap(), DnsType::Any);
        b.add_record(a_record("host.example.com.", [192, 0, 2, 1]), 120);
        b.lease(7200);
        let mut msg = b.finish();

        let raw = msg.pack().unwrap();
        let mut parsed = Message::default();
        parsed.unpack(&raw).unwrap();

        assert_eq!(parsed.header.op_code, OPCODE_UPDATE);
        // Zone section: one SOA-typed entry naming the zone.
        assert_eq!(parsed.questions.len(), 1);
        assert_eq!(parsed.questions[0].typ, DnsType::Soa);
        assert_eq!(parsed.questions[0].name, zone);
        // Update section: delete-then-add.
        assert_eq!(parsed.authorities.len(), 2);
        assert_eq!(parsed.authorities[0].header.class, DNSCLASS_ANY);
        assert_eq!(parsed.authorities[0].header.length, 0);
        assert!(parsed.authorities[0].body.is_none());
        assert_eq!(parsed.authorities[1].header.class, DNSCLASS_INET);
        assert_eq!(parsed.authorities[1].header.ttl, 120);
        // Lease option round-trips.
        assert_eq!(parsed.update_lease_option(), Some(7200));
    }

    #[test]
    fn test_delete_specific_record_uses_class_none() {
        let mut b = UpdateBuilder::new(1, Name::new("example.com.").unwrap());
        b.delete_record(a_record("host.example.com.", [192, 0, 2, 9]));
        let mut msg = b.finish();
        let raw = msg.pack().unwrap();

        let mut parsed = Message::default();
        parsed.unpack(&raw).unwrap();
        assert_eq!(parsed.authorities.len(), 1);
        assert_eq!(parsed.authorities[0].header.class, DNSCLASS_NONE);
        assert_eq!(parsed.authorities[0].header.ttl, 0);
        assert!(parsed.authorities[0].body.is_some());
    }
}
