use super::name::Name;
use super::resource::a::AResource;
use super::resource::opt::{DnsOption, LLQ_OP_SETUP, LlqData, OptResource};
use super::resource::soa::SoaResource;
use super::resource::srv::SrvResource;
use super::*;

fn resource(name: &str, body: Box<dyn ResourceBody>) -> Resource {
    Resource {
        header: ResourceHeader {
            name: Name::new(name).unwrap(),
            class: DNSCLASS_INET,
            ttl: 3600,
            ..Default::default()
        },
        body: Some(body),
    }
}

#[test]
fn test_query_round_trip() {
    let mut msg = Message::query(0xBEEF, Name::new("example.com.").unwrap(), DnsType::Soa);
    let raw = msg.pack().unwrap();

    let mut parsed = Message::default();
    parsed.unpack(&raw).unwrap();
    assert_eq!(parsed.header.id, 0xBEEF);
    assert!(!parsed.header.response);
    assert!(parsed.header.recursion_desired);
    assert_eq!(parsed.questions.len(), 1);
    assert_eq!(parsed.questions[0].name.data, "example.com.");
    assert_eq!(parsed.questions[0].typ, DnsType::Soa);
}

#[test]
fn test_response_with_soa_srv_a() {
    let mut msg = Message {
        header: Header {
            id: 7,
            response: true,
            authoritative: true,
            ..Default::default()
        },
        questions: vec![Question {
            name: Name::new("host.example.com.").unwrap(),
            typ: DnsType::Soa,
            class: DNSCLASS_INET,
        }],
        answers: vec![
            resource(
                "example.com.",
                Box::new(SoaResource {
                    ns: Name::new("ns1.example.com.").unwrap(),
                    mbox: Name::new("admin.example.com.").unwrap(),
                    serial: 2024,
                    refresh: 900,
                    retry: 300,
                    expire: 604800,
                    min_ttl: 60,
                }),
            ),
            resource(
                "_dns-update._udp.example.com.",
                Box::new(SrvResource {
                    priority: 0,
                    weight: 0,
                    port: 53,
                    target: Name::new("ns1.example.com.").unwrap(),
                }),
            ),
            resource("ns1.example.com.", Box::new(AResource { a: [192, 0, 2, 53] })),
        ],
        ..Default::default()
    };
    let raw = msg.pack().unwrap();

    let mut parsed = Message::default();
    parsed.unpack(&raw).unwrap();
    assert_eq!(parsed.answers.len(), 3);

    let soa = parsed.answer_of_type(DnsType::Soa).unwrap();
    assert_eq!(soa.header.name.data, "example.com.");
    let body = soa.body.as_ref().unwrap();
    let soa_body = body.as_any().downcast_ref::<SoaResource>().unwrap();
    assert_eq!(soa_body.ns.data, "ns1.example.com.");

    let srv = parsed.answer_of_type(DnsType::Srv).unwrap();
    let srv_body = srv
        .body
        .as_ref()
        .unwrap()
        .as_any()
        .downcast_ref::<SrvResource>()
        .unwrap();
    assert_eq!(srv_body.port, 53);
    assert_eq!(srv_body.target.data, "ns1.example.com.");

    let a = parsed.answer_of_type(DnsType::A).unwrap();
    let a_body = a
        .body
        .as_ref()
        .unwrap()
        .as_any()
        .downcast_ref::<AResource>()
        .unwrap();
    assert_eq!(a_body.a, [192, 0, 2, 53]);
}

#[test]
fn test_llq_option_in_message() {
    let llq = LlqData {
        vers: 1,
        op: LLQ_OP_SETUP,
        err: 0,
        id: 99,
        lease: 7200,
    };
    let mut msg = Message::query(3, Name::new("_ftp._tcp.example.com.").unwrap(), DnsType::Ptr);
    msg.additionals.push(Resource {
        header: ResourceHeader {
            name: Name::root(),
            typ: DnsType::Opt,
            class: DnsClass(1440),
            ..Default::default()
        },
        body: Some(Box::new(OptResource {
            options: vec![DnsOption::Llq(llq)],
            length: 0,
        })),
    });
    let raw = msg.pack().unwrap();

    let mut parsed = Message::default();
    parsed.unpack(&raw).unwrap();
    assert_eq!(parsed.llq_option(), Some(llq));
}

#[test]
fn test_unknown_record_type_is_preserved() {
    // A type the engine has no parser for must survive as opaque bytes, not
    // fail the whole message.
    let mut raw = Message::query(5, Name::new("example.com.").unwrap(), DnsType::A)
        .pack()
        .unwrap();
    // Append one answer: name=root, type=99, class IN, ttl 0, rdlength 3.
    raw.extend_from_slice(&[0x00, 0x00, 99, 0x00, 0x01, 0, 0, 0, 0, 0x00, 0x03, 1, 2, 3]);
    raw[7] = 1; // ANCOUNT = 1

    let mut parsed = Message::default();
    parsed.unpack(&raw).unwrap();
    assert_eq!(parsed.answers.len(), 1);
    assert_eq!(parsed.answers[0].header.length, 3);
}

#[test]
fn test_truncated_message_is_an_error() {
    let mut msg = Message::query(1, Name::new("example.com.").unwrap(), DnsType::A);
    let raw = msg.pack().unwrap();
    let mut parsed = Message::default();
    assert!(parsed.unpack(&raw[..raw.len() - 3]).is_err());
}
