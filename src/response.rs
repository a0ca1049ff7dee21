use bytes::Bytes;
use hickory_proto::error::ProtoResult;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::CNAME;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

use crate::query::Query;

/// TTL of every record synthesized locally.
pub const DEFAULT_TTL: u32 = 300;

/// Response skeleton: header mirrors the request, question echoed, no records.
fn make_response(query: &Query, rcode: ResponseCode) -> Message {
    let req = query.message();
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);
    msg.add_queries(req.queries().iter().cloned());
    msg
}

pub fn encode(msg: &Message) -> ProtoResult<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(Bytes::from(out))
}

/// Acknowledges the query without giving it any record.
pub fn empty_answer(query: &Query) -> ProtoResult<Bytes> {
    encode(&make_response(query, ResponseCode::NoError))
}

pub fn server_failure(query: &Query) -> ProtoResult<Bytes> {
    encode(&make_response(query, ResponseCode::ServFail))
}

/// Response carrying a single CNAME from the question name to `destination`.
pub fn cname_response(query: &Query, destination: &Name) -> Message {
    let mut msg = make_response(query, ResponseCode::NoError);
    msg.add_answer(Record::from_rdata(
        query.name().clone(),
        DEFAULT_TTL,
        RData::CNAME(CNAME(destination.clone())),
    ));
    msg
}

pub fn cname(query: &Query, destination: &Name) -> ProtoResult<Bytes> {
    encode(&cname_response(query, destination))
}

/// Copies every IN A/AAAA record into `response`, owned by `destination`.
/// Returns how many were appended.
pub fn append_address_records<'a>(
    response: &mut Message,
    destination: &Name,
    records: impl IntoIterator<Item = &'a Record>,
) -> usize {
    let mut appended = 0;
    for record in records {
        if !is_address_record(record) {
            continue;
        }
        let Some(data) = record.data() else {
            continue;
        };
        response.add_answer(Record::from_rdata(
            destination.clone(),
            DEFAULT_TTL,
            data.clone(),
        ));
        appended += 1;
    }
    appended
}

#[inline]
pub fn is_address_record(record: &Record) -> bool {
    record.dns_class() == DNSClass::IN
        && matches!(record.record_type(), RecordType::A | RecordType::AAAA)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA, TXT};
    use hickory_proto::serialize::binary::BinDecodable;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    fn query(name: &str, rtype: RecordType) -> Query {
        Query::new(0x4242, Name::from_str(name).unwrap(), rtype, DNSClass::IN)
    }

    fn decode(bytes: &Bytes) -> Message {
        Message::from_bytes(bytes).expect("decode synthesized response")
    }

    #[test]
    fn empty_answer_echoes_question_and_id() {
        let q = query("bad.example.", RecordType::MX);
        let msg = decode(&empty_answer(&q).unwrap());

        assert_eq!(msg.id(), 0x4242);
        assert_eq!(msg.message_type(), MessageType::Response);
        assert_eq!(msg.response_code(), ResponseCode::NoError);
        assert!(msg.recursion_desired());
        assert!(msg.answers().is_empty());
        assert_eq!(msg.queries(), q.message().queries());
    }

    #[test]
    fn server_failure_keeps_question() {
        let q = query("x.example.", RecordType::A);
        let msg = decode(&server_failure(&q).unwrap());
        assert_eq!(msg.response_code(), ResponseCode::ServFail);
        assert_eq!(msg.queries(), q.message().queries());
    }

    #[test]
    fn cname_points_question_at_destination() {
        let q = query("www.foo.com.", RecordType::A);
        let dst = Name::from_str("foo.com.").unwrap();
        let msg = decode(&cname(&q, &dst).unwrap());

        assert_eq!(msg.answers().len(), 1);
        let record = &msg.answers()[0];
        assert_eq!(record.record_type(), RecordType::CNAME);
        assert_eq!(record.ttl(), DEFAULT_TTL);
        assert_eq!(record.name().to_ascii(), "www.foo.com.");
        match record.data() {
            Some(RData::CNAME(target)) => assert_eq!(target.0.to_ascii(), "foo.com."),
            other => panic!("expected CNAME rdata, got {other:?}"),
        }
    }

    #[test]
    fn append_keeps_only_internet_address_records() {
        let q = query("www.foo.com.", RecordType::A);
        let dst = Name::from_str("foo.com.").unwrap();
        let upstream_name = Name::from_str("other.foo.com.").unwrap();

        let mut chaos = Record::from_rdata(
            upstream_name.clone(),
            60,
            RData::A(A(Ipv4Addr::new(9, 9, 9, 9))),
        );
        chaos.set_dns_class(DNSClass::CH);
        let upstream = vec![
            Record::from_rdata(upstream_name.clone(), 60, RData::A(A(Ipv4Addr::new(1, 2, 3, 4)))),
            Record::from_rdata(
                upstream_name.clone(),
                60,
                RData::AAAA(AAAA(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1))),
            ),
            Record::from_rdata(
                upstream_name,
                60,
                RData::TXT(TXT::new(vec!["v=spf1".to_string()])),
            ),
            chaos,
        ];

        let mut msg = cname_response(&q, &dst);
        assert_eq!(append_address_records(&mut msg, &dst, &upstream), 2);

        let msg = decode(&encode(&msg).unwrap());
        let answers = msg.answers();
        assert_eq!(answers.len(), 3);
        assert_eq!(answers[0].record_type(), RecordType::CNAME);
        for record in &answers[1..] {
            assert_eq!(record.name().to_ascii(), "foo.com.");
            assert_eq!(record.ttl(), DEFAULT_TTL);
            assert_eq!(record.dns_class(), DNSClass::IN);
        }
        assert_eq!(answers[1].data(), Some(&RData::A(A(Ipv4Addr::new(1, 2, 3, 4)))));
        assert_eq!(answers[2].record_type(), RecordType::AAAA);
    }
}
