//! Response classification and the freshness lifetime advertised for a DNS
//! answer over HTTP.

use std::time::Duration;

use hickory_proto::op::{Message, OpCode, ResponseCode};
use hickory_proto::rr::RecordType;

/// Lifetime used when a response carries nothing to derive one from.
pub const MINIMAL_DEFAULT_TTL: Duration = Duration::from_secs(5);
/// Upper bound for any derived lifetime.
pub const MAXIMUM_DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    NoError,
    NameError,
    NoData,
    Delegation,
    Meta,
    Update,
    ServerError,
    OtherError,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::NoError => "NOERROR",
            ResponseType::NameError => "NXDOMAIN",
            ResponseType::NoData => "NODATA",
            ResponseType::Delegation => "DELEGATION",
            ResponseType::Meta => "META",
            ResponseType::Update => "UPDATE",
            ResponseType::ServerError => "SERVERERROR",
            ResponseType::OtherError => "OTHERERROR",
        }
    }

    fn is_cacheable(&self) -> bool {
        matches!(
            self,
            ResponseType::NoError | ResponseType::NameError | ResponseType::NoData
        )
    }
}

pub fn classify(message: &Message) -> ResponseType {
    match message.op_code() {
        OpCode::Update => return ResponseType::Update,
        OpCode::Notify => return ResponseType::Meta,
        _ => {}
    }
    if let Some(question) = message.queries().first() {
        if matches!(question.query_type(), RecordType::AXFR | RecordType::IXFR) {
            return ResponseType::Meta;
        }
    }

    let rcode = message.response_code();
    if !message.answers().is_empty() && rcode == ResponseCode::NoError {
        return ResponseType::NoError;
    }

    let mut soa = false;
    let mut delegations = 0usize;
    for record in message.name_servers() {
        match record.record_type() {
            RecordType::SOA => soa = true,
            RecordType::NS => delegations += 1,
            _ => {}
        }
    }

    match rcode {
        ResponseCode::NoError if soa => ResponseType::NoData,
        ResponseCode::NXDomain if soa => ResponseType::NameError,
        ResponseCode::ServFail | ResponseCode::NotImp => ResponseType::ServerError,
        ResponseCode::NoError if delegations > 0 => ResponseType::Delegation,
        ResponseCode::NoError => ResponseType::NoError,
        _ => ResponseType::OtherError,
    }
}

/// Smallest record TTL across answer, authority and additional sections,
/// bounded by [`MAXIMUM_DEFAULT_TTL`]. Non-cacheable or empty responses get
/// [`MINIMAL_DEFAULT_TTL`].
pub fn minimal_ttl(message: &Message, kind: ResponseType) -> Duration {
    if !kind.is_cacheable() {
        return MINIMAL_DEFAULT_TTL;
    }
    // OPT lives outside the additional section, so only real extra records count.
    let extra_records = message
        .additionals()
        .iter()
        .filter(|record| record.record_type() != RecordType::OPT)
        .count();
    if message.answers().is_empty() && message.name_servers().is_empty() && extra_records == 0 {
        return MINIMAL_DEFAULT_TTL;
    }

    let ceiling = MAXIMUM_DEFAULT_TTL.as_secs();
    let min = message
        .answers()
        .iter()
        .chain(message.name_servers())
        .chain(
            message
                .additionals()
                .iter()
                .filter(|record| record.record_type() != RecordType::OPT),
        )
        .map(|record| u64::from(record.ttl()))
        .fold(ceiling, u64::min);
    Duration::from_secs(min)
}

/// `Cache-Control` value for a freshness lifetime; fractional seconds are
/// rendered as-is.
pub fn cache_control(age: Duration) -> String {
    format!("max-age={}", age.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::{A, NS, SOA};
    use hickory_proto::rr::{Name, RData, Record};

    fn name(raw: &str) -> Name {
        Name::from_ascii(raw).expect("name")
    }

    fn response(rcode: ResponseCode) -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.set_response_code(rcode);
        message.add_query(Query::query(name("example.com."), RecordType::A));
        message
    }

    fn a_record(ttl: u32) -> Record {
        Record::from_rdata(
            name("example.com."),
            ttl,
            RData::A(A::new(93, 184, 216, 34)),
        )
    }

    fn soa_record(ttl: u32) -> Record {
        let soa = SOA::new(
            name("ns1.example.com."),
            name("hostmaster.example.com."),
            1,
            3600,
            900,
            604800,
            300,
        );
        Record::from_rdata(name("example.com."), ttl, RData::SOA(soa))
    }

    #[test]
    fn classify_answer_with_noerror() {
        let mut message = response(ResponseCode::NoError);
        message.add_answer(a_record(60));
        assert_eq!(classify(&message), ResponseType::NoError);
    }

    #[test]
    fn classify_negative_answers_by_soa() {
        let mut nodata = response(ResponseCode::NoError);
        nodata.add_name_server(soa_record(300));
        assert_eq!(classify(&nodata), ResponseType::NoData);

        let mut nx = response(ResponseCode::NXDomain);
        nx.add_name_server(soa_record(300));
        assert_eq!(classify(&nx), ResponseType::NameError);
    }

    #[test]
    fn classify_errors_and_delegations() {
        assert_eq!(
            classify(&response(ResponseCode::ServFail)),
            ResponseType::ServerError
        );
        assert_eq!(
            classify(&response(ResponseCode::Refused)),
            ResponseType::OtherError
        );

        let mut delegation = response(ResponseCode::NoError);
        delegation.add_name_server(Record::from_rdata(
            name("example.com."),
            172800,
            RData::NS(NS(name("a.iana-servers.net."))),
        ));
        assert_eq!(classify(&delegation), ResponseType::Delegation);
    }

    #[test]
    fn classify_zone_transfer_as_meta() {
        let mut message = Message::new();
        message.add_query(Query::query(name("example.com."), RecordType::AXFR));
        assert_eq!(classify(&message), ResponseType::Meta);
    }

    #[test]
    fn minimal_ttl_takes_smallest_record_ttl() {
        let mut message = response(ResponseCode::NoError);
        message.add_answer(a_record(300));
        message.add_answer(a_record(42));
        message.add_name_server(soa_record(900));
        let kind = classify(&message);
        assert_eq!(minimal_ttl(&message, kind), Duration::from_secs(42));
    }

    #[test]
    fn minimal_ttl_is_capped() {
        let mut message = response(ResponseCode::NoError);
        message.add_answer(a_record(86_400));
        assert_eq!(
            minimal_ttl(&message, ResponseType::NoError),
            MAXIMUM_DEFAULT_TTL
        );
    }

    #[test]
    fn minimal_ttl_for_empty_error_response_is_default() {
        let message = response(ResponseCode::ServFail);
        let kind = classify(&message);
        assert_eq!(kind, ResponseType::ServerError);
        assert_eq!(minimal_ttl(&message, kind), MINIMAL_DEFAULT_TTL);

        let empty_noerror = response(ResponseCode::NoError);
        assert_eq!(
            minimal_ttl(&empty_noerror, ResponseType::NoError),
            MINIMAL_DEFAULT_TTL
        );
    }

    #[test]
    fn minimal_ttl_uses_additional_records_when_sections_are_empty() {
        let mut message = response(ResponseCode::NoError);
        message.add_additional(a_record(90));
        assert_eq!(
            minimal_ttl(&message, ResponseType::NoError),
            Duration::from_secs(90)
        );

        let mut opt_only = response(ResponseCode::NoError);
        opt_only.set_edns(hickory_proto::op::Edns::new());
        assert_eq!(
            minimal_ttl(&opt_only, ResponseType::NoError),
            MINIMAL_DEFAULT_TTL
        );
    }

    #[test]
    fn cache_control_renders_whole_and_fractional_seconds() {
        assert_eq!(cache_control(Duration::from_secs(300)), "max-age=300");
        assert_eq!(cache_control(Duration::from_millis(2500)), "max-age=2.5");
    }
}
