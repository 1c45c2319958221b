//! JSON rendering of DNS responses for clients that ask for `application/dns-json`.

use hickory_proto::op::{Edns, Message, ResponseCode};
use hickory_proto::rr::Record;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct JsonResponse {
    pub status: String,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub ad: bool,
    pub cd: bool,
    pub question: Vec<JsonQuestion>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub answer: Vec<JsonRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authority: Vec<JsonRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional: Vec<JsonRecord>,
}

#[derive(Debug, Serialize)]
pub struct JsonQuestion {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct JsonRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ttl: u32,
    pub data: String,
}

impl JsonRecord {
    fn from_record(record: &Record) -> Self {
        Self {
            name: record.name().to_string(),
            kind: record.record_type().to_string(),
            ttl: record.ttl(),
            data: record_data(record),
        }
    }
}

#[derive(Serialize)]
struct OptSummary {
    udp: u16,
    version: u8,
    #[serde(rename = "do")]
    dnssec_ok: bool,
    rcode_high: u8,
}

pub fn render(message: &Message) -> Result<JsonResponse, serde_json::Error> {
    let mut additional: Vec<JsonRecord> = message
        .additionals()
        .iter()
        .map(JsonRecord::from_record)
        .collect();
    if let Some(edns) = message.extensions() {
        additional.push(JsonRecord {
            name: ".".into(),
            kind: "OPT".into(),
            ttl: opt_ttl(edns),
            data: opt_to_string(edns)?.replace('"', ""),
        });
    }

    Ok(JsonResponse {
        status: rcode_mnemonic(message.response_code()),
        tc: message.truncated(),
        rd: message.recursion_desired(),
        ra: message.recursion_available(),
        ad: message.authentic_data(),
        cd: message.checking_disabled(),
        question: message
            .queries()
            .iter()
            .map(|query| JsonQuestion {
                name: query.name().to_string(),
                kind: query.query_type().to_string(),
            })
            .collect(),
        answer: message
            .answers()
            .iter()
            .map(JsonRecord::from_record)
            .collect(),
        authority: message
            .name_servers()
            .iter()
            .map(JsonRecord::from_record)
            .collect(),
        additional,
    })
}

/// Presentation-format header of a record: owner, TTL, class and type.
pub fn header_text(record: &Record) -> String {
    format!(
        "{}\t{}\t{}\t{}\t",
        record.name(),
        record.ttl(),
        record.dns_class(),
        record.record_type()
    )
}

/// Full presentation-format line of a record.
pub fn record_text(record: &Record) -> String {
    format!("{}{}", header_text(record), record.data())
}

/// The record's textual form with its header prefix removed.
pub fn record_data(record: &Record) -> String {
    let full = record_text(record);
    let header = header_text(record);
    match full.strip_prefix(header.as_str()) {
        Some(data) => data.to_string(),
        None => full,
    }
}

pub fn opt_to_string(edns: &Edns) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OptSummary {
        udp: edns.max_payload(),
        version: edns.version(),
        dnssec_ok: edns.flags().dnssec_ok,
        rcode_high: edns.rcode_high(),
    })
}

// Extended rcode, version and flags packed the way the OPT TTL field carries them.
fn opt_ttl(edns: &Edns) -> u32 {
    let mut ttl = (u32::from(edns.rcode_high()) << 24) | (u32::from(edns.version()) << 16);
    if edns.flags().dnssec_ok {
        ttl |= 0x8000;
    }
    ttl
}

pub fn rcode_mnemonic(code: ResponseCode) -> String {
    let value = u16::from(code);
    let mnemonic = match value {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        6 => "YXDOMAIN",
        7 => "YXRRSET",
        8 => "NXRRSET",
        9 => "NOTAUTH",
        10 => "NOTZONE",
        16 => "BADSIG",
        17 => "BADKEY",
        18 => "BADTIME",
        19 => "BADMODE",
        20 => "BADNAME",
        21 => "BADALG",
        22 => "BADTRUNC",
        23 => "BADCOOKIE",
        _ => return value.to_string(),
    };
    mnemonic.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::{A, TXT};
    use hickory_proto::rr::{Name, RData, RecordType};

    fn name(raw: &str) -> Name {
        Name::from_ascii(raw).expect("name")
    }

    fn a_record() -> Record {
        Record::from_rdata(name("example.com."), 60, RData::A(A::new(93, 184, 216, 34)))
    }

    #[test]
    fn record_data_strips_header_prefix() {
        let record = a_record();
        let full = record_text(&record);
        assert!(full.starts_with("example.com.\t60\tIN\tA\t"));
        assert_eq!(record_data(&record), "93.184.216.34");

        let txt = Record::from_rdata(
            name("example.com."),
            120,
            RData::TXT(TXT::new(vec!["v=spf1 -all".into()])),
        );
        let data = record_data(&txt);
        assert_eq!(format!("{}{}", header_text(&txt), data), record_text(&txt));
        assert!(data.contains("v=spf1"));
    }

    #[test]
    fn opt_rendering_has_no_quotes() {
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        edns.flags_mut().dnssec_ok = true;

        let raw = opt_to_string(&edns).expect("serialise opt");
        assert!(raw.contains('"'));

        let mut message = Message::new();
        message.set_edns(edns);
        let rendered = render(&message).expect("render");
        let opt = rendered
            .additional
            .iter()
            .find(|record| record.kind == "OPT")
            .expect("opt record rendered");
        assert!(!opt.data.contains('"'));
        assert_eq!(opt.data, raw.replace('"', ""));
        assert!(opt.data.contains("udp:1232"));
        assert!(opt.data.contains("do:true"));
        assert_eq!(opt.ttl & 0x8000, 0x8000);
    }

    #[test]
    fn render_maps_flags_and_sections() {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.set_response_code(ResponseCode::NoError);
        message.set_recursion_desired(true);
        message.set_recursion_available(true);
        message.add_query(Query::query(name("example.com."), RecordType::A));
        message.add_answer(a_record());

        let rendered = render(&message).expect("render");
        assert_eq!(rendered.status, "NOERROR");
        assert!(rendered.rd && rendered.ra);
        assert!(!rendered.tc && !rendered.ad && !rendered.cd);
        assert_eq!(rendered.question.len(), 1);
        assert_eq!(rendered.question[0].name, "example.com.");
        assert_eq!(rendered.question[0].kind, "A");
        assert_eq!(rendered.answer[0].data, "93.184.216.34");
        assert_eq!(rendered.answer[0].ttl, 60);

        let value = serde_json::to_value(&rendered).expect("json");
        assert_eq!(value["question"][0]["type"], "A");
        assert!(value.get("authority").is_none());
    }

    #[test]
    fn rcode_mnemonics_follow_convention() {
        assert_eq!(rcode_mnemonic(ResponseCode::NXDomain), "NXDOMAIN");
        assert_eq!(rcode_mnemonic(ResponseCode::ServFail), "SERVFAIL");
        assert_eq!(rcode_mnemonic(ResponseCode::Unknown(3841)), "3841");
    }
}
