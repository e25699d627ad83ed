//! DNS message parsing and construction.

use std::net::Ipv4Addr;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};

use crate::error::EngineError;

/// TTL of every locally synthesized answer.
pub const OVERRIDE_TTL: u32 = 3600;

/// A parsed DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    message: Message,
    question: Query,
}

impl DnsQuery {
    /// Parse a DNS query from raw bytes.
    ///
    /// Only the first question is kept; a query without one is rejected.
    pub fn parse(data: &[u8]) -> Result<Self, EngineError> {
        if data.is_empty() {
            return Err(EngineError::MalformedQuery("empty message".to_string()));
        }

        let message =
            Message::from_vec(data).map_err(|e| EngineError::MalformedQuery(e.to_string()))?;
        let question = message
            .queries()
            .first()
            .cloned()
            .ok_or(EngineError::EmptyQuestion)?;

        Ok(Self { message, question })
    }

    pub fn id(&self) -> u16 {
        self.message.id()
    }

    /// Lowercased question name in presentation form, with the trailing dot.
    pub fn domain(&self) -> String {
        self.question.name().to_ascii().to_lowercase()
    }

    pub fn qtype(&self) -> RecordType {
        self.question.query_type()
    }

    /// Build a reply carrying a single A record for the question name.
    ///
    /// The header mirrors the query: same ID and opcode, RD and CD copied,
    /// and the OPT record echoed when present.
    pub fn override_response(&self, addr: Ipv4Addr) -> Result<Vec<u8>, EngineError> {
        let request = &self.message;

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .set_checking_disabled(request.checking_disabled())
            .set_response_code(ResponseCode::NoError);
        response.add_query(self.question.clone());
        if let Some(edns) = request.extensions() {
            response.set_edns(edns.clone());
        }
        response.add_answer(Record::from_rdata(
            self.question.name().clone(),
            OVERRIDE_TTL,
            RData::A(A(addr)),
        ));

        response
            .to_vec()
            .map_err(|e| EngineError::MalformedQuery(e.to_string()))
    }
}
