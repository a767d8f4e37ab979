//! DNS message parsing and construction.
//!
//! Only the single shape this proxy ever answers is supported: one question,
//! one A record pointing back at that question's name.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 12;

/// Longest encoded name we are willing to walk (RFC 1035 limit).
const MAX_NAME_LEN: usize = 255;

/// Longest single label. Anything above is a compression pointer or garbage.
const MAX_LABEL_LEN: usize = 63;

/// Response flags (standard response, recursion available, no error). The
/// ID and the two count fields are filled in from the query.
const RESPONSE_HEADER: [u8; HEADER_LEN] = [0, 0, 0x81, 0x80, 0, 0, 0, 0, 0, 0, 0, 0];

/// Answer record: pointer to offset 12, type A, class IN, TTL 60, RDLENGTH 4.
const ANSWER_RECORD: [u8; 12] = [
    0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x3c, 0x00, 0x04,
];

/// Read the question name of a raw query.
///
/// Labels are joined with `.`, case is preserved. Fails when the packet is
/// too short, a label runs past the end of the packet, a label length is
/// above 63 (which includes compression pointers), or the name is longer
/// than 255 bytes.
pub fn question_domain(query: &[u8]) -> Result<String> {
    if query.len() < HEADER_LEN + 1 {
        return Err(Error::MalformedPacket(format!(
            "{} bytes is shorter than a header and terminator",
            query.len()
        )));
    }

    let mut pos = HEADER_LEN;
    let mut labels = Vec::new();

    loop {
        let Some(&label_len) = query.get(pos) else {
            return Err(Error::MalformedPacket("unterminated question name".into()));
        };
        let label_len = label_len as usize;
        if label_len == 0 {
            break;
        }
        if label_len > MAX_LABEL_LEN {
            return Err(Error::MalformedPacket(format!(
                "label length {:#04x} at offset {}",
                label_len, pos
            )));
        }

        pos += 1;
        if pos + label_len > query.len() {
            return Err(Error::MalformedPacket(format!(
                "label of {} bytes at offset {} overruns packet",
                label_len,
                pos - 1
            )));
        }
        if pos + label_len - HEADER_LEN > MAX_NAME_LEN {
            return Err(Error::MalformedPacket("question name too long".into()));
        }

        let label = std::str::from_utf8(&query[pos..pos + label_len])
            .map_err(|_| Error::MalformedPacket("label is not valid UTF-8".into()))?;
        labels.push(label);
        pos += label_len;
    }

    Ok(labels.join("."))
}

/// Read the question name, absorbing parse failures as an empty name.
///
/// An empty name never matches an override or cache entry and is never
/// tunneled, so a malformed query is effectively dropped downstream.
pub fn extract_question_domain(query: &[u8]) -> String {
    match question_domain(query) {
        Ok(domain) => domain,
        Err(e) => {
            debug!("ignoring query: {}", e);
            String::new()
        }
    }
}

/// Build the response to `query` answering with `address`.
///
/// The question section (and anything after it) is copied verbatim. Returns
/// an empty buffer when `query` does not even hold a header.
pub fn build_response(query: &[u8], address: Ipv4Addr) -> Vec<u8> {
    if query.len() < HEADER_LEN {
        return Vec::new();
    }

    let question = &query[HEADER_LEN..];
    let mut response =
        Vec::with_capacity(HEADER_LEN + question.len() + ANSWER_RECORD.len() + 4);

    response.extend_from_slice(&RESPONSE_HEADER);
    response[0..2].copy_from_slice(&query[0..2]);
    // QDCOUNT is copied into both QDCOUNT and ANCOUNT: one question, one answer.
    response[4..6].copy_from_slice(&query[4..6]);
    response[6..8].copy_from_slice(&query[4..6]);

    response.extend_from_slice(question);
    response.extend_from_slice(&ANSWER_RECORD);
    response.extend_from_slice(&address.octets());

    response
}

/// Overwrite the transaction ID of an outgoing response.
pub fn set_id(response: &mut [u8], id: u16) {
    if response.len() >= 2 {
        response[0..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Transaction ID of a query or response.
pub fn packet_id(packet: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*packet.first()?, *packet.get(1)?]))
}

/// Address carried in a response built by [`build_response`].
pub fn answer_address(response: &[u8]) -> Option<Ipv4Addr> {
    let start = response.len().checked_sub(4)?;
    if start < HEADER_LEN + ANSWER_RECORD.len() {
        return None;
    }
    let octets: [u8; 4] = response[start..].try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// Parse the dotted-quad text returned by the lookup service.
///
/// Exactly four decimal segments are required, each in `0..=255`. An address
/// whose first or last octet is zero is rejected: those are network or
/// unspecified addresses and never a usable answer.
pub fn parse_address_text(text: &str) -> Result<Ipv4Addr> {
    let invalid = || Error::InvalidAddress(text.to_string());

    let segments: Vec<&str> = text.split('.').collect();
    if segments.len() != 4 {
        return Err(invalid());
    }

    let mut octets = [0u8; 4];
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        octets[i] = segment.parse::<u8>().map_err(|_| invalid())?;
    }

    if octets[0] == 0 || octets[3] == 0 {
        return Err(invalid());
    }

    Ok(Ipv4Addr::from(octets))
}

/// Encode a single-question A query, as a stub resolver would send it.
#[cfg(test)]
pub(crate) fn query_packet(id: u16, domain: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);

    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query, RD
    packet.extend_from_slice(&[0x00, 0x01]); // Questions: 1
    packet.extend_from_slice(&[0x00, 0x00]); // Answer RRs: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Authority RRs: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Additional RRs: 0

    for label in domain.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00);

    packet.extend_from_slice(&[0x00, 0x01]); // Type: A
    packet.extend_from_slice(&[0x00, 0x01]); // Class: IN

    packet
}
