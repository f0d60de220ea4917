//! Minimal DNS message codec for A and AAAA lookups.
//!
//! Only what the UDP, TCP/TLS and HTTPS transports need: build a
//! single-question recursive query and pull address records out of the
//! answer section of a reply.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::netx::errorx::NetError;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;
const RCODE_NAME_ERROR: u8 = 3;

/// Encode a recursive query for `hostname` with the given record type.
pub fn encode_query(hostname: &str, qtype: u16, id: u16) -> Result<Vec<u8>, NetError> {
    let name = hostname.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return Err(NetError::other(format!("dns: invalid hostname: {hostname}")));
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    buf.extend_from_slice(&id.to_be_bytes());
    // RD set, everything else zero.
    buf.extend_from_slice(&[0x01, 0x00]);
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&[0; 6]);
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(NetError::other(format!("dns: invalid hostname: {hostname}")));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&qtype.to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(buf)
}

/// Read the message id of an encoded message.
#[must_use]
pub fn message_id(msg: &[u8]) -> Option<u16> {
    msg.get(..2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Decode a reply, returning the textual addresses of its A/AAAA answers.
///
/// A reply whose id differs from `id` is rejected. `NXDOMAIN` maps onto
/// [`NetError::NoSuchHost`] so that it classifies as `dns_nxdomain_error`.
pub fn decode_response(reply: &[u8], id: u16, hostname: &str) -> Result<Vec<String>, NetError> {
    if reply.len() < HEADER_LEN {
        return Err(NetError::other("dns: short reply"));
    }
    if message_id(reply) != Some(id) {
        return Err(NetError::other("dns: reply id mismatch"));
    }
    if reply[2] & 0x80 == 0 {
        return Err(NetError::other("dns: message is not a reply"));
    }
    match reply[3] & 0x0f {
        0 => {}
        RCODE_NAME_ERROR => return Err(NetError::NoSuchHost(hostname.to_string())),
        _ => return Err(NetError::other("dns: query failed")),
    }
    let qdcount = read_u16(reply, 4)?;
    let ancount = read_u16(reply, 6)?;

    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        offset = skip_name(reply, offset)? + 4;
    }

    let mut addrs = Vec::new();
    for _ in 0..ancount {
        offset = skip_name(reply, offset)?;
        let rtype = read_u16(reply, offset)?;
        let rdlen = usize::from(read_u16(reply, offset + 8)?);
        let start = offset + 10;
        let rdata = reply
            .get(start..start + rdlen)
            .ok_or_else(|| NetError::other("dns: truncated answer"))?;
        match (rtype, rdlen) {
            (TYPE_A, 4) => {
                addrs.push(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string());
            }
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                addrs.push(Ipv6Addr::from(octets).to_string());
            }
            _ => {}
        }
        offset = start + rdlen;
    }
    Ok(addrs)
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, NetError> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| NetError::other("dns: truncated reply"))
}

/// Return the offset right after the name starting at `offset`.
fn skip_name(buf: &[u8], mut offset: usize) -> Result<usize, NetError> {
    loop {
        let len = *buf
            .get(offset)
            .ok_or_else(|| NetError::other("dns: truncated name"))?;
        match len {
            0 => return Ok(offset + 1),
            // compression pointer terminates the name
            l if l & 0xc0 == 0xc0 => return Ok(offset + 2),
            l => offset += 1 + usize::from(l),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_for(query: &[u8], rcode: u8, answers: &[(u16, &[u8])]) -> Vec<u8> {
        let mut reply = query.to_vec();
        reply[2] |= 0x80;
        reply[3] = 0x80 | rcode;
        reply[6..8].copy_from_slice(&(answers.len() as u16).to_be_bytes());
        for (rtype, rdata) in answers {
            reply.extend_from_slice(&[0xc0, 0x0c]);
            reply.extend_from_slice(&rtype.to_be_bytes());
            reply.extend_from_slice(&CLASS_IN.to_be_bytes());
            reply.extend_from_slice(&300u32.to_be_bytes());
            reply.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            reply.extend_from_slice(rdata);
        }
        reply
    }

    #[test]
    fn test_encode_query_layout() {
        let query = encode_query("example.com", TYPE_A, 0xbeef).unwrap();
        assert_eq!(&query[..2], &[0xbe, 0xef]);
        assert_eq!(&query[12..25], b"\x07example\x03com\x00");
        assert_eq!(&query[25..], &[0, 1, 0, 1]);
    }

    #[test]
    fn test_encode_rejects_bad_labels() {
        assert!(encode_query("", TYPE_A, 1).is_err());
        assert!(encode_query("a..b", TYPE_A, 1).is_err());
        assert!(encode_query(&"x".repeat(64), TYPE_A, 1).is_err());
    }

    #[test]
    fn test_decode_addresses() {
        let query = encode_query("example.com", TYPE_A, 7).unwrap();
        let v6 = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).octets();
        let reply = reply_for(&query, 0, &[(TYPE_A, &[93, 184, 216, 34]), (TYPE_AAAA, &v6)]);
        let addrs = decode_response(&reply, 7, "example.com").unwrap();
        assert_eq!(addrs, vec!["93.184.216.34", "2001:db8::1"]);
    }

    #[test]
    fn test_decode_nxdomain() {
        let query = encode_query("nonexistent.example", TYPE_A, 9).unwrap();
        let reply = reply_for(&query, RCODE_NAME_ERROR, &[]);
        let err = decode_response(&reply, 9, "nonexistent.example").unwrap_err();
        assert_eq!(err, NetError::NoSuchHost("nonexistent.example".into()));
    }

    #[test]
    fn test_decode_rejects_wrong_id() {
        let query = encode_query("example.com", TYPE_A, 1).unwrap();
        let reply = reply_for(&query, 0, &[]);
        assert!(decode_response(&reply, 2, "example.com").is_err());
        assert!(decode_response(&query, 1, "example.com").is_err());
    }
}
