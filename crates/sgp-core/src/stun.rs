use anyhow::{anyhow, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const STUN_MAGIC_COOKIE: u32 = 0x2112A442;
pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;

pub struct StunMessage {
    pub msg_type: u16,
    pub transaction_id: [u8; 12],
}

impl StunMessage {
    pub fn new_binding_request() -> Self {
        use rand::RngCore;
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        Self {
            msg_type: BINDING_REQUEST,
            transaction_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        buf.extend_from_slice(&self.msg_type.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes()); // Length
        buf.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);
        buf
    }

    /// Parse the reflexive address out of a binding response.
    ///
    /// The response must echo the request's transaction id; anything else
    /// is a stray datagram and is rejected. XOR-MAPPED-ADDRESS is
    /// preferred, plain MAPPED-ADDRESS accepted as a fallback.
    pub fn decode_address(buf: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr> {
        if buf.len() < 20 {
            return Err(anyhow!("STUN message too short"));
        }

        let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
        if msg_type != BINDING_RESPONSE {
            return Err(anyhow!("Not a binding response: 0x{:04x}", msg_type));
        }

        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != STUN_MAGIC_COOKIE {
            return Err(anyhow!("Invalid magic cookie"));
        }

        if &buf[8..20] != transaction_id {
            return Err(anyhow!("Transaction id mismatch"));
        }

        let mut pos = 20;
        let end = buf.len();
        let mut fallback = None;

        while pos + 4 <= end {
            let attr_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let attr_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            pos += 4;

            if pos + attr_len > end {
                break;
            }

            // XOR-MAPPED-ADDRESS is 0x0020
            if attr_type == 0x0020 {
                if attr_len < 8 {
                    return Err(anyhow!("Invalid XOR-MAPPED-ADDRESS length"));
                }
                let port = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]])
                    ^ (STUN_MAGIC_COOKIE >> 16) as u16;
                let family = buf[pos + 1];
                if family == 0x01 {
                    // IPv4
                    let a = buf[pos + 4] ^ (STUN_MAGIC_COOKIE >> 24) as u8;
                    let b = buf[pos + 5] ^ (STUN_MAGIC_COOKIE >> 16) as u8;
                    let c = buf[pos + 6] ^ (STUN_MAGIC_COOKIE >> 8) as u8;
                    let d = buf[pos + 7] ^ (STUN_MAGIC_COOKIE) as u8;
                    return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port));
                }
                if family == 0x02 && attr_len >= 20 {
                    // IPv6: address XORed with cookie || transaction id
                    let mut xor_mask = [0u8; 16];
                    xor_mask[..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
                    xor_mask[4..].copy_from_slice(transaction_id);
                    let mut octets = [0u8; 16];
                    for i in 0..16 {
                        octets[i] = buf[pos + 4 + i] ^ xor_mask[i];
                    }
                    return Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port));
                }
            }

            // MAPPED-ADDRESS is 0x0001
            if attr_type == 0x0001 && fallback.is_none() {
                if attr_len < 8 {
                    return Err(anyhow!("Invalid MAPPED-ADDRESS length"));
                }
                let port = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);
                let family = buf[pos + 1];
                if family == 0x01 {
                    let ip = Ipv4Addr::new(buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]);
                    fallback = Some(SocketAddr::new(IpAddr::V4(ip), port));
                }
            }

            pos += attr_len;
            if pos % 4 != 0 {
                pos += 4 - (pos % 4);
            }
        }

        fallback.ok_or_else(|| anyhow!("No mapped address found in STUN response"))
    }
}

/// Encode a binding response advertising `addr` as XOR-MAPPED-ADDRESS.
///
/// Real deployments talk to third-party STUN services; this exists so
/// tests can stand up an in-process responder.
pub fn encode_binding_response(transaction_id: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
    let (family, xored_ip): (u8, Vec<u8>) = match addr.ip() {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
            let xored = (0..4).map(|i| octets[i] ^ cookie[i]).collect();
            (0x01, xored)
        }
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id);
            let xored = (0..16).map(|i| octets[i] ^ mask[i]).collect();
            (0x02, xored)
        }
    };

    let attr_len = 4 + xored_ip.len();
    let xport = addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;

    let mut buf = Vec::with_capacity(20 + 4 + attr_len);
    buf.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
    buf.extend_from_slice(&((4 + attr_len) as u16).to_be_bytes());
    buf.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    // XOR-MAPPED-ADDRESS attribute
    buf.extend_from_slice(&0x0020u16.to_be_bytes());
    buf.extend_from_slice(&(attr_len as u16).to_be_bytes());
    buf.push(0x00);
    buf.push(family);
    buf.extend_from_slice(&xport.to_be_bytes());
    buf.extend_from_slice(&xored_ip);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_request_layout() {
        let req = StunMessage::new_binding_request();
        let bytes = req.encode();
        assert_eq!(bytes.len(), 20);
        assert_eq!(u16::from_be_bytes([bytes[0], bytes[1]]), BINDING_REQUEST);
        assert_eq!(
            u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            STUN_MAGIC_COOKIE
        );
    }

    #[test]
    fn binding_response_roundtrip_v4() {
        let req = StunMessage::new_binding_request();
        let addr: SocketAddr = "203.0.113.9:41641".parse().unwrap();
        let resp = encode_binding_response(&req.transaction_id, addr);
        let parsed = StunMessage::decode_address(&resp, &req.transaction_id).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn binding_response_roundtrip_v6() {
        let req = StunMessage::new_binding_request();
        let addr: SocketAddr = "[2001:db8::17]:3478".parse().unwrap();
        let resp = encode_binding_response(&req.transaction_id, addr);
        let parsed = StunMessage::decode_address(&resp, &req.transaction_id).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn transaction_id_mismatch_rejected() {
        let req = StunMessage::new_binding_request();
        let addr: SocketAddr = "203.0.113.9:41641".parse().unwrap();
        let resp = encode_binding_response(&req.transaction_id, addr);
        let wrong_id = [0u8; 12];
        assert!(StunMessage::decode_address(&resp, &wrong_id).is_err());
    }

    #[test]
    fn short_response_rejected() {
        let id = [0u8; 12];
        assert!(StunMessage::decode_address(&[0u8; 8], &id).is_err());
    }
}
