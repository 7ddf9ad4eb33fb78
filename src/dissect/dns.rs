//! DNS message dissection
//!
//! Parses queries and responses out of UDP port-53 payloads, including
//! compressed names. Responses feed the IP-to-domain cache; query names feed
//! the tunneling heuristics.

/// A parsed DNS message (header + questions + answers)
#[derive(Debug, Clone)]
pub struct DnsMessage {
    pub id: u16,
    pub is_query: bool,
    pub opcode: u8,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsAnswer>,
}

#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Clone)]
pub struct DnsAnswer {
    pub name: String,
    pub rtype: u16,
    pub ttl: u32,
    /// Decoded RDATA: dotted quad for A, colon-hex groups for AAAA, a name for
    /// CNAME, lowercase hex for everything else
    pub data: String,
}

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_AAAA: u16 = 28;

impl DnsMessage {
    /// Non-blank question names
    pub fn query_names(&self) -> Vec<&str> {
        self.questions
            .iter()
            .map(|q| q.name.as_str())
            .filter(|n| !n.is_empty())
            .collect()
    }
}

/// Parse a DNS message from a UDP payload.
///
/// Returns `None` for anything structurally inconsistent, including
/// compression pointers outside the packet.
pub fn parse(payload: &[u8]) -> Option<DnsMessage> {
    if payload.len() < 12 {
        return None;
    }

    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let is_query = flags & 0x8000 == 0;
    let opcode = ((flags >> 11) & 0x0f) as u8;

    let question_count = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let answer_count = u16::from_be_bytes([payload[6], payload[7]]) as usize;

    let mut cursor = 12usize;

    let mut questions = Vec::with_capacity(question_count.min(16));
    for _ in 0..question_count {
        let name = read_name(payload, &mut cursor)?;
        let qtype = read_u16(payload, &mut cursor)?;
        let qclass = read_u16(payload, &mut cursor)?;
        questions.push(DnsQuestion { name, qtype, qclass });
    }

    let mut answers = Vec::with_capacity(answer_count.min(16));
    for _ in 0..answer_count {
        let name = read_name(payload, &mut cursor)?;
        let rtype = read_u16(payload, &mut cursor)?;
        let _class = read_u16(payload, &mut cursor)?;
        let ttl = read_u32(payload, &mut cursor)?;
        let rdlength = read_u16(payload, &mut cursor)? as usize;

        if cursor + rdlength > payload.len() {
            return None;
        }
        let rdata = &payload[cursor..cursor + rdlength];

        let data = match (rtype, rdlength) {
            (TYPE_A, 4) => format!("{}.{}.{}.{}", rdata[0], rdata[1], rdata[2], rdata[3]),
            (TYPE_AAAA, 16) => rdata
                .chunks(2)
                .map(|c| format!("{:x}", u16::from_be_bytes([c[0], c[1]])))
                .collect::<Vec<_>>()
                .join(":"),
            (TYPE_CNAME, _) => {
                let mut name_cursor = cursor;
                read_name(payload, &mut name_cursor)?
            }
            _ => rdata.iter().map(|b| format!("{:02x}", b)).collect(),
        };
        cursor += rdlength;

        answers.push(DnsAnswer {
            name,
            rtype,
            ttl,
            data,
        });
    }

    Some(DnsMessage {
        id,
        is_query,
        opcode,
        questions,
        answers,
    })
}

/// Read a possibly-compressed domain name starting at `*cursor`.
///
/// Only the first pointer fixes where the caller resumes (two bytes past it);
/// chained pointers move only the read position. Jump count is bounded by the
/// packet size so pointer loops terminate.
fn read_name(packet: &[u8], cursor: &mut usize) -> Option<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = *cursor;
    let mut jumped = false;
    let mut resume = 0usize;
    let mut jumps = 0usize;

    loop {
        if pos >= packet.len() {
            return None;
        }
        let len = packet[pos] as usize;

        if len == 0 {
            pos += 1;
            break;
        }

        if len & 0xc0 == 0xc0 {
            if pos + 1 >= packet.len() {
                return None;
            }
            if !jumped {
                resume = pos + 2;
                jumped = true;
            }
            let pointer = ((len & 0x3f) << 8) | packet[pos + 1] as usize;
            if pointer >= packet.len() {
                return None;
            }
            jumps += 1;
            if jumps > packet.len() {
                return None;
            }
            pos = pointer;
            continue;
        }

        pos += 1;
        if pos + len > packet.len() {
            return None;
        }
        labels.push(String::from_utf8_lossy(&packet[pos..pos + len]).into_owned());
        pos += len;
    }

    *cursor = if jumped { resume } else { pos };
    Some(labels.join("."))
}

fn read_u16(packet: &[u8], cursor: &mut usize) -> Option<u16> {
    if *cursor + 2 > packet.len() {
        return None;
    }
    let v = u16::from_be_bytes([packet[*cursor], packet[*cursor + 1]]);
    *cursor += 2;
    Some(v)
}

fn read_u32(packet: &[u8], cursor: &mut usize) -> Option<u32> {
    if *cursor + 4 > packet.len() {
        return None;
    }
    let v = u32::from_be_bytes([
        packet[*cursor],
        packet[*cursor + 1],
        packet[*cursor + 2],
        packet[*cursor + 3],
    ]);
    *cursor += 4;
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(id: u16, flags: u16, qd: u16, an: u16) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(&id.to_be_bytes());
        h.extend_from_slice(&flags.to_be_bytes());
        h.extend_from_slice(&qd.to_be_bytes());
        h.extend_from_slice(&an.to_be_bytes());
        h.extend_from_slice(&[0, 0, 0, 0]); // ns + ar counts
        h
    }

    fn encode_name(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out
    }

    #[test]
    fn test_parse_query() {
        let mut msg = header(0x1234, 0x0100, 1, 0);
        msg.extend(encode_name("example.com"));
        msg.extend_from_slice(&[0, 1, 0, 1]); // type A, class IN

        let dns = parse(&msg).unwrap();
        assert_eq!(dns.id, 0x1234);
        assert!(dns.is_query);
        assert_eq!(dns.opcode, 0);
        assert_eq!(dns.questions.len(), 1);
        assert_eq!(dns.questions[0].name, "example.com");
        assert_eq!(dns.query_names(), vec!["example.com"]);
    }

    #[test]
    fn test_parse_response_a_record() {
        let mut msg = header(1, 0x8180, 1, 1);
        msg.extend(encode_name("example.com"));
        msg.extend_from_slice(&[0, 1, 0, 1]);
        // answer: pointer to the question name at offset 12
        msg.extend_from_slice(&[0xc0, 12]);
        msg.extend_from_slice(&[0, 1, 0, 1]); // type A, class IN
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&[0, 4]);
        msg.extend_from_slice(&[93, 184, 216, 34]);

        let dns = parse(&msg).unwrap();
        assert!(!dns.is_query);
        assert_eq!(dns.answers.len(), 1);
        assert_eq!(dns.answers[0].name, "example.com");
        assert_eq!(dns.answers[0].rtype, TYPE_A);
        assert_eq!(dns.answers[0].ttl, 300);
        assert_eq!(dns.answers[0].data, "93.184.216.34");
    }

    #[test]
    fn test_compression_resumes_after_pointer() {
        // question name is "www" + pointer to "example.com"
        let mut msg = header(1, 0x0100, 2, 0);
        let base = encode_name("example.com");
        let base_offset = msg.len();
        msg.extend(&base);
        msg.extend_from_slice(&[0, 1, 0, 1]);

        msg.push(3);
        msg.extend_from_slice(b"www");
        msg.extend_from_slice(&[0xc0, base_offset as u8]);
        msg.extend_from_slice(&[0, 1, 0, 1]);

        let dns = parse(&msg).unwrap();
        assert_eq!(dns.questions[0].name, "example.com");
        assert_eq!(dns.questions[1].name, "www.example.com");
        // second question's type was read from right after the pointer
        assert_eq!(dns.questions[1].qtype, TYPE_A);
    }

    #[test]
    fn test_out_of_range_pointer_rejected() {
        let mut msg = header(1, 0x0100, 1, 0);
        msg.extend_from_slice(&[0xc0, 0xff]); // pointer to offset 255, past the packet
        msg.extend_from_slice(&[0, 1, 0, 1]);

        assert!(parse(&msg).is_none());
    }

    #[test]
    fn test_pointer_loop_terminates() {
        let mut msg = header(1, 0x0100, 1, 0);
        let at = msg.len();
        msg.extend_from_slice(&[0xc0, at as u8]); // pointer to itself
        msg.extend_from_slice(&[0, 1, 0, 1]);

        assert!(parse(&msg).is_none());
    }

    #[test]
    fn test_short_payload_rejected() {
        assert!(parse(&[0u8; 5]).is_none());
    }

    #[test]
    fn test_cname_answer() {
        let mut msg = header(1, 0x8180, 1, 1);
        msg.extend(encode_name("alias.net"));
        msg.extend_from_slice(&[0, 1, 0, 1]);
        msg.extend_from_slice(&[0xc0, 12]);
        msg.extend_from_slice(&[0, 5, 0, 1]); // CNAME
        msg.extend_from_slice(&60u32.to_be_bytes());
        let target = encode_name("real.example.org");
        msg.extend_from_slice(&(target.len() as u16).to_be_bytes());
        msg.extend(&target);

        let dns = parse(&msg).unwrap();
        assert_eq!(dns.answers[0].data, "real.example.org");
    }
}
