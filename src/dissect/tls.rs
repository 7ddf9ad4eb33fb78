//! TLS ClientHello dissection and SNI extraction

/// TLS record content types
pub const TLS_HANDSHAKE: u8 = 0x16;

/// TLS handshake types
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// TLS extension types
pub const EXT_SERVER_NAME: u16 = 0x0000;

/// Parsed ClientHello summary
#[derive(Debug, Clone, Default)]
pub struct ClientHello {
    /// TLS version offered in the hello body
    pub client_version: u16,
    /// Server Name Indication, when present
    pub sni: Option<String>,
    /// Number of cipher suites offered
    pub cipher_suite_count: u16,
}

/// Extract the SNI hostname from a TCP payload, if it carries a ClientHello
pub fn extract_sni(payload: &[u8]) -> Option<String> {
    parse_client_hello(payload)?.sni
}

/// Parse a TLS ClientHello out of a TCP payload.
///
/// The payload must start at the TLS record header. Any structural
/// inconsistency (wrong content type, truncated walk) yields `None`.
pub fn parse_client_hello(payload: &[u8]) -> Option<ClientHello> {
    // record header (5) + minimal hello body
    if payload.len() < 43 {
        return None;
    }

    if payload[0] != TLS_HANDSHAKE {
        return None;
    }

    let record_length = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    if record_length + 5 > payload.len() {
        return None;
    }

    if payload[5] != HANDSHAKE_CLIENT_HELLO {
        return None;
    }

    // handshake type (1) + handshake length (3)
    let mut pos = 9;

    let client_version = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
    pos += 2;

    // random
    pos += 32;

    if pos >= payload.len() {
        return None;
    }
    let session_id_len = payload[pos] as usize;
    pos += 1 + session_id_len;

    if pos + 2 > payload.len() {
        return None;
    }
    let cipher_suites_len = u16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;
    let cipher_suite_count = (cipher_suites_len / 2) as u16;

    if pos >= payload.len() {
        return None;
    }
    let compression_len = payload[pos] as usize;
    pos += 1 + compression_len;

    let mut hello = ClientHello {
        client_version,
        sni: None,
        cipher_suite_count,
    };

    if pos + 2 > payload.len() {
        // no extensions block at all
        return Some(hello);
    }
    let extensions_len = u16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(payload.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        let ext_len = u16::from_be_bytes([payload[pos + 2], payload[pos + 3]]) as usize;
        pos += 4;

        if pos + ext_len > extensions_end {
            return None;
        }

        if ext_type == EXT_SERVER_NAME && ext_len >= 2 {
            hello.sni = parse_server_name(&payload[pos..pos + ext_len]);
        }

        pos += ext_len;
    }

    Some(hello)
}

/// Walk the server_name extension body; the first entry with name type 0 wins
fn parse_server_name(ext: &[u8]) -> Option<String> {
    let list_len = u16::from_be_bytes([ext[0], ext[1]]) as usize;
    let end = (2 + list_len).min(ext.len());
    let mut pos = 2;

    while pos + 3 <= end {
        let name_type = ext[pos];
        let name_len = u16::from_be_bytes([ext[pos + 1], ext[pos + 2]]) as usize;
        pos += 3;

        if pos + name_len > end {
            return None;
        }

        if name_type == 0 && name_len > 0 {
            return std::str::from_utf8(&ext[pos..pos + name_len])
                .ok()
                .map(|s| s.to_string());
        }

        pos += name_len;
    }

    None
}
