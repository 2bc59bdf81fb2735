//! TLS 1.2 session-ticket disguise framing.
//!
//! The first outbound chunk is packaged as a fake ClientHello whose
//! `session_ticket` extension carries the ciphertext; everything after
//! rides in ApplicationData records (`17 03 03 len`). Inbound records are
//! reassembled across chunk boundaries: handshake records yield their
//! ticket payload, ApplicationData yields its body, ChangeCipherSpec and
//! Alert are skipped. Anything that is not a TLS record is a protocol
//! violation — data is never passed through unwrapped.

use bytes::{BufMut, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// TLS record types we emit or accept.
const REC_CHANGE_CIPHER_SPEC: u8 = 0x14;
const REC_ALERT: u8 = 0x15;
const REC_HANDSHAKE: u8 = 0x16;
const REC_APPLICATION_DATA: u8 = 0x17;

/// ClientHello handshake type.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Extension numbers used by the disguise.
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SESSION_TICKET: u16 = 0x0023;

/// Maximum payload per ApplicationData record.
const MAX_RECORD_PAYLOAD: usize = 16384;

/// Maximum ciphertext embedded in the ClientHello ticket; the rest of the
/// first chunk overflows into ApplicationData records.
const MAX_TICKET_PAYLOAD: usize = 8192;

/// Hard ceiling when parsing peer records.
const MAX_INBOUND_RECORD: usize = MAX_RECORD_PAYLOAD + 2048;

/// One direction's worth of TLS disguise state.
pub(crate) struct TlsObfs {
    host: String,
    hello_sent: bool,
    inbound: BytesMut,
}

impl TlsObfs {
    pub(crate) fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            hello_sent: false,
            inbound: BytesMut::new(),
        }
    }

    /// Frame an outbound ciphertext chunk.
    pub(crate) fn wrap(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        let mut framed = Vec::with_capacity(ciphertext.len() + 256);

        let rest = if self.hello_sent {
            ciphertext
        } else {
            self.hello_sent = true;
            let ticket_len = ciphertext.len().min(MAX_TICKET_PAYLOAD);
            framed.extend_from_slice(&self.client_hello(&ciphertext[..ticket_len]));
            &ciphertext[ticket_len..]
        };

        for chunk in rest.chunks(MAX_RECORD_PAYLOAD) {
            framed.push(REC_APPLICATION_DATA);
            framed.push(0x03);
            framed.push(0x03);
            framed.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            framed.extend_from_slice(chunk);
        }
        framed
    }

    /// Unframe inbound bytes, reassembling records across chunk boundaries.
    ///
    /// Returns the payload of every complete record seen so far; a partial
    /// trailing record stays buffered for the next call.
    pub(crate) fn unwrap(&mut self, framed: &[u8]) -> Result<Vec<u8>> {
        self.inbound.extend_from_slice(framed);

        let mut payload = Vec::new();
        loop {
            if self.inbound.len() < 5 {
                break;
            }

            let record_type = self.inbound[0];
            if !(REC_CHANGE_CIPHER_SPEC..=REC_APPLICATION_DATA).contains(&record_type) {
                return Err(Error::invalid_protocol(format!(
                    "unknown tls record type 0x{record_type:02x}"
                )));
            }
            if self.inbound[1] != 0x03 {
                return Err(Error::invalid_protocol("bad tls record version"));
            }

            let length = u16::from_be_bytes([self.inbound[3], self.inbound[4]]) as usize;
            if length > MAX_INBOUND_RECORD {
                return Err(Error::invalid_protocol("tls record too large"));
            }
            if self.inbound.len() < 5 + length {
                break;
            }

            let record = self.inbound.split_to(5 + length);
            let body = &record[5..];

            match record_type {
                REC_APPLICATION_DATA => payload.extend_from_slice(body),
                REC_HANDSHAKE => {
                    if let Some(ticket) = extract_ticket(body)? {
                        payload.extend_from_slice(&ticket);
                    }
                }
                // ChangeCipherSpec / Alert carry no tunnel payload
                _ => {}
            }
        }

        Ok(payload)
    }

    /// Build a ClientHello record with the ciphertext in its ticket.
    fn client_hello(&self, ticket: &[u8]) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(ticket.len() + 256);

        body.put_u8(HANDSHAKE_CLIENT_HELLO);
        let length_pos = body.len();
        body.put_slice(&[0, 0, 0]);

        // Legacy version + client random
        body.put_u16(0x0303);
        let mut random = [0u8; 32];
        OsRng.fill_bytes(&mut random);
        body.put_slice(&random);

        // Resumption-style session ID
        let mut session_id = [0u8; 32];
        OsRng.fill_bytes(&mut session_id);
        body.put_u8(32);
        body.put_slice(&session_id);

        // Cipher suites matching a mainstream browser fingerprint
        let suites: [u16; 9] = [
            0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8,
        ];
        body.put_u16((suites.len() * 2) as u16);
        for suite in suites {
            body.put_u16(suite);
        }

        // Null compression only
        body.put_u8(1);
        body.put_u8(0);

        let extensions = self.build_extensions(ticket);
        body.put_u16(extensions.len() as u16);
        body.put_slice(&extensions);

        let handshake_len = body.len() - 4;
        body[length_pos] = ((handshake_len >> 16) & 0xff) as u8;
        body[length_pos + 1] = ((handshake_len >> 8) & 0xff) as u8;
        body[length_pos + 2] = (handshake_len & 0xff) as u8;

        let mut record = Vec::with_capacity(body.len() + 5);
        record.push(REC_HANDSHAKE);
        record.push(0x03);
        record.push(0x01);
        record.extend_from_slice(&(body.len() as u16).to_be_bytes());
        record.extend_from_slice(&body);
        record
    }

    fn build_extensions(&self, ticket: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(ticket.len() + 64);

        // SNI
        let sni = self.host.as_bytes();
        buf.put_u16(EXT_SERVER_NAME);
        buf.put_u16((sni.len() + 5) as u16);
        buf.put_u16((sni.len() + 3) as u16);
        buf.put_u8(0); // host_name type
        buf.put_u16(sni.len() as u16);
        buf.put_slice(sni);

        // Session ticket carrying the ciphertext
        buf.put_u16(EXT_SESSION_TICKET);
        buf.put_u16(ticket.len() as u16);
        buf.put_slice(ticket);

        buf.to_vec()
    }
}

/// Pull the session-ticket payload out of a ClientHello handshake body.
///
/// Other handshake types (ServerHello, Finished) carry no tunnel payload
/// and yield `None`. Structural overruns are protocol violations.
fn extract_ticket(handshake: &[u8]) -> Result<Option<Vec<u8>>> {
    if handshake.len() < 4 {
        return Err(Error::invalid_protocol("truncated tls handshake"));
    }
    if handshake[0] != HANDSHAKE_CLIENT_HELLO {
        return Ok(None);
    }

    let declared = ((handshake[1] as usize) << 16)
        | ((handshake[2] as usize) << 8)
        | (handshake[3] as usize);
    let body = handshake
        .get(4..4 + declared)
        .ok_or_else(|| Error::invalid_protocol("client hello length overruns record"))?;

    // version(2) + random(32) + session_id_len(1)
    let mut pos = 34;
    let session_id_len = *body
        .get(pos)
        .ok_or_else(|| Error::invalid_protocol("client hello too short"))? as usize;
    pos += 1 + session_id_len;

    let suites_len = read_u16(body, pos)? as usize;
    pos += 2 + suites_len;

    let compression_len = *body
        .get(pos)
        .ok_or_else(|| Error::invalid_protocol("client hello too short"))? as usize;
    pos += 1 + compression_len;

    let extensions_len = read_u16(body, pos)? as usize;
    pos += 2;
    let extensions_end = pos + extensions_len;
    if extensions_end > body.len() {
        return Err(Error::invalid_protocol("extensions overrun client hello"));
    }

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(body, pos)?;
        let ext_len = read_u16(body, pos + 2)? as usize;
        pos += 4;
        if pos + ext_len > extensions_end {
            return Err(Error::invalid_protocol("extension overruns client hello"));
        }
        if ext_type == EXT_SESSION_TICKET {
            return Ok(Some(body[pos..pos + ext_len].to_vec()));
        }
        pos += ext_len;
    }

    Ok(None)
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| Error::invalid_protocol("client hello too short"))
}
