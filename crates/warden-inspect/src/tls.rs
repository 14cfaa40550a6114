//! TLS stream inspector
//!
//! Decodes successive TLS records off the reassembled stream. The client
//! side must present a ClientHello (the inspector gives up after five
//! uninformative packets); its SNI is checked against the connection's
//! domain and the JA3 client fingerprint is recorded on the entity. On
//! ServerHello the connection is marked encrypted. For TLS 1.2 and below
//! the certificate message is still readable: the chain is verified against
//! the system roots for the SNI and a failure blocks the connection.

use crate::{Inspector, InspectorFactory, StreamOutcome};
use md5::{Digest, Md5};
use std::sync::Arc;
use warden_conntrack::{ConnState, Connection};
use warden_packet::{Direction, PacketInfo, Protocol, Verdict};

const RECORD_HANDSHAKE: u8 = 22;

const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO: u8 = 2;
const HANDSHAKE_CERTIFICATE: u8 = 11;

const EXT_SNI: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

const TLS_1_2: u16 = 0x0303;
const TLS_1_3: u16 = 0x0304;

/// Calls on the client stream without a complete ClientHello before the
/// inspector gives up
const MAX_UNINFORMATIVE: u8 = 5;

/// Verifies a server certificate chain for a host name
pub trait CertificateVerifier: Send + Sync {
    /// DER certificates, end-entity first. Returns the verification error
    /// as a string on failure.
    fn verify_chain(&self, chain: &[Vec<u8>], server_name: &str) -> Result<(), String>;
}

/// Chain verification against the bundled web-PKI roots
pub struct WebPkiVerifier {
    verifier: Arc<rustls::client::WebPkiServerVerifier>,
}

impl WebPkiVerifier {
    pub fn new() -> Result<Self, String> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let verifier = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { verifier })
    }
}

impl CertificateVerifier for WebPkiVerifier {
    fn verify_chain(&self, chain: &[Vec<u8>], server_name: &str) -> Result<(), String> {
        use rustls::client::danger::ServerCertVerifier;
        use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

        let Some((end_entity, intermediates)) = chain.split_first() else {
            return Err("empty certificate chain".into());
        };
        let end_entity = CertificateDer::from(end_entity.clone());
        let intermediates: Vec<CertificateDer<'_>> = intermediates
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect();
        let name = ServerName::try_from(server_name.to_owned()).map_err(|e| e.to_string())?;

        self.verifier
            .verify_server_cert(&end_entity, &intermediates, &name, &[], UnixTime::now())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// One decoded TLS record
struct Record<'a> {
    content_type: u8,
    payload: &'a [u8],
}

/// Decode all complete records at the head of the stream
fn records(stream: &[u8]) -> Vec<Record<'_>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while stream.len() >= pos + 5 {
        let content_type = stream[pos];
        let len = u16::from_be_bytes([stream[pos + 3], stream[pos + 4]]) as usize;
        if stream.len() < pos + 5 + len {
            break;
        }
        out.push(Record {
            content_type,
            payload: &stream[pos + 5..pos + 5 + len],
        });
        pos += 5 + len;
    }
    out
}

/// Concatenated handshake payloads, split into complete messages
fn handshake_messages(stream: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut joined = Vec::new();
    for record in records(stream) {
        if record.content_type == RECORD_HANDSHAKE {
            joined.extend_from_slice(record.payload);
        }
    }

    let mut out = Vec::new();
    let mut pos = 0;
    while joined.len() >= pos + 4 {
        let msg_type = joined[pos];
        let len =
            u32::from_be_bytes([0, joined[pos + 1], joined[pos + 2], joined[pos + 3]]) as usize;
        if joined.len() < pos + 4 + len {
            break;
        }
        out.push((msg_type, joined[pos + 4..pos + 4 + len].to_vec()));
        pos += 4 + len;
    }
    out
}

#[derive(Debug, Default)]
struct ClientHello {
    version: u16,
    sni: Option<String>,
    cipher_suites: Vec<u16>,
    extensions: Vec<u16>,
    curves: Vec<u16>,
    ec_formats: Vec<u8>,
}

impl ClientHello {
    fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 34 {
            return None;
        }
        let mut hello = ClientHello {
            version: u16::from_be_bytes([body[0], body[1]]),
            ..Default::default()
        };

        // 2 version + 32 random
        let mut pos = 34;

        let session_id_len = *body.get(pos)? as usize;
        pos += 1 + session_id_len;

        let cipher_len =
            u16::from_be_bytes([*body.get(pos)?, *body.get(pos + 1)?]) as usize;
        pos += 2;
        let ciphers = body.get(pos..pos + cipher_len)?;
        hello.cipher_suites = ciphers
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        pos += cipher_len;

        let comp_len = *body.get(pos)? as usize;
        pos += 1 + comp_len;

        if pos + 2 > body.len() {
            // extension-less hello is still a valid hello
            return Some(hello);
        }
        let ext_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
        pos += 2;
        let ext_end = (pos + ext_len).min(body.len());

        while pos + 4 <= ext_end {
            let ext_type = u16::from_be_bytes([body[pos], body[pos + 1]]);
            let data_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
            pos += 4;
            let data = match body.get(pos..pos + data_len) {
                Some(d) => d,
                None => break,
            };
            hello.extensions.push(ext_type);

            match ext_type {
                EXT_SNI => {
                    // server_name_list: len u16, type u8, name len u16, name
                    if data.len() > 5 {
                        let name_len = u16::from_be_bytes([data[3], data[4]]) as usize;
                        if data.len() >= 5 + name_len {
                            hello.sni =
                                String::from_utf8(data[5..5 + name_len].to_vec()).ok();
                        }
                    }
                }
                EXT_SUPPORTED_GROUPS => {
                    if data.len() >= 2 {
                        let list_len =
                            (u16::from_be_bytes([data[0], data[1]]) as usize).min(data.len() - 2);
                        hello.curves = data[2..2 + list_len]
                            .chunks_exact(2)
                            .map(|c| u16::from_be_bytes([c[0], c[1]]))
                            .collect();
                    }
                }
                EXT_EC_POINT_FORMATS => {
                    if !data.is_empty() {
                        let list_len = (data[0] as usize).min(data.len() - 1);
                        hello.ec_formats = data[1..1 + list_len].to_vec();
                    }
                }
                _ => {}
            }
            pos += data_len;
        }

        Some(hello)
    }

    /// JA3 client fingerprint: md5 over
    /// `version,ciphers,extensions,curves,formats` with GREASE filtered out
    fn ja3(&self) -> String {
        fn join(values: &[u16]) -> String {
            values
                .iter()
                .filter(|v| !is_grease(**v))
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("-")
        }
        let formats = self
            .ec_formats
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("-");
        let raw = format!(
            "{},{},{},{},{}",
            self.version,
            join(&self.cipher_suites),
            join(&self.extensions),
            join(&self.curves),
            formats
        );
        let mut hasher = Md5::new();
        hasher.update(raw.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn is_grease(value: u16) -> bool {
    (value & 0x0f0f) == 0x0a0a
}

/// ServerHello: negotiated version, honoring supported_versions
fn server_hello_version(body: &[u8]) -> Option<u16> {
    if body.len() < 34 {
        return None;
    }
    let legacy = u16::from_be_bytes([body[0], body[1]]);

    let mut pos = 34;
    let session_id_len = *body.get(pos)? as usize;
    pos += 1 + session_id_len;
    pos += 2; // cipher suite
    pos += 1; // compression

    if pos + 2 > body.len() {
        return Some(legacy);
    }
    let ext_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2;
    let ext_end = (pos + ext_len).min(body.len());
    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([body[pos], body[pos + 1]]);
        let data_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
        pos += 4;
        if ext_type == EXT_SUPPORTED_VERSIONS && data_len >= 2 && pos + 2 <= body.len() {
            return Some(u16::from_be_bytes([body[pos], body[pos + 1]]));
        }
        pos += data_len;
    }
    Some(legacy)
}

/// Certificate message: DER chain, end-entity first
fn certificate_chain(body: &[u8]) -> Vec<Vec<u8>> {
    let mut chain = Vec::new();
    if body.len() < 3 {
        return chain;
    }
    let total = u32::from_be_bytes([0, body[0], body[1], body[2]]) as usize;
    let mut pos = 3;
    let end = (3 + total).min(body.len());
    while pos + 3 <= end {
        let len = u32::from_be_bytes([0, body[pos], body[pos + 1], body[pos + 2]]) as usize;
        pos += 3;
        match body.get(pos..pos + len) {
            Some(der) => chain.push(der.to_vec()),
            None => break,
        }
        pos += len;
    }
    chain
}

/// Per-connection TLS inspector state
pub struct TlsInspector {
    verifier: Arc<dyn CertificateVerifier>,
    uninformative: u8,
    client_done: bool,
    server_version: Option<u16>,
    sni: Option<String>,
}

impl TlsInspector {
    /// Factory for the registration table: applies to outbound TCP 443
    pub fn factory(verifier: Arc<dyn CertificateVerifier>) -> InspectorFactory {
        Box::new(move |_conn: &Connection, state: &mut ConnState, info: &PacketInfo| {
            if info.protocol == Protocol::Tcp
                && info.direction.is_outbound()
                && state.entity.remote_port == 443
            {
                Some(Box::new(TlsInspector {
                    verifier: verifier.clone(),
                    uninformative: 0,
                    client_done: false,
                    server_version: None,
                    sni: None,
                }) as Box<dyn Inspector>)
            } else {
                None
            }
        })
    }

    fn handle_client(&mut self, state: &mut ConnState, stream: &[u8]) -> StreamOutcome {
        if self.client_done {
            return StreamOutcome::need_more();
        }

        for (msg_type, body) in handshake_messages(stream) {
            if msg_type != HANDSHAKE_CLIENT_HELLO {
                continue;
            }
            let Some(hello) = ClientHello::parse(&body) else {
                continue;
            };
            state.entity.ja3 = Some(hello.ja3());
            self.sni = hello.sni.clone();
            if let (Some(sni), Some(domain)) = (&hello.sni, &state.entity.domain) {
                let domain = domain.trim_end_matches('.');
                if !sni.eq_ignore_ascii_case(domain) {
                    // mismatch alone does not block; verification below
                    // runs against the SNI the client actually sent
                    tracing::warn!(sni = %sni, domain = %domain, "TLS SNI mismatch");
                }
            }
            self.client_done = true;
            return StreamOutcome::need_more();
        }

        self.uninformative += 1;
        if self.uninformative >= MAX_UNINFORMATIVE {
            return StreamOutcome::give_up();
        }
        StreamOutcome::need_more()
    }

    fn handle_server(&mut self, state: &mut ConnState, stream: &[u8]) -> StreamOutcome {
        for (msg_type, body) in handshake_messages(stream) {
            match msg_type {
                HANDSHAKE_SERVER_HELLO => {
                    if self.server_version.is_none() {
                        let version = server_hello_version(&body).unwrap_or(TLS_1_2);
                        self.server_version = Some(version);
                        state.encrypted = true;
                        tracing::debug!(version = format_args!("{version:#06x}"), "TLS ServerHello");
                        if version >= TLS_1_3 {
                            // certificates are encrypted from here on
                            return StreamOutcome::accept();
                        }
                    }
                }
                HANDSHAKE_CERTIFICATE if self.server_version.is_some() => {
                    let chain = certificate_chain(&body);
                    let name = self
                        .sni
                        .clone()
                        .or_else(|| state.entity.domain.clone())
                        .unwrap_or_else(|| state.entity.remote_ip.to_string());
                    return match self.verifier.verify_chain(&chain, &name) {
                        Ok(()) => StreamOutcome::accept(),
                        Err(reason) => StreamOutcome::block(reason),
                    };
                }
                _ => {}
            }
        }
        StreamOutcome::need_more()
    }
}

impl Inspector for TlsInspector {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn handle_stream(
        &mut self,
        state: &mut ConnState,
        direction: Direction,
        stream: &[u8],
    ) -> Result<StreamOutcome, warden_common::Error> {
        let outcome = match direction {
            Direction::Outbound => self.handle_client(state, stream),
            Direction::Inbound => self.handle_server(state, stream),
        };
        Ok(outcome)
    }
}
