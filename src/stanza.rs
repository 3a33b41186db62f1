//! Typed stanza model: decode/encode between raw XML frames and the tagged
//! `Stanza` union the router dispatches on.
//!
//! Each variant maps 1:1 to a wire element. Unknown top-level element names
//! decode to `Stanza::Unknown` so the router can apply an explicit
//! unsupported-stanza policy instead of the codec silently dropping data.
//! Encoding is deterministic, and empty markers (`<required/>`, an empty
//! `<query/>`) always serialize self-closed — clients commonly reject the
//! matched open/close form.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use quick_xml::escape::{escape, unescape};
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use rand::Rng;

use crate::error::{EngineError, EngineResult};

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Attributes of a `<stream:stream>` header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamHeader {
    pub from: Option<String>,
    pub to: Option<String>,
    pub id: Option<String>,
    pub version: String,
    pub lang: Option<String>,
}

/// `<stream:features>` advertisement. Auth is offered iff `mechanisms` is
/// non-empty; `bind_required` is the post-authentication bind capability.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Features {
    pub mechanisms: Vec<String>,
    pub bind_required: bool,
}

/// One protocol message, as dispatched by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stanza {
    StreamOpen(StreamHeader),
    Features(Features),
    /// `<auth mechanism='M'>base64(credentials)</auth>`
    AuthRequest { mechanism: String, credentials: Vec<u8> },
    /// `<success/>` or `<failure/>`
    AuthResult { ok: bool },
    /// `<iq type='set'><bind>[<resource/>]</bind></iq>`
    BindRequest { id: String, resource: Option<String> },
    /// `<iq type='result'><bind><jid/></bind></iq>`
    BindResult { id: String, jid: String },
    /// `<iq type='get|set'><query xmlns='kind'>payload</query></iq>`;
    /// `kind` is the child element's namespace, `payload` its raw inner XML.
    Query { id: String, kind: String, payload: String },
    /// `<iq type='result'>payload</iq>`; `payload` is the iq's raw inner XML.
    QueryResult { id: String, payload: String },
    /// `<iq type='error'>` with a defined-condition child. The correlated
    /// response form for protocol-order violations and unsupported queries.
    StanzaError { id: String, condition: String },
    /// Any top-level element the model does not declare.
    Unknown { name: String },
}

/// Generate an opaque server-side token: 8 cryptographically random bytes,
/// hex-encoded. Used for stream ids, generated resources, and ids on
/// unsolicited outbound stanzas.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// `read_text` yields the raw escaped text; wire escapes must not leak into
/// the model.
fn unescape_text(text: &str) -> EngineResult<String> {
    Ok(unescape(text)
        .map_err(|e| syntax(e.to_string()))?
        .into_owned())
}

fn attr_string(attr: &Attribute<'_>) -> String {
    match attr.unescape_value() {
        Ok(v) => v.into_owned(),
        Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
    }
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("='");
    out.push_str(&escape(value));
    out.push('\'');
}

fn syntax(msg: impl Into<String>) -> EngineError {
    EngineError::FrameSyntax(msg.into())
}

impl Stanza {
    /// Deterministic wire serialization of this stanza.
    pub fn encode(&self) -> String {
        match self {
            Stanza::StreamOpen(header) => {
                let mut out = String::from("<?xml version='1.0'?><stream:stream");
                if let Some(from) = &header.from {
                    push_attr(&mut out, "from", from);
                }
                if let Some(to) = &header.to {
                    push_attr(&mut out, "to", to);
                }
                if let Some(id) = &header.id {
                    push_attr(&mut out, "id", id);
                }
                push_attr(&mut out, "version", &header.version);
                if let Some(lang) = &header.lang {
                    push_attr(&mut out, "xml:lang", lang);
                }
                push_attr(&mut out, "xmlns", NS_CLIENT);
                push_attr(&mut out, "xmlns:stream", NS_STREAMS);
                out.push('>');
                out
            }
            Stanza::Features(features) => {
                let mut out = String::from("<stream:features>");
                if !features.mechanisms.is_empty() {
                    out.push_str(&format!("<mechanisms xmlns='{}'>", NS_SASL));
                    for mechanism in &features.mechanisms {
                        out.push_str(&format!("<mechanism>{}</mechanism>", escape(mechanism)));
                    }
                    out.push_str("</mechanisms>");
                }
                if features.bind_required {
                    out.push_str(&format!(
                        "<bind xmlns='{}'><required/></bind><session xmlns='{}'><optional/></session>",
                        NS_BIND, NS_SESSION
                    ));
                }
                out.push_str("</stream:features>");
                out
            }
            Stanza::AuthRequest {
                mechanism,
                credentials,
            } => {
                if credentials.is_empty() {
                    format!(
                        "<auth xmlns='{}' mechanism='{}'/>",
                        NS_SASL,
                        escape(mechanism)
                    )
                } else {
                    format!(
                        "<auth xmlns='{}' mechanism='{}'>{}</auth>",
                        NS_SASL,
                        escape(mechanism),
                        BASE64.encode(credentials)
                    )
                }
            }
            Stanza::AuthResult { ok: true } => format!("<success xmlns='{}'/>", NS_SASL),
            Stanza::AuthResult { ok: false } => format!(
                "<failure xmlns='{}'><not-authorized/></failure>",
                NS_SASL
            ),
            Stanza::BindRequest { id, resource } => {
                let bind = match resource {
                    Some(resource) => format!(
                        "<bind xmlns='{}'><resource>{}</resource></bind>",
                        NS_BIND,
                        escape(resource)
                    ),
                    None => format!("<bind xmlns='{}'/>", NS_BIND),
                };
                format!("<iq type='set' id='{}'>{}</iq>", escape(id), bind)
            }
            Stanza::BindResult { id, jid } => format!(
                "<iq type='result' id='{}'><bind xmlns='{}'><jid>{}</jid></bind></iq>",
                escape(id),
                NS_BIND,
                escape(jid)
            ),
            Stanza::Query { id, kind, payload } => {
                let query = if payload.is_empty() {
                    format!("<query xmlns='{}'/>", escape(kind))
                } else {
                    format!("<query xmlns='{}'>{}</query>", escape(kind), payload)
                };
                format!("<iq type='get' id='{}'>{}</iq>", escape(id), query)
            }
            Stanza::QueryResult { id, payload } => {
                if payload.is_empty() {
                    format!("<iq type='result' id='{}'/>", escape(id))
                } else {
                    format!("<iq type='result' id='{}'>{}</iq>", escape(id), payload)
                }
            }
            Stanza::StanzaError { id, condition } => format!(
                "<iq type='error' id='{}'><error type='cancel'><{} xmlns='{}'/></error></iq>",
                escape(id),
                condition,
                NS_STANZAS
            ),
            Stanza::Unknown { name } => format!("<{}/>", escape(name)),
        }
    }

    /// Decode one raw top-level frame into a typed stanza.
    ///
    /// Tolerates absent optional fields; unknown element names decode to
    /// `Stanza::Unknown`. Only irrecoverably malformed content (bad markup,
    /// invalid base64 in an auth blob) is an error.
    pub fn decode(xml: &str) -> EngineResult<Stanza> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        reader.config_mut().check_end_names = false;

        loop {
            match reader.read_event().map_err(|e| syntax(e.to_string()))? {
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => continue,
                Event::Text(_) | Event::CData(_) => continue,
                Event::Start(e) => return decode_element(&mut reader, xml, e, false),
                Event::Empty(e) => return decode_element(&mut reader, xml, e, true),
                Event::End(e) => {
                    return Err(syntax(format!(
                        "unexpected close tag </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )))
                }
                Event::Eof => return Err(syntax("empty frame")),
            }
        }
    }
}

fn decode_element(
    reader: &mut Reader<&[u8]>,
    src: &str,
    e: BytesStart<'_>,
    is_empty: bool,
) -> EngineResult<Stanza> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let local = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();

    match (name.as_str(), local.as_str()) {
        ("stream:stream", _) | (_, "stream") => decode_stream_open(&e),
        ("stream:features", _) | (_, "features") => {
            if is_empty {
                Ok(Stanza::Features(Features::default()))
            } else {
                decode_features(reader)
            }
        }
        (_, "auth") => decode_auth(reader, &e, is_empty),
        (_, "success") => {
            if !is_empty {
                skip_to_end(reader, &e)?;
            }
            Ok(Stanza::AuthResult { ok: true })
        }
        (_, "failure") => {
            if !is_empty {
                skip_to_end(reader, &e)?;
            }
            Ok(Stanza::AuthResult { ok: false })
        }
        (_, "iq") => decode_iq(reader, src, &e, is_empty),
        _ => {
            if !is_empty {
                skip_to_end(reader, &e)?;
            }
            Ok(Stanza::Unknown { name })
        }
    }
}

fn decode_stream_open(e: &BytesStart<'_>) -> EngineResult<Stanza> {
    let mut header = StreamHeader {
        version: "1.0".to_string(),
        ..Default::default()
    };
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        match key.as_str() {
            "from" => header.from = Some(attr_string(&attr)),
            "to" => header.to = Some(attr_string(&attr)),
            "id" => header.id = Some(attr_string(&attr)),
            "version" => header.version = attr_string(&attr),
            "xml:lang" => header.lang = Some(attr_string(&attr)),
            _ => {} // xmlns declarations are fixed by the wire contract
        }
    }
    Ok(Stanza::StreamOpen(header))
}

fn decode_features(reader: &mut Reader<&[u8]>) -> EngineResult<Stanza> {
    let mut features = Features::default();
    loop {
        match reader.read_event().map_err(|e| syntax(e.to_string()))? {
            Event::Start(child) => {
                let child_local = child.name().local_name().as_ref().to_vec();
                match child_local.as_slice() {
                    b"mechanisms" => {
                        loop {
                            match reader.read_event().map_err(|e| syntax(e.to_string()))? {
                                Event::Start(m) if m.name().local_name().as_ref() == b"mechanism" => {
                                    let text = reader
                                        .read_text(m.name())
                                        .map_err(|e| syntax(e.to_string()))?;
                                    features.mechanisms.push(unescape_text(text.trim())?);
                                }
                                Event::Start(other) => skip_to_end(reader, &other)?,
                                Event::End(end)
                                    if end.name().local_name().as_ref() == b"mechanisms" =>
                                {
                                    break
                                }
                                Event::Eof => return Err(syntax("truncated mechanisms element")),
                                _ => {}
                            }
                        }
                    }
                    b"bind" => {
                        features.bind_required = true;
                        skip_to_end(reader, &child)?;
                    }
                    _ => skip_to_end(reader, &child)?,
                }
            }
            Event::Empty(child) => {
                if child.name().local_name().as_ref() == b"bind" {
                    features.bind_required = true;
                }
            }
            Event::End(end) if end.name().local_name().as_ref() == b"features" => break,
            Event::Eof => return Err(syntax("truncated features element")),
            _ => {}
        }
    }
    Ok(Stanza::Features(features))
}

fn decode_auth(
    reader: &mut Reader<&[u8]>,
    e: &BytesStart<'_>,
    is_empty: bool,
) -> EngineResult<Stanza> {
    let mut mechanism = String::new();
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == b"mechanism" {
            mechanism = attr_string(&attr);
        }
    }

    let credentials = if is_empty {
        Vec::new()
    } else {
        let text = reader
            .read_text(e.name())
            .map_err(|e| syntax(e.to_string()))?;
        let trimmed = unescape_text(text.trim())?;
        if trimmed.is_empty() {
            Vec::new()
        } else {
            BASE64
                .decode(trimmed.as_bytes())
                .map_err(|e| syntax(format!("invalid base64 in auth blob: {}", e)))?
        }
    };

    Ok(Stanza::AuthRequest {
        mechanism,
        credentials,
    })
}

fn decode_iq(
    reader: &mut Reader<&[u8]>,
    src: &str,
    e: &BytesStart<'_>,
    is_empty: bool,
) -> EngineResult<Stanza> {
    let mut iq_type = String::new();
    let mut id = String::new();
    for attr in e.attributes().flatten() {
        match attr.key.as_ref() {
            b"type" => iq_type = attr_string(&attr),
            b"id" => id = attr_string(&attr),
            _ => {}
        }
    }

    if is_empty {
        // Childless iq. A result carries an empty payload; a request with no
        // child has no kind and falls to the unsupported-query policy.
        return Ok(match iq_type.as_str() {
            "result" => Stanza::QueryResult {
                id,
                payload: String::new(),
            },
            _ => Stanza::Query {
                id,
                kind: String::new(),
                payload: String::new(),
            },
        });
    }

    let inner_start = reader.buffer_position() as usize;

    // First child element determines the request shape
    let child = loop {
        match reader.read_event().map_err(|e| syntax(e.to_string()))? {
            Event::Start(c) => break Some((c.to_owned(), false)),
            Event::Empty(c) => break Some((c.to_owned(), true)),
            Event::End(end) if end.name().local_name().as_ref() == b"iq" => break None,
            Event::Eof => return Err(syntax("truncated iq element")),
            _ => {}
        }
    };

    let (child, child_empty) = match child {
        Some(c) => c,
        None => {
            return Ok(match iq_type.as_str() {
                "result" => Stanza::QueryResult {
                    id,
                    payload: String::new(),
                },
                _ => Stanza::Query {
                    id,
                    kind: String::new(),
                    payload: String::new(),
                },
            })
        }
    };
    let child_local = child.name().local_name().as_ref().to_vec();

    match iq_type.as_str() {
        "error" => {
            let condition = if child_local == b"error" && !child_empty {
                decode_error_condition(reader)?
            } else {
                if !child_empty {
                    skip_to_end(reader, &child)?;
                }
                "undefined-condition".to_string()
            };
            skip_to_iq_end(reader)?;
            Ok(Stanza::StanzaError { id, condition })
        }
        "result" if child_local == b"bind" => {
            let jid = if child_empty {
                String::new()
            } else {
                decode_bind_child(reader)?.1
            };
            skip_to_iq_end(reader)?;
            Ok(Stanza::BindResult { id, jid })
        }
        "result" => {
            // Opaque result payload: the iq's whole inner XML, verbatim
            if !child_empty {
                skip_to_end(reader, &child)?;
            }
            let inner_end = skip_to_iq_end(reader)?;
            Ok(Stanza::QueryResult {
                id,
                payload: src[inner_start..inner_end].to_string(),
            })
        }
        "get" | "set" => {
            if child_local == b"bind" {
                let resource = if child_empty {
                    None
                } else {
                    let (resource, _) = decode_bind_child(reader)?;
                    resource
                };
                skip_to_iq_end(reader)?;
                return Ok(Stanza::BindRequest { id, resource });
            }

            // Generic query: kind is the child's namespace (falling back to
            // its name), payload its raw inner XML.
            let mut kind = String::new();
            for attr in child.attributes().flatten() {
                if attr.key.as_ref() == b"xmlns" {
                    kind = attr_string(&attr);
                }
            }
            if kind.is_empty() {
                kind = String::from_utf8_lossy(&child_local).into_owned();
            }

            let payload = if child_empty {
                String::new()
            } else {
                read_inner(reader, src)?
            };
            skip_to_iq_end(reader)?;
            Ok(Stanza::Query { id, kind, payload })
        }
        _ => {
            if !child_empty {
                skip_to_end(reader, &child)?;
            }
            skip_to_iq_end(reader)?;
            Ok(Stanza::Unknown {
                name: "iq".to_string(),
            })
        }
    }
}

/// Resource or jid text inside an already-opened `<bind>` element.
fn decode_bind_child(reader: &mut Reader<&[u8]>) -> EngineResult<(Option<String>, String)> {
    let mut resource = None;
    let mut jid = String::new();
    loop {
        match reader.read_event().map_err(|e| syntax(e.to_string()))? {
            Event::Start(c) => {
                let local = c.name().local_name().as_ref().to_vec();
                let text = reader
                    .read_text(c.name())
                    .map_err(|e| syntax(e.to_string()))?
                    .trim()
                    .to_string();
                match local.as_slice() {
                    b"resource" => resource = Some(unescape_text(&text)?),
                    b"jid" => jid = unescape_text(&text)?,
                    _ => {}
                }
            }
            Event::End(end) if end.name().local_name().as_ref() == b"bind" => break,
            Event::Eof => return Err(syntax("truncated bind element")),
            _ => {}
        }
    }
    Ok((resource, jid))
}

/// Name of the defined-condition child inside an already-opened `<error>`.
fn decode_error_condition(reader: &mut Reader<&[u8]>) -> EngineResult<String> {
    let mut condition = "undefined-condition".to_string();
    let mut seen = false;
    loop {
        match reader.read_event().map_err(|e| syntax(e.to_string()))? {
            Event::Start(c) => {
                if !seen {
                    condition = String::from_utf8_lossy(c.name().local_name().as_ref()).into_owned();
                    seen = true;
                }
                skip_to_end(reader, &c)?;
            }
            Event::Empty(c) => {
                if !seen {
                    condition = String::from_utf8_lossy(c.name().local_name().as_ref()).into_owned();
                    seen = true;
                }
            }
            Event::End(end) if end.name().local_name().as_ref() == b"error" => break,
            Event::Eof => return Err(syntax("truncated error element")),
            _ => {}
        }
    }
    Ok(condition)
}

/// Consume events up to the close tag matching `e`.
fn skip_to_end(reader: &mut Reader<&[u8]>, e: &BytesStart<'_>) -> EngineResult<()> {
    reader
        .read_to_end(e.name())
        .map_err(|e| syntax(e.to_string()))?;
    Ok(())
}

/// Consume events up to `</iq>`, returning the byte offset where its close
/// tag begins (the end of the iq's inner XML).
fn skip_to_iq_end(reader: &mut Reader<&[u8]>) -> EngineResult<usize> {
    let mut depth: u32 = 0;
    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event().map_err(|e| syntax(e.to_string()))? {
            Event::Start(_) => depth += 1,
            Event::End(end) => {
                if depth == 0 && end.name().local_name().as_ref() == b"iq" {
                    return Ok(pos);
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => return Err(syntax("truncated iq element")),
            _ => {}
        }
    }
}

/// Raw inner XML of the element the reader is currently inside, captured by
/// byte offsets so opaque payloads survive verbatim.
fn read_inner(reader: &mut Reader<&[u8]>, src: &str) -> EngineResult<String> {
    let start = reader.buffer_position() as usize;
    let mut depth: u32 = 1;
    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event().map_err(|e| syntax(e.to_string()))? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(src[start..pos].to_string());
                }
            }
            Event::Eof => return Err(syntax("truncated element")),
            _ => {}
        }
    }
}
