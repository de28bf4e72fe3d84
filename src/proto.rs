//! DNS wire format (RFC 1035 §4): just enough of the message layout to carry
//! questions and opaque resource records through the forwarder.
//!
//! Names are decompressed on read. Nothing is compressed on write.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use hickory_proto::rr::{DNSClass, RecordType};

use crate::error::WireError;

/// Largest datagram accepted from clients or the upstream.
pub const MAX_UDP_PACKET: usize = 65_535;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_JUMPS: usize = 32;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;

/// A domain name as a sequence of raw labels, case preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Name {
    labels: Vec<Bytes>,
}

impl Name {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_labels<I, L>(labels: I) -> Result<Self, WireError>
    where
        I: IntoIterator<Item = L>,
        L: Into<Bytes>,
    {
        let labels: Vec<Bytes> = labels.into_iter().map(Into::into).collect();
        let mut wire_len = 1;
        for label in &labels {
            if label.is_empty() {
                return Err(WireError::InvalidName("empty label".to_string()));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(WireError::LabelTooLong(label.len()));
            }
            wire_len += label.len() + 1;
        }
        if wire_len > MAX_NAME_LEN {
            return Err(WireError::NameTooLong(wire_len));
        }
        Ok(Self { labels })
    }

    #[allow(dead_code)]
    pub fn labels(&self) -> &[Bytes] {
        &self.labels
    }

    #[allow(dead_code)]
    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        for label in &self.labels {
            // Label lengths are bounded by construction.
            buf.put_u8(label.len() as u8);
            buf.put_slice(label);
        }
        buf.put_u8(0);
    }
}

impl FromStr for Name {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_suffix('.').unwrap_or(s);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        Self::from_labels(
            trimmed
                .split('.')
                .map(|label| Bytes::copy_from_slice(label.as_bytes())),
        )
        .map_err(|err| match err {
            WireError::InvalidName(_) => WireError::InvalidName(s.to_string()),
            other => other,
        })
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return f.write_str(".");
        }
        for label in &self.labels {
            write!(f, "{}.", label.escape_ascii())?;
        }
        Ok(())
    }
}

/// The (name, type, class) triple a query asks about. Also the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    pub name: Name,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: Name, qtype: u16, qclass: u16) -> Self {
        Self { name, qtype, qclass }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.name,
            RecordType::from(self.qtype),
            DNSClass::from(self.qclass)
        )
    }
}

/// A single resource record with opaque rdata.
///
/// `ttl` is the value received on the wire; the lifetime still left at a given
/// instant is derived from it and `created`, never written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: Name,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub created: Instant,
    pub data: Bytes,
}

impl ResourceRecord {
    pub fn new(
        name: Name,
        rtype: u16,
        rclass: u16,
        ttl: u32,
        data: Bytes,
        created: Instant,
    ) -> Self {
        Self {
            name,
            rtype,
            rclass,
            ttl,
            created,
            data,
        }
    }

    /// Whole seconds of lifetime left at `now`, floored, never below zero.
    pub fn remaining_ttl(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.created);
        Duration::from_secs(u64::from(self.ttl))
            .saturating_sub(elapsed)
            .as_secs() as u32
    }

    pub fn is_live(&self, now: Instant) -> bool {
        self.remaining_ttl(now) > 0
    }

    fn write_to(&self, buf: &mut BytesMut, now: Instant) -> Result<(), WireError> {
        let data_len = u16::try_from(self.data.len()).map_err(|_| WireError::Oversized {
            what: "record data",
            len: self.data.len(),
        })?;
        self.name.write_to(buf);
        buf.put_u16(self.rtype);
        buf.put_u16(self.rclass);
        buf.put_u32(self.remaining_ttl(now));
        buf.put_u16(data_len);
        buf.put_slice(&self.data);
        Ok(())
    }
}

/// The three record sections of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sections {
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Sections {
    pub fn iter(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.answers
            .iter()
            .chain(self.authority.iter())
            .chain(self.additional.iter())
    }

    pub fn len(&self) -> usize {
        self.answers.len() + self.authority.len() + self.additional.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True only if every record in every section is still live at `now`.
    pub fn all_live(&self, now: Instant) -> bool {
        self.iter().all(|rr| rr.is_live(now))
    }

    /// Appends each section of `other` to the matching section of `self`.
    pub fn extend_from(&mut self, other: &Sections) {
        self.answers.extend_from_slice(&other.answers);
        self.authority.extend_from_slice(&other.authority);
        self.additional.extend_from_slice(&other.additional);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Query,
    Response,
}

impl MessageKind {
    /// Standard-query opcode with RD and RA set, AA clear: the forwarder is
    /// never authoritative for what it relays.
    fn flags(self) -> u16 {
        let qr = match self {
            MessageKind::Query => 0,
            MessageKind::Response => FLAG_QR,
        };
        qr | FLAG_RD | FLAG_RA
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub kind: MessageKind,
    pub questions: Vec<Question>,
    pub sections: Sections,
}

impl Message {
    /// A single-question query with empty record sections.
    pub fn query(id: u16, question: Question) -> Self {
        Self {
            id,
            kind: MessageKind::Query,
            questions: vec![question],
            sections: Sections::default(),
        }
    }

    pub fn response(id: u16, questions: Vec<Question>, sections: Sections) -> Self {
        Self {
            id,
            kind: MessageKind::Response,
            questions,
            sections,
        }
    }

    /// Parses a full message. Records are stamped with `now` as their
    /// creation time.
    pub fn decode(packet: &[u8], now: Instant) -> Result<Self, WireError> {
        let mut reader = Reader::new(packet);
        let id = reader.u16()?;
        let flags = reader.u16()?;
        let qd_count = reader.u16()?;
        let an_count = reader.u16()?;
        let ns_count = reader.u16()?;
        let ar_count = reader.u16()?;

        let questions = (0..qd_count)
            .map(|_| reader.question())
            .collect::<Result<Vec<_>, _>>()?;
        let answers = reader.records(an_count, now)?;
        let authority = reader.records(ns_count, now)?;
        let additional = reader.records(ar_count, now)?;

        let kind = if flags & FLAG_QR != 0 {
            MessageKind::Response
        } else {
            MessageKind::Query
        };

        Ok(Self {
            id,
            kind,
            questions,
            sections: Sections {
                answers,
                authority,
                additional,
            },
        })
    }

    /// Serializes the message with uncompressed names, advertising each
    /// record's remaining TTL at `now`.
    pub fn encode(&self, now: Instant) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_u16(self.id);
        buf.put_u16(self.kind.flags());
        put_count(&mut buf, self.questions.len(), "question count")?;
        put_count(&mut buf, self.sections.answers.len(), "answer count")?;
        put_count(&mut buf, self.sections.authority.len(), "authority count")?;
        put_count(&mut buf, self.sections.additional.len(), "additional count")?;

        for question in &self.questions {
            question.name.write_to(&mut buf);
            buf.put_u16(question.qtype);
            buf.put_u16(question.qclass);
        }
        for record in self.sections.iter() {
            record.write_to(&mut buf, now)?;
        }
        Ok(buf.freeze())
    }
}

fn put_count(buf: &mut BytesMut, len: usize, what: &'static str) -> Result<(), WireError> {
    let count = u16::try_from(len).map_err(|_| WireError::Oversized { what, len })?;
    buf.put_u16(count);
    Ok(())
}

/// Bounds-checked cursor over one message. Compression pointers are always
/// resolved against the full `packet`.
struct Reader<'a> {
    packet: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(packet: &'a [u8]) -> Self {
        Self { packet, pos: 0 }
    }

    fn slice_at(&self, offset: usize, len: usize) -> Result<&'a [u8], WireError> {
        self.packet
            .get(offset..offset + len)
            .ok_or(WireError::Truncated {
                offset,
                needed: (offset + len).saturating_sub(self.packet.len()),
            })
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let bytes = self.slice_at(self.pos, len)?;
        self.pos += len;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn name(&mut self) -> Result<Name, WireError> {
        let start = self.pos;
        let mut cursor = self.pos;
        // Where the caller's stream continues once the first pointer is taken.
        let mut resume = None;
        let mut jumps = 0;
        let mut wire_len = 1;
        let mut labels = Vec::new();

        loop {
            let len = self.slice_at(cursor, 1)?[0];
            match len & 0xC0 {
                0x00 if len == 0 => {
                    cursor += 1;
                    break;
                }
                0x00 => {
                    let len = usize::from(len);
                    let label = self.slice_at(cursor + 1, len)?;
                    wire_len += len + 1;
                    if wire_len > MAX_NAME_LEN {
                        return Err(WireError::NameTooLong(wire_len));
                    }
                    labels.push(Bytes::copy_from_slice(label));
                    cursor += 1 + len;
                }
                0xC0 => {
                    let low = self.slice_at(cursor + 1, 1)?[0];
                    let target = (usize::from(len & 0x3F) << 8) | usize::from(low);
                    if target >= cursor {
                        return Err(WireError::BadPointer { at: cursor, target });
                    }
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(WireError::PointerLoop { start });
                    }
                    resume.get_or_insert(cursor + 2);
                    cursor = target;
                }
                _ => return Err(WireError::BadLabelType(len)),
            }
        }

        self.pos = resume.unwrap_or(cursor);
        Ok(Name { labels })
    }

    fn question(&mut self) -> Result<Question, WireError> {
        let name = self.name()?;
        let qtype = self.u16()?;
        let qclass = self.u16()?;
        Ok(Question::new(name, qtype, qclass))
    }

    fn record(&mut self, now: Instant) -> Result<ResourceRecord, WireError> {
        let name = self.name()?;
        let rtype = self.u16()?;
        let rclass = self.u16()?;
        let ttl = self.u32()?;
        let data_len = usize::from(self.u16()?);
        let data = Bytes::copy_from_slice(self.take(data_len)?);
        Ok(ResourceRecord::new(name, rtype, rclass, ttl, data, now))
    }

    fn records(&mut self, count: u16, now: Instant) -> Result<Vec<ResourceRecord>, WireError> {
        (0..count).map(|_| self.record(now)).collect()
    }
}
