//! C2: DNS message codec — 12-byte header, question section, and the
//! answer/authority/additional resource-record sections, with the mDNS
//! cache-flush and QU bit conventions (RFC 6762 §10.2, §18.12).

use packed_struct::prelude::*;

use crate::error::{Error, Result};
use crate::name::{decode_name, CompressionMap};

/// Class field, high bit stripped. mDNS only ever speaks `IN`.
pub const CLASS_IN: u16 = 1;
const CLASS_FLUSH_BIT: u16 = 0x8000;
const CLASS_QU_BIT: u16 = 0x8000;
const CLASS_MASK: u16 = 0x7FFF;

/// Maximum message size this codec will serialize to (§4.2, §6.1).
pub const MAX_MESSAGE_BYTES: usize = 9000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PrimitiveEnum_u8)]
pub enum PacketType {
    Query = 0,
    Answer = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PrimitiveEnum_u8)]
pub enum OpCode {
    Query = 0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PrimitiveEnum_u8)]
pub enum Rcode {
    NoError = 0,
}

/// The 12-byte DNS header. Ref RFC 1035 §4.1.1.
#[derive(Debug, PackedStruct, PartialEq, Eq, Clone, Copy)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct Header {
    #[packed_field(bits = "0..=15", endian = "msb")]
    pub id: u16,
    #[packed_field(bits = "16", ty = "enum")]
    pub qr: PacketType,
    #[packed_field(bits = "17..=20", ty = "enum")]
    pub opcode: OpCode,
    #[packed_field(bits = "21")]
    pub authoritative: bool,
    #[packed_field(bits = "22")]
    pub truncated: bool,
    #[packed_field(bits = "23")]
    pub recursion_desired: bool,
    #[packed_field(bits = "24")]
    pub recursion_available: bool,
    #[packed_field(bits = "25")]
    pub z: bool,
    #[packed_field(bits = "26")]
    pub ad: bool,
    #[packed_field(bits = "27")]
    pub cd: bool,
    #[packed_field(bits = "28..=31", ty = "enum")]
    pub rcode: Rcode,
    #[packed_field(bits = "32..=47", endian = "msb")]
    pub qdcount: u16,
    #[packed_field(bits = "48..=63", endian = "msb")]
    pub ancount: u16,
    #[packed_field(bits = "64..=79", endian = "msb")]
    pub nscount: u16,
    #[packed_field(bits = "80..=95", endian = "msb")]
    pub arcount: u16,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            id: 0,
            qr: PacketType::Query,
            opcode: OpCode::Query,
            authoritative: false,
            truncated: false,
            recursion_desired: false,
            recursion_available: false,
            z: false,
            ad: false,
            cd: false,
            rcode: Rcode::NoError,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }
}

impl Header {
    /// A response header per §4.2's responder-side conventions: `QR=1`,
    /// `AA=1`, `id=0` (mDNS ignores it), `RD=RA=0`, `RCODE=0`.
    pub fn response() -> Header {
        Header {
            qr: PacketType::Answer,
            authoritative: true,
            ..Header::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ptr,
    Srv,
    Txt,
    Any,
    Other(u16),
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ptr => 12,
            RecordType::Txt => 16,
            RecordType::Srv => 33,
            RecordType::Any => 255,
            RecordType::Other(code) => code,
        }
    }
}

impl From<u16> for RecordType {
    fn from(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            12 => RecordType::Ptr,
            16 => RecordType::Txt,
            33 => RecordType::Srv,
            255 => RecordType::Any,
            other => RecordType::Other(other),
        }
    }
}

/// A parsed question. `qu` is the high bit of `qclass`, requesting a
/// unicast reply (§5.4, §6.2's QU/QM convention).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub qname: String,
    pub qtype: RecordType,
    pub qu: bool,
}

/// RDATA, decoded to the four types this responder ever emits, plus a
/// catch-all for anything it needs to echo back as a known answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A([u8; 4]),
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(Vec<u8>),
    Other(Vec<u8>),
}

/// A single resource record, as it appears in an answer, authority, or
/// additional section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
    pub cache_flush: bool,
    pub ttl: u32,
    pub rdata: RData,
}

/// A full DNS message: header plus the four sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Message {
    pub fn parse(buf: &[u8]) -> Result<Message> {
        if buf.len() < 12 {
            return Err(Error::WireFormat("message shorter than a header".into()));
        }
        let mut header_bytes = [0u8; 12];
        header_bytes.copy_from_slice(&buf[..12]);
        let header = Header::unpack(&header_bytes)
            .map_err(|e| Error::WireFormat(format!("bad header: {e}")))?;

        let mut pos = 12usize;
        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            let (q, next) = parse_question(buf, pos)?;
            questions.push(q);
            pos = next;
        }

        let mut answers = Vec::with_capacity(header.ancount as usize);
        for _ in 0..header.ancount {
            let (rr, next) = parse_rr(buf, pos)?;
            answers.push(rr);
            pos = next;
        }

        let mut authorities = Vec::with_capacity(header.nscount as usize);
        for _ in 0..header.nscount {
            let (rr, next) = parse_rr(buf, pos)?;
            authorities.push(rr);
            pos = next;
        }

        let mut additionals = Vec::with_capacity(header.arcount as usize);
        for _ in 0..header.arcount {
            let (rr, next) = parse_rr(buf, pos)?;
            additionals.push(rr);
            pos = next;
        }

        Ok(Message {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Serializes the message, compressing names against a single shared
    /// map, and applying §4.2's truncation policy if the result would
    /// exceed [`MAX_MESSAGE_BYTES`]: additionals are dropped in reverse
    /// order first; `TC=1` is only set if the answer section alone still
    /// doesn't fit.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut additionals = self.additionals.clone();
        loop {
            let attempt = self.try_serialize(&additionals)?;
            if attempt.len() <= MAX_MESSAGE_BYTES || additionals.is_empty() {
                return Ok(attempt);
            }
            additionals.pop();
        }
    }

    fn try_serialize(&self, additionals: &[ResourceRecord]) -> Result<Vec<u8>> {
        let mut header = self.header;
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = additionals.len() as u16;
        header.truncated = false;

        let mut out = header
            .pack()
            .map_err(|e| Error::WireFormat(format!("header pack failed: {e}")))?
            .to_vec();

        let mut map = CompressionMap::new();
        for q in &self.questions {
            map.write_name(&mut out, &q.qname)?;
            out.extend_from_slice(&q.qtype.code().to_be_bytes());
            let class = if q.qu {
                CLASS_IN | CLASS_QU_BIT
            } else {
                CLASS_IN
            };
            out.extend_from_slice(&class.to_be_bytes());
        }
        for rr in &self.answers {
            write_rr(&mut out, &mut map, rr)?;
        }
        for rr in &self.authorities {
            write_rr(&mut out, &mut map, rr)?;
        }
        for rr in additionals {
            write_rr(&mut out, &mut map, rr)?;
        }

        if out.len() > MAX_MESSAGE_BYTES && additionals.is_empty() {
            // even the mandatory sections don't fit; signal truncation
            // rather than silently sending an oversized packet.
            let mut header = header;
            header.truncated = true;
            out[..12].copy_from_slice(
                &header
                    .pack()
                    .map_err(|e| Error::WireFormat(format!("header pack failed: {e}")))?,
            );
        }
        Ok(out)
    }
}

fn parse_question(buf: &[u8], pos: usize) -> Result<(Question, usize)> {
    let (qname, pos) = decode_name(buf, pos)?;
    let qtype = read_u16(buf, pos)?;
    let qclass = read_u16(buf, pos + 2)?;
    Ok((
        Question {
            qname,
            qtype: RecordType::from(qtype),
            qu: qclass & CLASS_QU_BIT != 0,
        },
        pos + 4,
    ))
}

fn parse_rr(buf: &[u8], pos: usize) -> Result<(ResourceRecord, usize)> {
    let (name, pos) = decode_name(buf, pos)?;
    let rtype = RecordType::from(read_u16(buf, pos)?);
    let raw_class = read_u16(buf, pos + 2)?;
    let ttl = read_u32(buf, pos + 4)?;
    let rdlength = read_u16(buf, pos + 8)? as usize;
    let rdata_start = pos + 10;
    let rdata_end = rdata_start
        .checked_add(rdlength)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| Error::WireFormat("rdata runs past end of message".into()))?;

    let rdata = parse_rdata(buf, rtype, rdata_start, rdata_end)?;

    Ok((
        ResourceRecord {
            name,
            rtype,
            class: raw_class & CLASS_MASK,
            cache_flush: raw_class & CLASS_FLUSH_BIT != 0,
            ttl,
            rdata,
        },
        rdata_end,
    ))
}

fn parse_rdata(buf: &[u8], rtype: RecordType, start: usize, end: usize) -> Result<RData> {
    match rtype {
        RecordType::A => {
            let bytes = buf
                .get(start..end)
                .ok_or_else(|| Error::WireFormat("truncated A rdata".into()))?;
            if bytes.len() != 4 {
                return Err(Error::WireFormat("A rdata is not 4 bytes".into()));
            }
            Ok(RData::A([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        RecordType::Ptr => {
            let (name, _) = decode_name(buf, start)?;
            Ok(RData::Ptr(name))
        }
        RecordType::Srv => {
            let priority = read_u16(buf, start)?;
            let weight = read_u16(buf, start + 2)?;
            let port = read_u16(buf, start + 4)?;
            let (target, _) = decode_name(buf, start + 6)?;
            Ok(RData::Srv {
                priority,
                weight,
                port,
                target,
            })
        }
        RecordType::Txt => {
            let bytes = buf
                .get(start..end)
                .ok_or_else(|| Error::WireFormat("truncated TXT rdata".into()))?;
            Ok(RData::Txt(bytes.to_vec()))
        }
        _ => {
            let bytes = buf
                .get(start..end)
                .ok_or_else(|| Error::WireFormat("truncated rdata".into()))?;
            Ok(RData::Other(bytes.to_vec()))
        }
    }
}

fn write_rr(out: &mut Vec<u8>, map: &mut CompressionMap, rr: &ResourceRecord) -> Result<()> {
    map.write_name(out, &rr.name)?;
    out.extend_from_slice(&rr.rtype.code().to_be_bytes());
    let class = if rr.cache_flush {
        rr.class | CLASS_FLUSH_BIT
    } else {
        rr.class
    };
    out.extend_from_slice(&class.to_be_bytes());
    out.extend_from_slice(&rr.ttl.to_be_bytes());

    // rdlength is filled in after the rdata is written, since SRV/PTR
    // rdata may itself compress against names already in `out`.
    let rdlength_pos = out.len();
    out.extend_from_slice(&[0u8, 0u8]);
    let rdata_start = out.len();

    match &rr.rdata {
        RData::A(octets) => out.extend_from_slice(octets),
        RData::Ptr(name) => map.write_name(out, name)?,
        RData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            out.extend_from_slice(&priority.to_be_bytes());
            out.extend_from_slice(&weight.to_be_bytes());
            out.extend_from_slice(&port.to_be_bytes());
            map.write_name(out, target)?;
        }
        RData::Txt(bytes) => out.extend_from_slice(bytes),
        RData::Other(bytes) => out.extend_from_slice(bytes),
    }

    let rdlength = (out.len() - rdata_start) as u16;
    out[rdlength_pos..rdlength_pos + 2].copy_from_slice(&rdlength.to_be_bytes());
    Ok(())
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    let bytes = buf
        .get(pos..pos + 2)
        .ok_or_else(|| Error::WireFormat("message truncated reading u16".into()))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    let bytes = buf
        .get(pos..pos + 4)
        .ok_or_else(|| Error::WireFormat("message truncated reading u32".into()))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
