//! C1: DNS name codec — RFC 1035 §3.1 label rules, §4.1.4 compression,
//! and RFC 6763 §4.1 service-instance labels.

use std::collections::HashMap;

use crate::error::{Error, Result};

pub const MAX_LABEL_LEN: usize = 63;
pub const MAX_NAME_LEN: usize = 255;

const POINTER_TAG: u8 = 0b1100_0000;
const POINTER_MAX_OFFSET: u16 = 0x3FFF;

/// Splits a presentation-format name into labels, dropping a trailing dot.
fn labels_of(name: &str) -> Vec<&str> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        Vec::new()
    } else {
        name.split('.').collect()
    }
}

fn validate_label(label: &str, arbitrary_utf8: bool) -> Result<()> {
    let bytes = label.as_bytes();
    if bytes.is_empty() {
        return Err(Error::WireFormat("empty label".into()));
    }
    if bytes.len() > MAX_LABEL_LEN {
        return Err(Error::WireFormat(format!(
            "label {label:?} exceeds {MAX_LABEL_LEN} bytes"
        )));
    }
    if arbitrary_utf8 {
        // RFC 6763 §4.1: the service-instance label may hold any UTF-8.
        return Ok(());
    }
    if bytes.first() == Some(&b'-') || bytes.last() == Some(&b'-') {
        return Err(Error::WireFormat(format!(
            "label {label:?} starts or ends with a hyphen"
        )));
    }
    for &b in bytes {
        if !(b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.') {
            return Err(Error::WireFormat(format!(
                "label {label:?} contains invalid byte {b:#x}"
            )));
        }
    }
    Ok(())
}

/// Validates that `name` would round-trip within the RFC 1035 limits.
pub fn validate_name(name: &str) -> Result<()> {
    let labels = labels_of(name);
    let mut total = 1usize; // root terminator
    for label in &labels {
        validate_label(label, false)?;
        total += label.len() + 1;
    }
    if total > MAX_NAME_LEN {
        return Err(Error::WireFormat(format!(
            "name {name:?} exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

/// Tracks which name suffixes have already been written into a message
/// buffer so subsequent names can point back at them instead of repeating
/// them (RFC 1035 §4.1.4).
#[derive(Default)]
pub struct CompressionMap {
    offsets: HashMap<String, u16>,
}

impl CompressionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `name` into `out`, compressing against any suffix already
    /// written through this map, and recording every new suffix it writes.
    pub fn write_name(&mut self, out: &mut Vec<u8>, name: &str) -> Result<()> {
        validate_name(name)?;
        self.write_labels(out, &labels_of(name))
    }

    /// RFC 6763 §4.1: prepends a single arbitrary-UTF-8 instance label
    /// ahead of an ordinary service-type name; the service-type suffix can
    /// still compress against anything written earlier.
    pub fn write_service_instance(
        &mut self,
        out: &mut Vec<u8>,
        instance: &str,
        service_type: &str,
    ) -> Result<()> {
        validate_label(instance, true)?;
        validate_name(service_type)?;
        let mut labels = vec![instance];
        labels.extend(labels_of(service_type));
        self.write_labels(out, &labels)
    }

    fn write_labels(&mut self, out: &mut Vec<u8>, labels: &[&str]) -> Result<()> {
        for i in 0..labels.len() {
            let suffix = labels[i..].join(".");
            if let Some(&ptr) = self.offsets.get(&suffix) {
                out.push(POINTER_TAG | ((ptr >> 8) as u8));
                out.push((ptr & 0xFF) as u8);
                return Ok(());
            }
            if out.len() <= POINTER_MAX_OFFSET as usize {
                self.offsets.insert(suffix, out.len() as u16);
            }
            let label = labels[i];
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        Ok(())
    }
}

/// Encodes `name` with no compression context of its own (a fresh
/// `CompressionMap` per call) — used for one-off encodings such as a
/// record-set fingerprint.
pub fn encode_name(name: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    CompressionMap::new().write_name(&mut out, name)?;
    Ok(out)
}

/// Decodes a name starting at `offset` in `buf`.
///
/// Returns the name in presentation format (dot-separated labels, UTF-8
/// lossily recovered) and the offset just past the *first* unwound label
/// sequence — i.e. not past any pointer jump, matching RFC 1035 §4.1.4's
/// requirement that the containing record's next field starts right after
/// the pointer, not after the pointed-to data.
pub fn decode_name(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut next_offset: Option<usize> = None;
    let mut total_len = 0usize;

    loop {
        let len = *buf
            .get(pos)
            .ok_or_else(|| Error::WireFormat("name truncated".into()))?;

        if len == 0 {
            next_offset.get_or_insert(pos + 1);
            break;
        }

        if len & POINTER_TAG == POINTER_TAG {
            let hi = (len & !POINTER_TAG) as usize;
            let lo = *buf
                .get(pos + 1)
                .ok_or_else(|| Error::WireFormat("truncated compression pointer".into()))?
                as usize;
            let target = (hi << 8) | lo;
            next_offset.get_or_insert(pos + 2);
            if target >= pos {
                return Err(Error::WireFormat(
                    "compression pointer does not point strictly backwards".into(),
                ));
            }
            pos = target;
            continue;
        }

        if len & POINTER_TAG != 0 {
            return Err(Error::WireFormat("reserved label-length bits set".into()));
        }

        let len = len as usize;
        if len > MAX_LABEL_LEN {
            return Err(Error::WireFormat(format!(
                "label exceeds {MAX_LABEL_LEN} bytes"
            )));
        }
        let start = pos + 1;
        let end = start + len;
        let label_bytes = buf
            .get(start..end)
            .ok_or_else(|| Error::WireFormat("label truncated".into()))?;

        total_len += len + 1;
        if total_len > MAX_NAME_LEN {
            return Err(Error::WireFormat(format!(
                "decoded name exceeds {MAX_NAME_LEN} bytes"
            )));
        }

        labels.push(String::from_utf8_lossy(label_bytes).into_owned());
        pos = end;
    }

    Ok((labels.join("."), next_offset.unwrap_or(pos)))
}
