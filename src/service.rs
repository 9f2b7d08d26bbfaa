//! §3.1 Service: the user-supplied registration record, plus the
//! validation rules it must satisfy before it's accepted by the registry.

use crate::error::{Error, Result};
use crate::name::MAX_LABEL_LEN;

/// A service-type proto, either `_tcp` or `_udp` (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    fn label(self) -> &'static str {
        match self {
            Proto::Tcp => "_tcp",
            Proto::Udp => "_udp",
        }
    }
}

/// A user-supplied service registration. All fields are immutable after
/// registration except `txt` (§3.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub instance_name: String,
    pub service_type: String,
    pub hostname: String,
    pub port: u16,
    pub txt: Vec<(String, String)>,
}

impl Service {
    /// Builds and validates a service. `hostname` defaults to the system
    /// hostname (suffixed `.local`) when `None`.
    pub fn new(
        instance_name: impl Into<String>,
        service_type: impl Into<String>,
        hostname: Option<String>,
        port: u16,
        txt: Vec<(String, String)>,
    ) -> Result<Service> {
        let instance_name = instance_name.into();
        let service_type = service_type.into();
        let hostname = hostname.unwrap_or_else(default_hostname);

        validate_instance_name(&instance_name)?;
        validate_service_type(&service_type)?;
        validate_port(port)?;
        validate_txt(&txt)?;

        Ok(Service {
            instance_name,
            service_type,
            hostname,
            port,
            txt,
        })
    }

    /// `fullName = instanceName + "." + serviceType` (§3.1). Never DNS
    /// label-encoded here — that's `name::CompressionMap`'s job.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.instance_name, self.service_type)
    }

    /// Applies the §4.4 conflict-rename rule: `"X"` → `"X-2"` → `"X-3"` …
    pub fn renamed(&self, attempt: u8) -> Service {
        let base = self
            .instance_name
            .rsplit_once('-')
            .filter(|(_, suffix)| suffix.parse::<u8>().is_ok())
            .map(|(base, _)| base)
            .unwrap_or(&self.instance_name);
        Service {
            instance_name: format!("{base}-{attempt}"),
            ..self.clone()
        }
    }
}

pub fn default_hostname() -> String {
    gethostname::gethostname()
        .to_string_lossy()
        .trim_end_matches(".local")
        .to_string()
        + ".local"
}

fn validate_instance_name(name: &str) -> Result<()> {
    let len = name.len();
    if len == 0 || len > MAX_LABEL_LEN {
        return Err(Error::Validation(format!(
            "instanceName must be 1..{MAX_LABEL_LEN} bytes, got {len}"
        )));
    }
    Ok(())
}

/// `_service._proto.local` where `_proto` is `_tcp`/`_udp` and `_service`
/// matches `[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?` (§3.1).
fn validate_service_type(service_type: &str) -> Result<()> {
    let rest = service_type
        .strip_suffix(".local")
        .ok_or_else(|| Error::Validation(format!("{service_type:?} must end in .local")))?;

    let (service, proto) = rest
        .rsplit_once('.')
        .ok_or_else(|| Error::Validation(format!("{service_type:?} missing _proto segment")))?;

    let proto = match proto {
        "_tcp" => Proto::Tcp,
        "_udp" => Proto::Udp,
        other => {
            return Err(Error::Validation(format!(
                "proto must be _tcp or _udp, got {other:?}"
            )))
        }
    };
    let _ = proto.label();

    let service = service
        .strip_prefix('_')
        .ok_or_else(|| Error::Validation(format!("{service:?} must start with an underscore")))?;

    if service.is_empty() {
        return Err(Error::Validation("empty service label".into()));
    }
    let bytes = service.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() {
        return Err(Error::Validation(format!(
            "service label {service:?} must start with a letter or digit"
        )));
    }
    if bytes.len() > 1 && !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return Err(Error::Validation(format!(
            "service label {service:?} must end with a letter or digit"
        )));
    }
    for &b in bytes {
        if !(b.is_ascii_alphanumeric() || b == b'-') {
            return Err(Error::Validation(format!(
                "service label {service:?} contains invalid byte {b:#x}"
            )));
        }
    }
    Ok(())
}

fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(Error::Validation("port must be 1..65535".into()));
    }
    Ok(())
}

fn validate_txt(txt: &[(String, String)]) -> Result<()> {
    for (key, value) in txt {
        let label_len = key.len() + 1 + value.len();
        if label_len > 255 {
            return Err(Error::Validation(format!(
                "TXT entry {key}={value} exceeds 255 bytes"
            )));
        }
    }
    Ok(())
}

/// Encodes `txt` as RFC 6763 §6 length-prefixed `key=value` strings; an
/// empty map encodes as the single byte `0x00`.
pub fn encode_txt(txt: &[(String, String)]) -> Vec<u8> {
    if txt.is_empty() {
        return vec![0u8];
    }
    let mut out = Vec::new();
    for (key, value) in txt {
        let entry = format!("{key}={value}");
        out.push(entry.len() as u8);
        out.extend_from_slice(entry.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_well_formed_service() {
        let svc = Service::new(
            "MyPrinter",
            "_http._tcp.local",
            Some("dev.local".into()),
            8080,
            vec![("version".into(), "1.0".into())],
        )
        .unwrap();
        assert_eq!(svc.full_name(), "MyPrinter._http._tcp.local");
    }

    #[test]
    fn rejects_bad_proto() {
        assert!(Service::new("X", "_http._foo.local", None, 80, vec![]).is_err());
    }

    #[test]
    fn rejects_hyphen_boundary_service_label() {
        assert!(Service::new("X", "_-http._tcp.local", None, 80, vec![]).is_err());
    }

    #[test]
    fn rejects_zero_port() {
        assert!(Service::new("X", "_http._tcp.local", None, 0, vec![]).is_err());
    }

    #[test]
    fn rename_suffixes_deterministically() {
        let svc = Service::new("MyPrinter", "_http._tcp.local", None, 80, vec![]).unwrap();
        let renamed = svc.renamed(2);
        assert_eq!(renamed.instance_name, "MyPrinter-2");
        let renamed_again = renamed.renamed(3);
        assert_eq!(renamed_again.instance_name, "MyPrinter-3");
    }

    #[test]
    fn empty_txt_encodes_as_single_zero_byte() {
        assert_eq!(encode_txt(&[]), vec![0u8]);
    }
}
