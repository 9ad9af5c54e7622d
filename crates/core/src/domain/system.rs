// System identification (uname)

use serde::{Deserialize, Serialize};

/// `struct utsname`, decoded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtsName {
    pub sysname: String,
    pub nodename: String,
    pub release: String,
    pub version: String,
    pub machine: String,
    pub domainname: String,
}

impl UtsName {
    /// Field name / value pairs in `struct utsname` order
    pub fn fields(&self) -> [(&'static str, &str); 6] {
        [
            ("sysname", &self.sysname),
            ("nodename", &self.nodename),
            ("release", &self.release),
            ("version", &self.version),
            ("machine", &self.machine),
            ("domainname", &self.domainname),
        ]
    }
}

/// Decode a fixed-size, NUL-padded utsname field
pub fn decode_field(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_field() {
        let mut raw = [0u8; 65];
        raw[..5].copy_from_slice(b"Linux");
        assert_eq!(decode_field(&raw), "Linux");
        assert_eq!(decode_field(b"unterminated"), "unterminated");
        assert_eq!(decode_field(&[0u8; 4]), "");
    }
}
