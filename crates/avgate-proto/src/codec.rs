use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodeMode {
    #[default]
    Ascii,
    Hex,
}

/// Line terminator appended to a payload before it goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Suffix {
    #[default]
    None,
    Cr,
    Lf,
    CrLf,
}

impl Suffix {
    pub fn bytes(self) -> &'static [u8] {
        match self {
            Suffix::None => b"",
            Suffix::Cr => b"\r",
            Suffix::Lf => b"\n",
            Suffix::CrLf => b"\r\n",
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Suffix::None => "none",
            Suffix::Cr => "cr",
            Suffix::Lf => "lf",
            Suffix::CrLf => "crlf",
        }
    }

    /// Accepts the symbolic tags, the escaped forms the web UI stores (`\\r\\n`)
    /// and the literal control characters.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" => return Some(Suffix::None),
            "\\r" | "\r" => return Some(Suffix::Cr),
            "\\n" | "\n" => return Some(Suffix::Lf),
            "\\r\\n" | "\r\n" => return Some(Suffix::CrLf),
            _ => {}
        }
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Suffix::None),
            "cr" => Some(Suffix::Cr),
            "lf" => Some(Suffix::Lf),
            "crlf" => Some(Suffix::CrLf),
            _ => None,
        }
    }
}

impl Serialize for Suffix {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for Suffix {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Suffix::parse(&raw).ok_or_else(|| de::Error::custom(format!("unknown suffix {:?}", raw)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("hex payload has an odd number of digits")]
    OddLength,
    #[error("invalid hex digit {ch:?} at position {index}")]
    InvalidDigit { ch: char, index: usize },
}

impl From<hex::FromHexError> for EncodeError {
    fn from(e: hex::FromHexError) -> Self {
        match e {
            hex::FromHexError::InvalidHexCharacter { c, index } => EncodeError::InvalidDigit { ch: c, index },
            _ => EncodeError::OddLength,
        }
    }
}

/// Builds the wire bytes for a step or console send.
///
/// Ascii payloads go out verbatim. Hex payloads are read as digit pairs
/// (whitespace ignored). The suffix bytes are appended in both modes.
pub fn encode_payload(payload: &str, mode: EncodeMode, suffix: Suffix) -> Result<Vec<u8>, EncodeError> {
    let mut out = match mode {
        EncodeMode::Ascii => payload.as_bytes().to_vec(),
        EncodeMode::Hex => {
            let digits: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            hex::decode(digits)?
        }
    };
    out.extend_from_slice(suffix.bytes());
    Ok(out)
}

pub fn invert_bytes(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b = !*b;
    }
}

/// `48 65 6C` style rendering used by the line view.
pub fn render_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}

pub fn render_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| match b {
            0x20..=0x7E | b'\r' | b'\n' | b'\t' => b as char,
            _ => '.',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_payload_gets_suffix_bytes() {
        let out = encode_payload("48656C6C6F", EncodeMode::Hex, Suffix::CrLf).unwrap();
        assert_eq!(out, vec![0x48, 0x65, 0x6C, 0x6C, 0x6F, 0x0D, 0x0A]);
    }

    #[test]
    fn hex_payload_ignores_whitespace() {
        let out = encode_payload("01 02\t0a", EncodeMode::Hex, Suffix::None).unwrap();
        assert_eq!(out, vec![0x01, 0x02, 0x0A]);
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert_eq!(
            encode_payload("ZZ", EncodeMode::Hex, Suffix::None),
            Err(EncodeError::InvalidDigit { ch: 'Z', index: 0 })
        );
        assert_eq!(encode_payload("ABC", EncodeMode::Hex, Suffix::None), Err(EncodeError::OddLength));
    }

    #[test]
    fn ascii_payload_with_cr() {
        let out = encode_payload("PWR ON", EncodeMode::Ascii, Suffix::Cr).unwrap();
        assert_eq!(out, b"PWR ON\r");
    }

    #[test]
    fn suffix_accepts_every_spelling() {
        assert_eq!(Suffix::parse(""), Some(Suffix::None));
        assert_eq!(Suffix::parse("\\r\\n"), Some(Suffix::CrLf));
        assert_eq!(Suffix::parse("\r\n"), Some(Suffix::CrLf));
        assert_eq!(Suffix::parse("CRLF"), Some(Suffix::CrLf));
        assert_eq!(Suffix::parse("\\n"), Some(Suffix::Lf));
        assert_eq!(Suffix::parse("cr"), Some(Suffix::Cr));
        assert_eq!(Suffix::parse("tab"), None);
    }

    #[test]
    fn suffix_serde_uses_tags() {
        let s: Suffix = serde_json::from_str("\"\\\\r\\\\n\"").unwrap();
        assert_eq!(s, Suffix::CrLf);
        assert_eq!(serde_json::to_string(&Suffix::Lf).unwrap(), "\"lf\"");
        assert!(serde_json::from_str::<Suffix>("\"semicolon\"").is_err());
    }

    #[test]
    fn renderings() {
        assert_eq!(render_hex(&[0x48, 0x0D, 0xFF]), "48 0D FF");
        assert_eq!(render_ascii(&[b'O', b'K', 0x00, b'\r']), "OK.\r");
        assert_eq!(render_hex(&[]), "");
    }

    #[test]
    fn invert_is_an_involution() {
        let mut buf = *b"ESP";
        invert_bytes(&mut buf);
        assert_eq!(buf, [!b'E', !b'S', !b'P']);
        invert_bytes(&mut buf);
        assert_eq!(&buf, b"ESP");
    }
}
