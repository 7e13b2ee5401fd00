use std::fmt;

use crate::codec::primitives::{decode_uint, encode_uint};

/// How often an option may appear in one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    None,
    Once,
    Many,
}

/// Which side of an exchange a message is on. Multiplicity rules differ per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Request,
    Response,
}

/// Value format of an option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Empty,
    Opaque,
    Uint,
    String,
}

/// Definition of one known option kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionDef {
    pub kind: OptionKind,
    pub number: u16,
    pub name: &'static str,
    pub request: Multiplicity,
    pub response: Multiplicity,
    pub value: ValueKind,
    pub min_len: usize,
    pub max_len: usize,
}

macro_rules! option_table {
    ($($kind:ident = $no:literal, $name:literal, $req:ident, $resp:ident, $value:ident, $min:literal..=$max:literal;)*) => {
        /// Option kinds of the legacy draft numbering
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum OptionKind {
            $($kind,)*
            /// Reserved delta-bounding numbers (multiples of 14 not otherwise assigned)
            Fencepost,
        }

        const OPTION_TABLE: &[OptionDef] = &[
            $(OptionDef {
                kind: OptionKind::$kind,
                number: $no,
                name: $name,
                request: Multiplicity::$req,
                response: Multiplicity::$resp,
                value: ValueKind::$value,
                min_len: $min,
                max_len: $max,
            },)*
        ];
    };
}

option_table! {
    ContentType = 1, "Content-Type", Once, Once, Uint, 0..=2;
    MaxAge = 2, "Max-Age", Once, Once, Uint, 0..=4;
    ProxyUri = 3, "Proxy-Uri", Many, None, String, 1..=270;
    ETag = 4, "ETag", Many, Once, Opaque, 1..=8;
    UriHost = 5, "Uri-Host", Once, None, String, 1..=270;
    LocationPath = 6, "Location-Path", None, Many, String, 0..=270;
    UriPort = 7, "Uri-Port", Once, None, Uint, 0..=2;
    LocationQuery = 8, "Location-Query", None, Many, String, 0..=270;
    UriPath = 9, "Uri-Path", Many, None, String, 0..=270;
    Observe = 10, "Observe", Once, Once, Uint, 0..=3;
    Token = 11, "Token", Once, Once, Opaque, 1..=8;
    Accept = 12, "Accept", Many, None, Uint, 0..=2;
    IfMatch = 13, "If-Match", Many, None, Opaque, 0..=8;
    MaxOfe = 14, "Max-Ofe", None, Once, Uint, 0..=4;
    UriQuery = 15, "Uri-Query", Many, None, String, 0..=270;
    Block2 = 17, "Block2", Once, Once, Uint, 0..=3;
    Block1 = 19, "Block1", Once, Once, Uint, 0..=3;
    IfNoneMatch = 21, "If-None-Match", Once, None, Empty, 0..=0;
}

const FENCEPOST_DEF: OptionDef = OptionDef {
    kind: OptionKind::Fencepost,
    number: 28,
    name: "Fencepost",
    request: Multiplicity::None,
    response: Multiplicity::None,
    value: ValueKind::Empty,
    min_len: 0,
    max_len: 0,
};

impl OptionKind {
    pub fn from_number(number: u16) -> Option<OptionKind> {
        if let Some(def) = OPTION_TABLE.iter().find(|d| d.number == number) {
            return Some(def.kind);
        }
        if number != 0 && number % 14 == 0 {
            return Some(OptionKind::Fencepost);
        }
        None
    }

    pub fn def(&self) -> &'static OptionDef {
        OPTION_TABLE
            .iter()
            .find(|d| d.kind == *self)
            .unwrap_or(&FENCEPOST_DEF)
    }

    /// Canonical number. Fencepost reports the first free multiple of 14.
    pub fn number(&self) -> u16 {
        self.def().number
    }

    pub fn name(&self) -> &'static str {
        self.def().name
    }

    pub fn multiplicity(&self, role: Role) -> Multiplicity {
        match role {
            Role::Request => self.def().request,
            Role::Response => self.def().response,
        }
    }

    /// Per-kind value check on top of the length bounds
    pub fn validate(&self, value: &[u8]) -> bool {
        let def = self.def();
        if value.len() < def.min_len || value.len() > def.max_len {
            return false;
        }
        match self {
            OptionKind::UriPath => !value.contains(&b'/'),
            _ if def.value == ValueKind::String => std::str::from_utf8(value).is_ok(),
            _ => true,
        }
    }
}

/// Critical options are the odd-numbered ones
pub fn is_critical(number: u16) -> bool {
    number % 2 == 1
}

/// One option instance as carried in a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

impl CoapOption {
    pub fn new(number: u16, value: Vec<u8>) -> Self {
        CoapOption { number, value }
    }

    pub fn empty(kind: OptionKind) -> Self {
        CoapOption::new(kind.number(), Vec::new())
    }

    pub fn opaque(kind: OptionKind, value: &[u8]) -> Self {
        CoapOption::new(kind.number(), value.to_vec())
    }

    pub fn string(kind: OptionKind, value: &str) -> Self {
        CoapOption::new(kind.number(), value.as_bytes().to_vec())
    }

    pub fn uint(kind: OptionKind, value: u32) -> Self {
        CoapOption::new(kind.number(), encode_uint(value))
    }

    pub fn kind(&self) -> Option<OptionKind> {
        OptionKind::from_number(self.number)
    }

    /// Name from the option table, `"Unknown"` otherwise
    pub fn name(&self) -> &'static str {
        self.kind().map(|k| k.name()).unwrap_or("Unknown")
    }

    pub fn is_critical(&self) -> bool {
        is_critical(self.number)
    }

    pub fn as_uint(&self) -> u32 {
        decode_uint(&self.value)
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

impl fmt::Display for CoapOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value_kind = self.kind().map(|k| k.def().value).unwrap_or(ValueKind::Opaque);
        match value_kind {
            ValueKind::Empty => write!(f, "{}", self.name()),
            ValueKind::Uint => write!(f, "{}: {}", self.name(), self.as_uint()),
            ValueKind::String => write!(f, "{}: \"{}\"", self.name(), String::from_utf8_lossy(&self.value)),
            ValueKind::Opaque => {
                write!(f, "{}: 0x", self.name())?;
                for b in &self.value {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_number() {
        assert_eq!(OptionKind::from_number(11), Some(OptionKind::Token));
        assert_eq!(OptionKind::from_number(14), Some(OptionKind::MaxOfe));
        assert_eq!(OptionKind::from_number(28), Some(OptionKind::Fencepost));
        assert_eq!(OptionKind::from_number(42), Some(OptionKind::Fencepost));
        assert_eq!(OptionKind::from_number(23), None);
        assert_eq!(OptionKind::UriPath.name(), "Uri-Path");
    }

    #[test]
    fn test_critical_is_odd() {
        assert!(is_critical(OptionKind::UriHost.number()));
        assert!(!is_critical(OptionKind::ETag.number()));
        assert!(CoapOption::empty(OptionKind::IfNoneMatch).is_critical());
    }

    #[test]
    fn test_multiplicity_by_role() {
        assert_eq!(OptionKind::ETag.multiplicity(Role::Request), Multiplicity::Many);
        assert_eq!(OptionKind::ETag.multiplicity(Role::Response), Multiplicity::Once);
        assert_eq!(OptionKind::MaxOfe.multiplicity(Role::Request), Multiplicity::None);
        assert_eq!(OptionKind::MaxOfe.multiplicity(Role::Response), Multiplicity::Once);
    }

    #[test]
    fn test_uri_path_validator_rejects_slash() {
        assert!(OptionKind::UriPath.validate(b"sensors"));
        assert!(!OptionKind::UriPath.validate(b"a/b"));
        assert!(!OptionKind::Token.validate(&[0u8; 9]));
    }

    #[test]
    fn test_display() {
        assert_eq!(CoapOption::uint(OptionKind::UriPort, 5683).to_string(), "Uri-Port: 5683");
        assert_eq!(CoapOption::string(OptionKind::UriHost, "a").to_string(), "Uri-Host: \"a\"");
        assert_eq!(CoapOption::opaque(OptionKind::ETag, &[0xab]).to_string(), "ETag: 0xab");
    }
}
