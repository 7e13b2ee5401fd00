use std::fmt;

/// Request method carried in codes 1..=4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
}

impl Method {
    pub fn from_code(code: u8) -> Option<Method> {
        match code {
            1 => Some(Method::Get),
            2 => Some(Method::Post),
            3 => Some(Method::Put),
            4 => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

macro_rules! response_codes {
    ($($name:ident = $value:literal, $text:literal;)*) => {
        /// Closed set of response codes understood by the gateway
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum ResponseCode {
            $($name = $value,)*
        }

        impl ResponseCode {
            pub fn from_code(code: u8) -> Option<ResponseCode> {
                match code {
                    $($value => Some(ResponseCode::$name),)*
                    _ => None,
                }
            }

            /// `"c.dd Text"`, e.g. `"4.04 Not Found"`
            pub fn description(&self) -> &'static str {
                match self {
                    $(ResponseCode::$name => $text,)*
                }
            }
        }
    };
}

response_codes! {
    Created = 65, "2.01 Created";
    Deleted = 66, "2.02 Deleted";
    Valid = 67, "2.03 Valid";
    Changed = 68, "2.04 Changed";
    Content = 69, "2.05 Content";
    BadRequest = 128, "4.00 Bad Request";
    Unauthorized = 129, "4.01 Unauthorized";
    BadOption = 130, "4.02 Bad Option";
    Forbidden = 131, "4.03 Forbidden";
    NotFound = 132, "4.04 Not Found";
    MethodNotAllowed = 133, "4.05 Method Not Allowed";
    NotAcceptable = 134, "4.06 Not Acceptable";
    RequestEntityIncomplete = 136, "4.08 Request Entity Incomplete";
    PreconditionFailed = 140, "4.12 Precondition Failed";
    RequestEntityTooLarge = 141, "4.13 Request Entity Too Large";
    UnsupportedMediaType = 143, "4.15 Unsupported Media Type";
    InternalServerError = 160, "5.00 Internal Server Error";
    NotImplemented = 161, "5.01 Not Implemented";
    BadGateway = 162, "5.02 Bad Gateway";
    ServiceUnavailable = 163, "5.03 Service Unavailable";
    GatewayTimeout = 164, "5.04 Gateway Timeout";
    ProxyingNotSupported = 165, "5.05 Proxying Not Supported";
}

impl ResponseCode {
    /// Class digit (2, 4 or 5)
    pub fn class(&self) -> u8 {
        (*self as u8) >> 5
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }
}

/// Decoded code byte. Code 0 is always a response (empty / ack-only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Empty,
    Request(Method),
    Response(ResponseCode),
}

impl Code {
    pub fn from_u8(code: u8) -> Option<Code> {
        if code == 0 {
            return Some(Code::Empty);
        }
        if let Some(method) = Method::from_code(code) {
            return Some(Code::Request(method));
        }
        ResponseCode::from_code(code).map(Code::Response)
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Code::Empty => 0,
            Code::Request(m) => *m as u8,
            Code::Response(r) => *r as u8,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Code::Request(_))
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Empty => write!(f, "0.00 Empty"),
            Code::Request(m) => write!(f, "{}", m.as_str()),
            Code::Response(r) => write!(f, "{}", r.description()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_descriptions() {
        assert_eq!(ResponseCode::from_code(65).unwrap().description(), "2.01 Created");
        assert_eq!(ResponseCode::from_code(132).unwrap().description(), "4.04 Not Found");
        assert_eq!(ResponseCode::from_code(165).unwrap().description(), "5.05 Proxying Not Supported");
        assert!(ResponseCode::from_code(70).is_none());
    }

    #[test]
    fn test_code_classification() {
        assert_eq!(Code::from_u8(0), Some(Code::Empty));
        assert!(!Code::from_u8(0).unwrap().is_request());
        assert_eq!(Code::from_u8(3), Some(Code::Request(Method::Put)));
        assert_eq!(Code::from_u8(69), Some(Code::Response(ResponseCode::Content)));
        assert_eq!(Code::from_u8(31), None);
    }

    #[test]
    fn test_class_digit() {
        assert_eq!(ResponseCode::Content.class(), 2);
        assert!(ResponseCode::Changed.is_success());
        assert_eq!(ResponseCode::NotFound.class(), 4);
        assert_eq!(ResponseCode::GatewayTimeout.class(), 5);
    }
}
