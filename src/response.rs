//! Gemini status codes and the response model.

/// The response status codes defined by the Gemini protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Input,
    SensitiveInput,
    Success,
    RedirectTemporary,
    RedirectPermanent,
    TemporaryFailure,
    ServerUnavailable,
    CgiError,
    ProxyError,
    SlowDown,
    PermanentFailure,
    NotFound,
    Gone,
    ProxyRequestRefused,
    BadRequest,
    ClientCertificateRequired,
    CertificateNotAuthorized,
    CertificateNotValid,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Input => 10,
            Status::SensitiveInput => 11,
            Status::Success => 20,
            Status::RedirectTemporary => 30,
            Status::RedirectPermanent => 31,
            Status::TemporaryFailure => 40,
            Status::ServerUnavailable => 41,
            Status::CgiError => 42,
            Status::ProxyError => 43,
            Status::SlowDown => 44,
            Status::PermanentFailure => 50,
            Status::NotFound => 51,
            Status::Gone => 52,
            Status::ProxyRequestRefused => 53,
            Status::BadRequest => 59,
            Status::ClientCertificateRequired => 60,
            Status::CertificateNotAuthorized => 61,
            Status::CertificateNotValid => 62,
        }
    }

    pub fn from_code(code: u8) -> Option<Status> {
        Some(match code {
            10 => Status::Input,
            11 => Status::SensitiveInput,
            20 => Status::Success,
            30 => Status::RedirectTemporary,
            31 => Status::RedirectPermanent,
            40 => Status::TemporaryFailure,
            41 => Status::ServerUnavailable,
            42 => Status::CgiError,
            43 => Status::ProxyError,
            44 => Status::SlowDown,
            50 => Status::PermanentFailure,
            51 => Status::NotFound,
            52 => Status::Gone,
            53 => Status::ProxyRequestRefused,
            59 => Status::BadRequest,
            60 => Status::ClientCertificateRequired,
            61 => Status::CertificateNotAuthorized,
            62 => Status::CertificateNotValid,
            _ => return None,
        })
    }

    pub fn is_success(self) -> bool {
        (20..=29).contains(&self.code())
    }

    /// The name used in access log lines.
    pub fn name(self) -> &'static str {
        match self {
            Status::Input => "INPUT",
            Status::SensitiveInput => "SENSITIVE_INPUT",
            Status::Success => "SUCCESS",
            Status::RedirectTemporary => "REDIRECT_TEMPORARY",
            Status::RedirectPermanent => "REDIRECT_PERMANENT",
            Status::TemporaryFailure => "TEMPORARY_FAILURE",
            Status::ServerUnavailable => "SERVER_UNAVAILABLE",
            Status::CgiError => "CGI_ERROR",
            Status::ProxyError => "PROXY_ERROR",
            Status::SlowDown => "SLOW_DOWN",
            Status::PermanentFailure => "PERMANENT_FAILURE",
            Status::NotFound => "NOT_FOUND",
            Status::Gone => "GONE",
            Status::ProxyRequestRefused => "PROXY_REQUEST_REFUSED",
            Status::BadRequest => "BAD_REQUEST",
            Status::ClientCertificateRequired => "CLIENT_CERTIFICATE_REQUIRED",
            Status::CertificateNotAuthorized => "CERTIFICATE_NOT_AUTHORIZED",
            Status::CertificateNotValid => "CERTIFICATE_NOT_VALID",
        }
    }
}

/// A complete response: status, meta line and an optional body.
///
/// The body is only ever sent for success statuses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub meta: String,
    pub body: Option<Vec<u8>>,
}

/// The meta field is limited to 1024 bytes and may not contain CR or LF.
const MAX_META_LEN: usize = 1024;

impl Response {
    pub fn new(status: Status, meta: impl Into<String>) -> Response {
        Response {
            status,
            meta: sanitize_meta(meta.into()),
            body: None,
        }
    }

    pub fn with_body(status: Status, meta: impl Into<String>, body: impl Into<Vec<u8>>) -> Response {
        Response {
            body: Some(body.into()),
            ..Response::new(status, meta)
        }
    }

    pub fn success(mime: impl Into<String>, body: impl Into<Vec<u8>>) -> Response {
        Response::with_body(Status::Success, mime, body)
    }
}

fn sanitize_meta(meta: String) -> String {
    let mut meta = if meta.contains(['\r', '\n']) {
        meta.replace(['\r', '\n'], " ")
    } else {
        meta
    };
    if meta.len() > MAX_META_LEN {
        let mut end = MAX_META_LEN;
        while !meta.is_char_boundary(end) {
            end -= 1;
        }
        meta.truncate(end);
    }
    meta
}
