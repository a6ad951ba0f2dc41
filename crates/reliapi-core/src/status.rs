//! Upstream status normalisation for metrics.

/// Normalised upstream status labels.
///
/// Upstream status codes are collapsed to this set before being used as a
/// metric label, keeping label cardinality bounded. The actual status code
/// still travels in logs and in the response error detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamStatus {
    Ok,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    TooManyRequests,
    ClientErrorOther,
    InternalServerError,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    ServerErrorOther,
    NetworkError,
    Timeout,
    Unknown,
}

impl UpstreamStatus {
    /// Normalises an HTTP status code (or its absence) to a label.
    pub fn normalize(status: Option<u16>) -> Self {
        let Some(status) = status else {
            return UpstreamStatus::Unknown;
        };
        match status {
            200 => UpstreamStatus::Ok,
            400 => UpstreamStatus::BadRequest,
            401 => UpstreamStatus::Unauthorized,
            403 => UpstreamStatus::Forbidden,
            404 => UpstreamStatus::NotFound,
            409 => UpstreamStatus::Conflict,
            429 => UpstreamStatus::TooManyRequests,
            400..=499 => UpstreamStatus::ClientErrorOther,
            500 => UpstreamStatus::InternalServerError,
            502 => UpstreamStatus::BadGateway,
            503 => UpstreamStatus::ServiceUnavailable,
            504 => UpstreamStatus::GatewayTimeout,
            500..=599 => UpstreamStatus::ServerErrorOther,
            _ => UpstreamStatus::Unknown,
        }
    }

    /// The label value used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamStatus::Ok => "200",
            UpstreamStatus::BadRequest => "400",
            UpstreamStatus::Unauthorized => "401",
            UpstreamStatus::Forbidden => "403",
            UpstreamStatus::NotFound => "404",
            UpstreamStatus::Conflict => "409",
            UpstreamStatus::TooManyRequests => "429",
            UpstreamStatus::ClientErrorOther => "4xx",
            UpstreamStatus::InternalServerError => "500",
            UpstreamStatus::BadGateway => "502",
            UpstreamStatus::ServiceUnavailable => "503",
            UpstreamStatus::GatewayTimeout => "504",
            UpstreamStatus::ServerErrorOther => "5xx",
            UpstreamStatus::NetworkError => "network_error",
            UpstreamStatus::Timeout => "timeout",
            UpstreamStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
