use panbd_transfer::TransferError;

/// Vendor `errno` values meaning the access token is no longer valid.
pub const EXPIRED_ERRNOS: [i64; 3] = [-6, 111, -1];

/// Vendor `errno` returned when requests are throttled.
pub const RATE_LIMITED_ERRNO: i64 = 31034;

/// Errors from the Netdisk client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("API error {errno}: {message}")]
    Api { errno: i64, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("remote file not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Config(String),

    #[error("token grant rejected: {0}")]
    Auth(String),
}

impl ClientError {
    /// Builds the error for a non-zero vendor `errno`.
    pub fn api(errno: i64, message: Option<String>) -> Self {
        Self::Api {
            errno,
            message: message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("errno {errno}")),
        }
    }
}

impl From<ClientError> for TransferError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Http(e) => TransferError::Transport(e.to_string()),
            ClientError::Status { status: 401, .. } => TransferError::CredentialExpired,
            ClientError::Status { status, .. } => TransferError::Http { status },
            ClientError::Api { errno, .. } if EXPIRED_ERRNOS.contains(&errno) => {
                TransferError::CredentialExpired
            }
            ClientError::Api {
                errno: RATE_LIMITED_ERRNO,
                ..
            } => TransferError::RateLimited,
            ClientError::Api { errno, message } => TransferError::Remote { errno, message },
            ClientError::Json(e) => TransferError::Json(e),
            ClientError::InvalidResponse(msg) => TransferError::Remote { errno: 0, message: msg },
            ClientError::NotFound(path) => {
                TransferError::Config(format!("remote file not found: {path}"))
            }
            ClientError::Config(msg) => TransferError::Config(msg),
            ClientError::Auth(_) => TransferError::CredentialExpired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_codes_map_to_credential_expired() {
        for errno in EXPIRED_ERRNOS {
            let err: TransferError = ClientError::api(errno, None).into();
            assert!(matches!(err, TransferError::CredentialExpired), "errno {errno}");
        }
        let err: TransferError = ClientError::Status {
            status: 401,
            body: String::new(),
        }
        .into();
        assert!(matches!(err, TransferError::CredentialExpired));
    }

    #[test]
    fn throttling_is_transient() {
        let err: TransferError = ClientError::api(RATE_LIMITED_ERRNO, None).into();
        assert!(matches!(err, TransferError::RateLimited));
        assert!(err.is_transient());
    }

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let err: TransferError = ClientError::Status {
            status: 502,
            body: String::new(),
        }
        .into();
        assert!(err.is_transient());
        let err: TransferError = ClientError::Status {
            status: 404,
            body: String::new(),
        }
        .into();
        assert!(!err.is_transient());
    }

    #[test]
    fn other_errnos_keep_code_and_message() {
        let err: TransferError = ClientError::api(31066, Some("file does not exist".into())).into();
        match err {
            TransferError::Remote { errno, message } => {
                assert_eq!(errno, 31066);
                assert_eq!(message, "file does not exist");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn empty_message_falls_back_to_code() {
        let err = ClientError::api(2, Some(String::new()));
        assert_eq!(err.to_string(), "API error 2: errno 2");
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err: TransferError = ClientError::NotFound("/apps/demo/x".into()).into();
        assert!(matches!(err, TransferError::Config(_)));
    }
}
