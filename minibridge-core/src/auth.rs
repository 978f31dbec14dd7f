//! Agent credentials.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Credentials presented by an agent or used to reach a policer.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Basic { user: String, password: String },
    Bearer { token: String },
}

/// Errors raised while parsing an `Authorization` header.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization header is empty or has no scheme")]
    MissingScheme,

    #[error("invalid basic credentials: {reason}")]
    InvalidBasic { reason: String },
}

impl Auth {
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Auth::Basic {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Auth::Bearer {
            token: token.into(),
        }
    }

    /// Scheme name as sent on the wire.
    pub fn scheme(&self) -> &'static str {
        match self {
            Auth::Basic { .. } => "Basic",
            Auth::Bearer { .. } => "Bearer",
        }
    }

    /// User name; bearer credentials report `Bearer`.
    pub fn user(&self) -> &str {
        match self {
            Auth::Basic { user, .. } => user,
            Auth::Bearer { .. } => "Bearer",
        }
    }

    /// Password, or the token for bearer credentials.
    pub fn password(&self) -> &str {
        match self {
            Auth::Basic { password, .. } => password,
            Auth::Bearer { token } => token,
        }
    }

    /// `Authorization` header value.
    pub fn encode(&self) -> String {
        match self {
            Auth::Basic { user, password } => {
                format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
            }
            Auth::Bearer { token } => format!("Bearer {token}"),
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Basic { user, .. } => f
                .debug_struct("Basic")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            Auth::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Parses an `Authorization` header.
///
/// `Basic <base64(user:password)>` (scheme matched case-insensitively) yields
/// [`Auth::Basic`]. Any other `<scheme> <credentials>` pair yields
/// [`Auth::Bearer`] holding the credentials part.
pub fn parse_authorization(header: &str) -> Result<Auth, AuthError> {
    const PREFIX: &str = "Basic ";

    let is_basic = header
        .get(..PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(PREFIX));

    if !is_basic {
        return match header.split_once(' ') {
            Some((_, token)) => Ok(Auth::bearer(token)),
            None => Err(AuthError::MissingScheme),
        };
    }

    let decoded = STANDARD
        .decode(&header[PREFIX.len()..])
        .map_err(|e| AuthError::InvalidBasic {
            reason: e.to_string(),
        })?;
    let decoded = String::from_utf8(decoded).map_err(|e| AuthError::InvalidBasic {
        reason: e.to_string(),
    })?;

    let (user, password) = decoded
        .split_once(':')
        .ok_or_else(|| AuthError::InvalidBasic {
            reason: "missing ':' separator".to_string(),
        })?;

    Ok(Auth::basic(user, password))
}
