use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::HeaderMap;
use http::header::AUTHORIZATION;
/// Secret string type that redacts its value in debug output.
pub use secrecy::SecretString;
use secrecy::ExposeSecret as _;
use serde::Deserialize;

/// Username/password pair for the authenticated channel.
///
/// The manager keeps only the last-authenticated value and compares it by
/// value to decide whether a re-authenticate call is a no-op.
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    pub(crate) username: String,
    pub(crate) password: SecretString,
}

impl Credentials {
    #[must_use]
    pub fn new(username: String, password: String) -> Self {
        Self {
            username,
            password: SecretString::from(password),
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn password(&self) -> &SecretString {
        &self.password
    }

    /// Both parts empty. Authenticating with empty credentials is a logged
    /// no-op rather than an error.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.expose_secret().is_empty()
    }

    /// `Basic` authorization header value for these credentials.
    #[must_use]
    pub fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password.expose_secret());
        format!("Basic {}", STANDARD.encode(raw))
    }

    /// Whether `headers` carries a Basic authorization header matching these
    /// credentials. Used by `fetch` to classify requests onto the
    /// authenticated channel.
    #[must_use]
    pub fn matches_basic_auth(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers.get(AUTHORIZATION) else {
            return false;
        };
        let Ok(value) = value.to_str() else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((username, password)) = decoded.split_once(':') else {
            return false;
        };

        username == self.username && password == self.password.expose_secret()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for Credentials {}

/// Source of credentials when none have been stored yet.
///
/// Injected collaborator; how the credentials are persisted is out of scope.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Option<Credentials>;
}
