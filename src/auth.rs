use tracing::info;

use crate::broker::{BrokerHttpClient, BrokerReply};
use crate::domain::{AuthScheme, Credential};
use crate::error::WekeoError;

/// Source of the session credential.
pub trait TokenProvider {
    fn credential(&self) -> Result<Credential, WekeoError>;
}

pub struct StaticToken(pub Credential);

impl TokenProvider for StaticToken {
    fn credential(&self) -> Result<Credential, WekeoError> {
        Ok(self.0.clone())
    }
}

/// Exchanges a username and password for an access token.
pub struct BrokerLogin<'a> {
    client: &'a BrokerHttpClient,
    username: String,
    password: String,
    scheme: AuthScheme,
}

impl<'a> BrokerLogin<'a> {
    pub fn new(client: &'a BrokerHttpClient, username: &str, password: &str) -> Self {
        Self {
            client,
            username: username.to_string(),
            password: password.to_string(),
            scheme: AuthScheme::default(),
        }
    }

    pub fn with_scheme(mut self, scheme: AuthScheme) -> Self {
        self.scheme = scheme;
        self
    }
}

impl TokenProvider for BrokerLogin<'_> {
    fn credential(&self) -> Result<Credential, WekeoError> {
        let reply = self.client.request_token(&self.username, &self.password)?;
        let token = parse_token_reply(reply)?;
        info!(user = %self.username, "access token issued");
        Ok(Credential::new(token).with_scheme(self.scheme))
    }
}

pub fn parse_token_reply(reply: BrokerReply) -> Result<String, WekeoError> {
    let reply = reply.check_auth()?;
    if !reply.is_success() {
        return Err(WekeoError::BrokerStatus {
            status: reply.status,
            message: reply.body,
        });
    }
    reply
        .json()
        .ok()
        .and_then(|value| {
            value
                .get("access_token")
                .and_then(|token| token.as_str())
                .filter(|token| !token.trim().is_empty())
                .map(str::to_string)
        })
        .ok_or_else(|| WekeoError::Auth {
            status: reply.status,
            message: format!("no access_token in reply: {}", reply.body),
        })
}
