// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Pluggable connect-time authentication.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use async_trait::async_trait;
use rustls_pki_types::CertificateDer;

use crate::config::Security;
use crate::error::{Error, ErrorKind};

/// Everything known about a client at CONNECT time.
///
/// `http_request` is set iff the connection arrived over a websocket;
/// `peer_certs` iff the TLS handshake presented a client certificate chain.
#[derive(Debug)]
pub struct AuthRequest<'a> {
    pub client_id: &'a str,
    pub clean_session: bool,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub http_request: Option<&'a http::Request<()>>,
    pub tls: bool,
    pub peer_certs: Option<&'a [CertificateDer<'static>]>,
}

/// Decides which principal, if any, a connecting client acts as.
///
/// `Ok(None)` maps to a CONNACK with return code NotAuthorized; an `Err`
/// tears the connection down without a CONNACK and is never shown to the
/// peer.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest<'_>) -> Result<Option<String>, Error>;
}

/// Accept every client; the principal is the username when given, the
/// client id otherwise.
#[derive(Debug, Default)]
pub struct AllowAnonymous;

#[async_trait]
impl Authenticator for AllowAnonymous {
    async fn authenticate(&self, request: &AuthRequest<'_>) -> Result<Option<String>, Error> {
        Ok(Some(
            request.username.unwrap_or(request.client_id).to_owned(),
        ))
    }
}

/// Checks credentials against `username:password` lines from a password
/// file. Anonymous clients pass only when the security config allows them.
#[derive(Debug)]
pub struct PasswordFileAuth {
    users: HashMap<String, String>,
    allow_anonymous: bool,
}

impl PasswordFileAuth {
    /// Load a password file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or a line is malformed.
    pub fn load(path: &std::path::Path, allow_anonymous: bool) -> Result<Self, Error> {
        let fd = File::open(path).map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("auth: Failed to open password file {path:?}, err: {err}"),
            )
        })?;
        let reader = BufReader::new(fd);
        let mut users = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            if let Some((username, password)) = parse_user_line(&line)? {
                users.insert(username.to_owned(), password.to_owned());
            }
        }
        Ok(Self {
            users,
            allow_anonymous,
        })
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl Authenticator for PasswordFileAuth {
    async fn authenticate(&self, request: &AuthRequest<'_>) -> Result<Option<String>, Error> {
        match request.username {
            Some(username) => {
                let matched = self
                    .users
                    .get(username)
                    .is_some_and(|expected| Some(expected.as_str()) == request.password);
                Ok(matched.then(|| username.to_owned()))
            }
            None => Ok(self
                .allow_anonymous
                .then(|| request.client_id.to_owned())),
        }
    }
}

/// One line of a password file: `username:password`, empty lines and
/// `#`-comments skipped.
fn parse_user_line(line: &str) -> Result<Option<(&str, &str)>, Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    match line.split_once(':') {
        Some((username, password)) if !username.is_empty() => Ok(Some((username, password))),
        _ => Err(Error::from_string(
            ErrorKind::ConfigError,
            format!("auth: Invalid password file line: {line:?}"),
        )),
    }
}

/// Build the authenticator described by the `[security]` config table.
///
/// # Errors
///
/// Returns error if the configured password file cannot be loaded.
pub fn from_security(security: &Security) -> Result<Arc<dyn Authenticator>, Error> {
    match security.password_file() {
        Some(path) => Ok(Arc::new(PasswordFileAuth::load(
            path,
            security.allow_anonymous(),
        )?)),
        None => {
            if security.allow_anonymous() {
                Ok(Arc::new(AllowAnonymous))
            } else {
                Ok(Arc::new(DenyAll))
            }
        }
    }
}

/// Refuse every client; used when anonymous access is off and no other
/// credential source is configured.
#[derive(Debug, Default)]
pub struct DenyAll;

#[async_trait]
impl Authenticator for DenyAll {
    async fn authenticate(&self, _request: &AuthRequest<'_>) -> Result<Option<String>, Error> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(username: Option<&'a str>, password: Option<&'a str>) -> AuthRequest<'a> {
        AuthRequest {
            client_id: "client",
            clean_session: true,
            username,
            password,
            http_request: None,
            tls: false,
            peer_certs: None,
        }
    }

    #[test]
    fn test_parse_user_line() {
        assert_eq!(parse_user_line("alice:secret").unwrap(), Some(("alice", "secret")));
        assert_eq!(parse_user_line("").unwrap(), None);
        assert_eq!(parse_user_line("# comment").unwrap(), None);
        assert!(parse_user_line("no-colon").is_err());
        assert!(parse_user_line(":empty-name").is_err());
    }

    #[tokio::test]
    async fn test_allow_anonymous() {
        let auth = AllowAnonymous;
        let principal = auth.authenticate(&request(None, None)).await.unwrap();
        assert_eq!(principal.as_deref(), Some("client"));
        let principal = auth
            .authenticate(&request(Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(principal.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_password_file_auth() {
        let auth = PasswordFileAuth {
            users: HashMap::from([("alice".to_owned(), "secret".to_owned())]),
            allow_anonymous: false,
        };
        let granted = auth
            .authenticate(&request(Some("alice"), Some("secret")))
            .await
            .unwrap();
        assert_eq!(granted.as_deref(), Some("alice"));
        assert!(auth
            .authenticate(&request(Some("alice"), Some("wrong")))
            .await
            .unwrap()
            .is_none());
        assert!(auth
            .authenticate(&request(None, None))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_deny_all() {
        let auth = DenyAll;
        assert!(auth.authenticate(&request(None, None)).await.unwrap().is_none());
    }
}
