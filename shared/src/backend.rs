//! HTTP gateway to the account/matchmaking backend
//!
//! The backend speaks a small form-POST protocol: every endpoint takes
//! url-encoded form fields and answers with a single line of tab-separated
//! values. The first value is a status code: `1` means success, `0` means the
//! operation errored (second value is a human-readable detail), and `2` is a
//! domain-level negative (bad credentials on sign-in, "not in match" on the
//! membership check).
//!
//! [`BackendGateway`] is the seam the server and client code program against;
//! [`HttpBackend`] is the real implementation. Whether it points at the live
//! service or a localhost instance is a runtime decision made at startup, not
//! a compile-time one.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default base URL used when running against a local backend instance.
pub const LOCAL_BACKEND_URL: &str = "http://localhost";

#[derive(Debug, Error)]
pub enum BackendError {
    /// The HTTP request itself failed (DNS, connect, timeout). Callers treat
    /// this as transient and retry on their own schedule.
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The backend answered with status `0` and a detail message.
    #[error("backend refused the operation: {0}")]
    Refused(String),
    /// The backend answered with status `2`: the request was well-formed but
    /// rejected on domain grounds (bad credentials, duplicate username). The
    /// message is meant to be shown to the user as-is.
    #[error("{0}")]
    Rejected(String),
    /// The response did not follow the tab-separated contract.
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

/// Where the backend lives. Selected once at startup from configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
}

impl BackendConfig {
    /// Points at a backend running on this machine.
    pub fn local() -> Self {
        Self {
            base_url: LOCAL_BACKEND_URL.to_string(),
        }
    }

    pub fn live(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Account data returned by `sign_in_user` / `check_if_session_exists`.
///
/// Only the fields the session logic consumes are kept; unit collections and
/// deck data belong to the out-of-scope persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedInUser {
    pub username: String,
    pub player_name: String,
    pub session_token: String,
    pub gold: u32,
    pub trophies: u32,
}

/// Result of the `check_if_user_in_match` membership probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMembership {
    InMatch,
    NotInMatch,
}

/// The calls the connection lifecycle makes against the backend.
#[async_trait]
pub trait BackendGateway: Send + Sync {
    async fn sign_in(&self, username: &str, password: &str) -> Result<SignedInUser, BackendError>;

    async fn check_session(&self, session_token: &str) -> Result<SignedInUser, BackendError>;

    /// Marks this server process as allocated to a match. Returns the server
    /// password clients must present to connect.
    async fn mark_server_allocated(
        &self,
        server_id: i64,
        ip: &str,
        port: u16,
    ) -> Result<String, BackendError>;

    async fn unmark_server_allocated(&self, server_id: i64) -> Result<(), BackendError>;

    async fn mark_user_in_match(
        &self,
        username: &str,
        ip: &str,
        port: u16,
    ) -> Result<(), BackendError>;

    async fn unmark_users_in_match(&self, ip: &str, port: u16) -> Result<(), BackendError>;

    /// Exchanges a resolved match endpoint for the server password.
    async fn get_server_password(
        &self,
        session_token: &str,
        username: &str,
        ip: &str,
        port: u16,
    ) -> Result<String, BackendError>;

    async fn check_user_in_match(
        &self,
        username: &str,
        session_token: &str,
    ) -> Result<MatchMembership, BackendError>;

    /// Liveness probe: the backend echoes `nonce` back. The caller compares
    /// the echo against what it sent.
    async fn connection_test(&self, nonce: &str) -> Result<String, BackendError>;

    async fn post_match_result(
        &self,
        username: &str,
        trophies: u32,
        gold: u32,
        unit_id: Option<&str>,
    ) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseStatus {
    Ok,
    Error,
    Negative,
}

/// A parsed tab-separated backend response: status code plus the remaining
/// fields in order.
#[derive(Debug)]
struct BackendResponse {
    status: ResponseStatus,
    fields: Vec<String>,
}

impl BackendResponse {
    fn parse(text: &str) -> Result<Self, BackendError> {
        let mut parts = text.trim_end_matches(['\r', '\n']).split('\t');
        let status = match parts.next() {
            Some("1") => ResponseStatus::Ok,
            Some("0") => ResponseStatus::Error,
            Some("2") => ResponseStatus::Negative,
            Some(other) => {
                return Err(BackendError::Malformed(format!(
                    "unknown status code: {:?}",
                    other
                )))
            }
            None => return Err(BackendError::Malformed("empty response".to_string())),
        };
        let fields = parts.map(str::to_string).collect();
        Ok(Self { status, fields })
    }

    fn detail(&self) -> String {
        self.fields
            .first()
            .cloned()
            .unwrap_or_else(|| "no detail provided".to_string())
    }

    /// Succeeds only on status `1`; maps `0`/`2` to the error taxonomy.
    fn into_ok(self) -> Result<Vec<String>, BackendError> {
        match self.status {
            ResponseStatus::Ok => Ok(self.fields),
            ResponseStatus::Error => Err(BackendError::Refused(self.detail())),
            ResponseStatus::Negative => Err(BackendError::Rejected(self.detail())),
        }
    }
}

fn field<'a>(fields: &'a [String], index: usize, name: &str) -> Result<&'a str, BackendError> {
    fields
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| BackendError::Malformed(format!("missing field: {}", name)))
}

fn numeric_field(fields: &[String], index: usize, name: &str) -> Result<u32, BackendError> {
    field(fields, index, name)?
        .parse()
        .map_err(|_| BackendError::Malformed(format!("non-numeric field: {}", name)))
}

/// Live implementation of [`BackendGateway`] over `reqwest`.
pub struct HttpBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url, endpoint)
    }

    async fn post_form(
        &self,
        endpoint: &str,
        fields: &[(&str, String)],
    ) -> Result<BackendResponse, BackendError> {
        let text = self
            .client
            .post(self.url(endpoint))
            .form(fields)
            .send()
            .await?
            .text()
            .await?;
        BackendResponse::parse(&text)
    }

    fn user_from_fields(
        username: &str,
        session_token: &str,
        fields: &[String],
        offset: usize,
    ) -> Result<SignedInUser, BackendError> {
        Ok(SignedInUser {
            username: username.to_string(),
            session_token: session_token.to_string(),
            player_name: field(fields, offset, "playerName")?.to_string(),
            gold: numeric_field(fields, offset + 1, "gold")?,
            trophies: numeric_field(fields, offset + 2, "trophies")?,
        })
    }
}

#[async_trait]
impl BackendGateway for HttpBackend {
    async fn sign_in(&self, username: &str, password: &str) -> Result<SignedInUser, BackendError> {
        let fields = self
            .post_form(
                "sign_in_user",
                &[
                    ("Username", username.to_string()),
                    ("Password", password.to_string()),
                ],
            )
            .await?
            .into_ok()?;
        // Response: sessionToken, playerName, gold, trophies, unit lists...
        let session_token = field(&fields, 0, "sessionToken")?.to_string();
        Self::user_from_fields(username, &session_token, &fields, 1)
    }

    async fn check_session(&self, session_token: &str) -> Result<SignedInUser, BackendError> {
        let fields = self
            .post_form(
                "check_if_session_exists",
                &[("SessionToken", session_token.to_string())],
            )
            .await?
            .into_ok()?;
        // Response: username, playerName, gold, trophies, unit lists...
        let username = field(&fields, 0, "username")?.to_string();
        Self::user_from_fields(&username, session_token, &fields, 1)
    }

    async fn mark_server_allocated(
        &self,
        server_id: i64,
        ip: &str,
        port: u16,
    ) -> Result<String, BackendError> {
        let fields = self
            .post_form(
                "mark_server_as_allocated",
                &[
                    ("Id", server_id.to_string()),
                    ("Ip", ip.to_string()),
                    ("Port", port.to_string()),
                ],
            )
            .await?
            .into_ok()?;
        Ok(field(&fields, 0, "password")?.to_string())
    }

    async fn unmark_server_allocated(&self, server_id: i64) -> Result<(), BackendError> {
        self.post_form("unmark_server_as_allocated", &[("Id", server_id.to_string())])
            .await?
            .into_ok()?;
        Ok(())
    }

    async fn mark_user_in_match(
        &self,
        username: &str,
        ip: &str,
        port: u16,
    ) -> Result<(), BackendError> {
        self.post_form(
            "mark_user_as_in_match",
            &[
                ("Username", username.to_string()),
                ("Ip", ip.to_string()),
                ("Port", port.to_string()),
            ],
        )
        .await?
        .into_ok()?;
        Ok(())
    }

    async fn unmark_users_in_match(&self, ip: &str, port: u16) -> Result<(), BackendError> {
        self.post_form(
            "unmark_users_as_in_match",
            &[("Ip", ip.to_string()), ("Port", port.to_string())],
        )
        .await?
        .into_ok()?;
        Ok(())
    }

    async fn get_server_password(
        &self,
        session_token: &str,
        username: &str,
        ip: &str,
        port: u16,
    ) -> Result<String, BackendError> {
        let fields = self
            .post_form(
                "get_server_password",
                &[
                    ("SessionToken", session_token.to_string()),
                    ("Username", username.to_string()),
                    ("Ip", ip.to_string()),
                    ("Port", port.to_string()),
                ],
            )
            .await?
            .into_ok()?;
        Ok(field(&fields, 0, "password")?.to_string())
    }

    async fn check_user_in_match(
        &self,
        username: &str,
        session_token: &str,
    ) -> Result<MatchMembership, BackendError> {
        let response = self
            .post_form(
                "check_if_user_in_match",
                &[
                    ("Username", username.to_string()),
                    ("ReturnServer", "No".to_string()),
                    ("SessionToken", session_token.to_string()),
                ],
            )
            .await?;
        match response.status {
            ResponseStatus::Ok => Ok(MatchMembership::InMatch),
            ResponseStatus::Negative => Ok(MatchMembership::NotInMatch),
            ResponseStatus::Error => Err(BackendError::Refused(response.detail())),
        }
    }

    async fn connection_test(&self, nonce: &str) -> Result<String, BackendError> {
        // Plain echo endpoint; no status code, the body is the echoed token.
        let text = self
            .client
            .get(format!(
                "{}?token={}",
                self.url("server_connection_testing"),
                nonce
            ))
            .send()
            .await?
            .text()
            .await?;
        Ok(text)
    }

    async fn post_match_result(
        &self,
        username: &str,
        trophies: u32,
        gold: u32,
        unit_id: Option<&str>,
    ) -> Result<(), BackendError> {
        self.post_form(
            "post_match_result",
            &[
                ("Username", username.to_string()),
                ("Trophies", trophies.to_string()),
                ("Gold", gold.to_string()),
                ("Unit_id", unit_id.unwrap_or("NO_UNIT").to_string()),
            ],
        )
        .await?
        .into_ok()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_response_with_fields() {
        let response = BackendResponse::parse("1\tPW123").unwrap();
        assert_eq!(response.status, ResponseStatus::Ok);
        let fields = response.into_ok().unwrap();
        assert_eq!(fields, vec!["PW123".to_string()]);
    }

    #[test]
    fn parses_bare_success_response() {
        let fields = BackendResponse::parse("1").unwrap().into_ok().unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn error_status_maps_to_refused_with_detail() {
        let result = BackendResponse::parse("0\tserver not found").unwrap().into_ok();
        match result {
            Err(BackendError::Refused(detail)) => assert_eq!(detail, "server not found"),
            other => panic!("expected Refused, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn negative_status_maps_to_rejected() {
        let result = BackendResponse::parse("2\twrong password").unwrap().into_ok();
        match result {
            Err(BackendError::Rejected(detail)) => assert_eq!(detail, "wrong password"),
            other => panic!("expected Rejected, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn error_without_detail_still_reports() {
        let result = BackendResponse::parse("0").unwrap().into_ok();
        match result {
            Err(BackendError::Refused(detail)) => assert_eq!(detail, "no detail provided"),
            other => panic!("expected Refused, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unknown_status_is_malformed() {
        assert!(matches!(
            BackendResponse::parse("ok\twhatever"),
            Err(BackendError::Malformed(_))
        ));
        assert!(matches!(
            BackendResponse::parse(""),
            Err(BackendError::Malformed(_))
        ));
    }

    #[test]
    fn trailing_newline_is_stripped() {
        let fields = BackendResponse::parse("1\tPW123\n").unwrap().into_ok().unwrap();
        assert_eq!(fields, vec!["PW123".to_string()]);
    }

    #[test]
    fn sign_in_fields_produce_user() {
        let fields: Vec<String> = ["token-1", "nameA", "250", "30", "1&2&3", "1&1&1", "1&2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let session_token = fields[0].clone();
        let user = HttpBackend::user_from_fields("userA", &session_token, &fields, 1).unwrap();
        assert_eq!(
            user,
            SignedInUser {
                username: "userA".to_string(),
                player_name: "nameA".to_string(),
                session_token: "token-1".to_string(),
                gold: 250,
                trophies: 30,
            }
        );
    }

    #[test]
    fn missing_fields_are_malformed() {
        let fields: Vec<String> = vec!["token-1".to_string()];
        let result = HttpBackend::user_from_fields("userA", "token-1", &fields, 1);
        assert!(matches!(result, Err(BackendError::Malformed(_))));
    }

    #[test]
    fn live_config_strips_trailing_slash() {
        let config = BackendConfig::live("https://backend.example.com/");
        assert_eq!(config.base_url, "https://backend.example.com");

        let backend = HttpBackend::new(config).unwrap();
        assert_eq!(
            backend.url("sign_in_user"),
            "https://backend.example.com/sign_in_user"
        );
    }
}
