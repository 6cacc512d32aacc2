//! Phone number verification through an Authy-compatible SMS API.
//!
//! The provider sends the code itself; the server only asks it to start a
//! verification and later to check a submitted code. Both calls report a
//! plain success flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const START_PATH: &str = "/protected/json/phones/verification/start";
const CHECK_PATH: &str = "/protected/json/phones/verification/check";

#[derive(Debug, thiserror::Error)]
pub enum SmsError {
    #[error("SMS verification is not configured")]
    NotConfigured,
    #[error("SMS provider request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct StartRequest<'a> {
    api_key: &'a str,
    country_code: &'a str,
    phone_number: &'a str,
    via: &'a str,
}

#[derive(Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    success: bool,
}

/// HTTP client for the Authy verification API.
#[derive(Clone)]
pub struct AuthyClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AuthyClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, SmsError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    async fn start(&self, country_code: &str, phone_number: &str) -> Result<bool, SmsError> {
        let body = StartRequest {
            api_key: &self.api_key,
            country_code,
            phone_number,
            via: "sms",
        };
        let resp: ProviderResponse = self
            .http
            .post(format!("{}{START_PATH}", self.base_url))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.success)
    }

    async fn check(&self, country_code: &str, phone_number: &str, code: &str) -> Result<bool, SmsError> {
        let resp: ProviderResponse = self
            .http
            .get(format!("{}{CHECK_PATH}", self.base_url))
            .header("X-Authy-API-Key", &self.api_key)
            .query(&[
                ("country_code", country_code),
                ("phone_number", phone_number),
                ("verification_code", code),
            ])
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.success)
    }
}

/// Verification backend used by the handlers.
#[derive(Clone)]
pub enum SmsVerifier {
    /// Real provider over HTTP.
    Authy(AuthyClient),
    /// Fixed codes keyed by `country_code + phone_number`. Every start
    /// succeeds for a known number.
    Static(Arc<HashMap<String, String>>),
    /// No API key configured. Every call fails.
    Disabled,
}

impl SmsVerifier {
    /// Build the verifier from an optional API key.
    pub fn from_config(api_key: Option<&str>, base_url: &str) -> Result<Self, SmsError> {
        match api_key {
            Some(key) if !key.is_empty() => Ok(SmsVerifier::Authy(AuthyClient::new(key, base_url)?)),
            _ => Ok(SmsVerifier::Disabled),
        }
    }

    /// A verifier that knows a fixed set of numbers and their codes.
    pub fn static_codes<I, K, V>(codes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = codes.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        SmsVerifier::Static(Arc::new(map))
    }

    /// Ask the provider to send a code to this number.
    pub async fn start(&self, country_code: &str, phone_number: &str) -> Result<bool, SmsError> {
        match self {
            SmsVerifier::Authy(client) => client.start(country_code, phone_number).await,
            SmsVerifier::Static(codes) => Ok(codes.contains_key(&key(country_code, phone_number))),
            SmsVerifier::Disabled => Err(SmsError::NotConfigured),
        }
    }

    /// Ask the provider whether `code` is the one it sent.
    pub async fn check(&self, country_code: &str, phone_number: &str, code: &str) -> Result<bool, SmsError> {
        match self {
            SmsVerifier::Authy(client) => client.check(country_code, phone_number, code).await,
            SmsVerifier::Static(codes) => Ok(codes
                .get(&key(country_code, phone_number))
                .is_some_and(|expected| expected == code)),
            SmsVerifier::Disabled => Err(SmsError::NotConfigured),
        }
    }
}

fn key(country_code: &str, phone_number: &str) -> String {
    format!("{country_code}{phone_number}")
}
