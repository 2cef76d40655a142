use std::collections::HashMap;

use anyhow::{anyhow, Context};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Signature timestamps older or newer than this are rejected.
const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

#[derive(Clone)]
pub struct StripeApi {
    http: reqwest::Client,
    secret_key: Option<String>,
    webhook_secret: Option<String>,
    base_url: String,
}

impl StripeApi {
    pub fn new(secret_key: Option<String>, webhook_secret: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create Stripe HTTP client")?;

        Ok(Self {
            http,
            secret_key,
            webhook_secret,
            base_url: "https://api.stripe.com/v1".to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// Verifies the `stripe-signature` header against the raw payload.
    /// Nothing downstream of this may run when verification fails.
    pub fn verify_webhook_signature(
        &self,
        signature_header: &str,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let webhook_secret = self
            .webhook_secret
            .as_ref()
            .ok_or_else(|| anyhow!("STRIPE_WEBHOOK_SECRET is not configured."))?;

        let header = SignatureHeader::parse(signature_header)?;

        let now = Utc::now().timestamp();
        if (now - header.timestamp).abs() > SIGNATURE_TOLERANCE_SECONDS {
            return Err(anyhow!("Stripe signature timestamp outside tolerance."));
        }

        let expected = header.expected_signature(webhook_secret, payload)?;
        let is_match = header
            .v1_signatures
            .iter()
            .any(|candidate| expected.as_bytes().ct_eq(candidate.as_bytes()).into());

        if !is_match {
            return Err(anyhow!("Invalid Stripe signature."));
        }

        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<T> {
        let key = self.require_secret_key()?;
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http
            .get(url)
            .bearer_auth(key)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Stripe GET failed for {}", path))?;

        parse_stripe_response(response, path).await
    }

    fn require_secret_key(&self) -> anyhow::Result<&str> {
        self.secret_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("STRIPE_SECRET_KEY is not configured."))
    }
}

struct SignatureHeader<'a> {
    timestamp: i64,
    v1_signatures: Vec<&'a str>,
}

impl<'a> SignatureHeader<'a> {
    /// Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=...]`.
    fn parse(header: &'a str) -> anyhow::Result<Self> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signatures: Vec<&str> = Vec::new();

        for part in header.split(',') {
            let mut pieces = part.trim().splitn(2, '=');
            let key = pieces.next().unwrap_or_default();
            let value = pieces.next().unwrap_or_default();
            if key == "t" {
                timestamp = value.parse::<i64>().ok();
            } else if key == "v1" {
                v1_signatures.push(value);
            }
        }

        let timestamp =
            timestamp.ok_or_else(|| anyhow!("Missing Stripe timestamp in signature."))?;
        if v1_signatures.is_empty() {
            return Err(anyhow!("Missing Stripe v1 signature."));
        }

        Ok(Self {
            timestamp,
            v1_signatures,
        })
    }

    fn expected_signature(&self, secret: &str, payload: &[u8]) -> anyhow::Result<String> {
        let payload_str =
            std::str::from_utf8(payload).context("invalid UTF-8 payload for Stripe signature")?;
        let signed_payload = format!("{}.{}", self.timestamp, payload_str);

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .context("invalid Stripe webhook secret")?;
        mac.update(signed_payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

async fn parse_stripe_response<T: DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> anyhow::Result<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read Stripe response body for {}", path))?;

    if !status.is_success() {
        return Err(anyhow!(
            "Stripe API {} failed with status {}: {}",
            path,
            status,
            text
        ));
    }

    serde_json::from_str::<T>(&text)
        .with_context(|| format!("failed to decode Stripe response for {}", path))
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub status: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub cancel_at: Option<i64>,
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCheckoutSession {
    pub client_reference_id: Option<String>,
    pub customer: Option<IdOrObject>,
    pub subscription: Option<IdOrObject>,
    pub mode: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePaymentIntent {
    pub customer: Option<IdOrObject>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSetupIntent {
    pub id: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePaymentMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: Option<String>,
    pub customer: Option<IdOrObject>,
}

/// Stripe returns references either as a bare id string or an expanded object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdOrObject {
    Id(String),
    Object { id: String },
}

impl IdOrObject {
    pub fn id(&self) -> String {
        match self {
            IdOrObject::Id(value) => value.clone(),
            IdOrObject::Object { id } => id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, String::from_utf8_lossy(payload)).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn api_with_secret(secret: &str) -> StripeApi {
        StripeApi::new(None, Some(secret.to_string())).unwrap()
    }

    #[test]
    fn accepts_valid_signature() {
        let secret = "whsec_test";
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let timestamp = Utc::now().timestamp();
        let header = format!("t={},v1={}", timestamp, sign(secret, timestamp, payload));

        let api = api_with_secret(secret);
        assert!(api.verify_webhook_signature(&header, payload).is_ok());
    }

    #[test]
    fn rejects_tampered_payload() {
        let secret = "whsec_test";
        let timestamp = Utc::now().timestamp();
        let header = format!(
            "t={},v1={}",
            timestamp,
            sign(secret, timestamp, b"original body")
        );

        let api = api_with_secret(secret);
        assert!(api
            .verify_webhook_signature(&header, b"tampered body")
            .is_err());
    }

    #[test]
    fn rejects_wrong_secret() {
        let payload = b"body";
        let timestamp = Utc::now().timestamp();
        let header = format!(
            "t={},v1={}",
            timestamp,
            sign("whsec_other", timestamp, payload)
        );

        let api = api_with_secret("whsec_test");
        assert!(api.verify_webhook_signature(&header, payload).is_err());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let secret = "whsec_test";
        let payload = b"body";
        let timestamp = Utc::now().timestamp() - SIGNATURE_TOLERANCE_SECONDS - 60;
        let header = format!("t={},v1={}", timestamp, sign(secret, timestamp, payload));

        let api = api_with_secret(secret);
        assert!(api.verify_webhook_signature(&header, payload).is_err());
    }

    #[test]
    fn rejects_header_without_v1_signature() {
        let api = api_with_secret("whsec_test");
        let header = format!("t={}", Utc::now().timestamp());
        assert!(api.verify_webhook_signature(&header, b"body").is_err());
    }

    #[test]
    fn rejects_when_secret_not_configured() {
        let api = StripeApi::new(None, None).unwrap();
        assert!(api.verify_webhook_signature("t=1,v1=abc", b"body").is_err());
    }

    #[test]
    fn accepts_any_of_multiple_v1_signatures() {
        let secret = "whsec_test";
        let payload = b"body";
        let timestamp = Utc::now().timestamp();
        let header = format!(
            "t={},v1={},v1={}",
            timestamp,
            "0".repeat(64),
            sign(secret, timestamp, payload)
        );

        let api = api_with_secret(secret);
        assert!(api.verify_webhook_signature(&header, payload).is_ok());
    }

    #[test]
    fn id_or_object_unwraps_both_shapes() {
        let bare: IdOrObject = serde_json::from_str(r#""cus_123""#).unwrap();
        assert_eq!(bare.id(), "cus_123");

        let expanded: IdOrObject = serde_json::from_str(r#"{"id":"cus_456"}"#).unwrap();
        assert_eq!(expanded.id(), "cus_456");
    }
}
