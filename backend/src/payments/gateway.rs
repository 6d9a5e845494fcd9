//! Mobile-money carrier gateway
//!
//! [`CarrierGateway`] is the seam the ledger talks to; [`DarajaGateway`] is
//! the HTTP client for the Daraja API.

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use super::model::{GatewayReceipt, PaymentStatus};
use crate::config::CarrierConfig;
use crate::models::PhoneNumber;

/// Tokens are valid for an hour; refresh a little early
const TOKEN_TTL: Duration = Duration::from_secs(3500);

#[async_trait]
pub trait CarrierGateway: Send + Sync {
    /// STK push prompting `phone` to pay `amount` against `account_reference`
    async fn initiate_collection(
        &self,
        phone: &PhoneNumber,
        amount: i64,
        account_reference: &str,
        description: &str,
    ) -> Result<GatewayReceipt>;

    /// B2C payment from the business to `phone`
    async fn initiate_disbursement(
        &self,
        phone: &PhoneNumber,
        amount: i64,
        remarks: &str,
    ) -> Result<GatewayReceipt>;

    async fn query_status(&self, request_id: &str) -> Result<PaymentStatus>;
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct DarajaGateway {
    config: CarrierConfig,
    client: Client,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    response_code: String,
    response_description: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct B2cResponse {
    #[serde(rename = "ConversationID")]
    conversation_id: String,
    response_code: String,
    response_description: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryResponse {
    result_code: Option<String>,
}

impl DarajaGateway {
    pub fn new(config: CarrierConfig) -> Self {
        Self {
            config,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            token: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let response: TokenResponse = self
            .client
            .get(self.url("/oauth/v1/generate"))
            .query(&[("grant_type", "client_credentials")])
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await
            .context("Failed to reach carrier token endpoint")?
            .error_for_status()
            .context("Carrier rejected token request")?
            .json()
            .await
            .context("Malformed carrier token response")?;

        tracing::debug!("Refreshed carrier access token");

        *cached = Some(CachedToken {
            value: response.access_token.clone(),
            expires_at: Instant::now() + TOKEN_TTL,
        });
        Ok(response.access_token)
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach carrier endpoint {}", path))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Carrier endpoint {} returned {}: {}", path, status, text);
        }

        response
            .json()
            .await
            .with_context(|| format!("Malformed response from carrier endpoint {}", path))
    }
}

/// Carrier timestamps are East Africa Time, `YYYYMMDDHHMMSS`
pub fn carrier_timestamp() -> String {
    (Utc::now() + ChronoDuration::hours(3))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// base64(short code + passkey + timestamp)
pub fn stk_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    general_purpose::STANDARD.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

#[async_trait]
impl CarrierGateway for DarajaGateway {
    async fn initiate_collection(
        &self,
        phone: &PhoneNumber,
        amount: i64,
        account_reference: &str,
        description: &str,
    ) -> Result<GatewayReceipt> {
        let timestamp = carrier_timestamp();
        let body = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": stk_password(&self.config.short_code, &self.config.passkey, &timestamp),
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": phone.as_str(),
            "PartyB": self.config.short_code,
            "PhoneNumber": phone.as_str(),
            "CallBackURL": format!("{}/stk/callback", self.config.callback_url),
            "AccountReference": account_reference,
            "TransactionDesc": description,
        });

        let response: StkPushResponse = self.post("/mpesa/stkpush/v1/processrequest", body).await?;
        if response.response_code != "0" {
            return Err(anyhow!(
                "STK push rejected ({}): {}",
                response.response_code,
                response.response_description
            ));
        }

        tracing::info!(
            phone = %phone,
            amount,
            reference = %account_reference,
            checkout_id = %response.checkout_request_id,
            "STK push sent"
        );

        Ok(GatewayReceipt {
            request_id: response.checkout_request_id,
            response_code: response.response_code,
            description: response.response_description,
        })
    }

    async fn initiate_disbursement(
        &self,
        phone: &PhoneNumber,
        amount: i64,
        remarks: &str,
    ) -> Result<GatewayReceipt> {
        let body = json!({
            "InitiatorName": self.config.initiator_name,
            "SecurityCredential": self.config.security_credential,
            "CommandID": "BusinessPayment",
            "Amount": amount,
            "PartyA": self.config.short_code,
            "PartyB": phone.as_str(),
            "Remarks": remarks,
            "QueueTimeOutURL": format!("{}/b2c/timeout", self.config.callback_url),
            "ResultURL": format!("{}/b2c/result", self.config.callback_url),
            "Occasion": "Loan Disbursement",
        });

        let response: B2cResponse = self.post("/mpesa/b2c/v1/paymentrequest", body).await?;
        if response.response_code != "0" {
            return Err(anyhow!(
                "Disbursement rejected ({}): {}",
                response.response_code,
                response.response_description
            ));
        }

        tracing::info!(
            phone = %phone,
            amount,
            conversation_id = %response.conversation_id,
            "B2C disbursement initiated"
        );

        Ok(GatewayReceipt {
            request_id: response.conversation_id,
            response_code: response.response_code,
            description: response.response_description,
        })
    }

    async fn query_status(&self, request_id: &str) -> Result<PaymentStatus> {
        let timestamp = carrier_timestamp();
        let body = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": stk_password(&self.config.short_code, &self.config.passkey, &timestamp),
            "Timestamp": timestamp,
            "CheckoutRequestID": request_id,
        });

        let response: StkQueryResponse = self.post("/mpesa/stkpushquery/v1/query", body).await?;
        Ok(match response.result_code.as_deref() {
            Some("0") => PaymentStatus::Completed,
            Some(_) => PaymentStatus::Failed,
            None => PaymentStatus::Pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stk_password_encoding() {
        let password = stk_password("174379", "passkey", "20240101120000");
        let decoded = general_purpose::STANDARD.decode(password).unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "174379passkey20240101120000"
        );
    }

    #[test]
    fn test_carrier_timestamp_format() {
        let ts = carrier_timestamp();
        assert_eq!(ts.len(), 14);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
    }
}
