use axum::{
    body::Bytes,
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{
    solution::{CompletionError, ProblemInfo},
    state::AppState,
    stripe_api::StripeEvent,
    webhook::process_event,
};

pub async fn health(State(state): State<AppState>) -> Response {
    match state.db.ping().await {
        Ok(()) => (StatusCode::OK, "API server is online.").into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to reach Supabase");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to connect to Supabase.",
            )
                .into_response()
        }
    }
}

pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Raw-body webhook endpoint. Verification must see the exact bytes Stripe
/// signed, so the body is never parsed before the signature check passes.
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = match headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value,
        None => {
            tracing::error!("no signature found in webhook request");
            return error_response(StatusCode::BAD_REQUEST, "No signature found");
        }
    };

    if let Err(error) = state.stripe.verify_webhook_signature(signature, &body) {
        tracing::error!(error = %error, "error verifying webhook signature");
        if error.to_string().contains("STRIPE_WEBHOOK_SECRET") {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Webhook not configured");
        }
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("Webhook Error: {}", error),
        );
    }

    let event: StripeEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(error) => {
            tracing::error!(error = %error, "invalid webhook payload");
            return error_response(StatusCode::BAD_REQUEST, "Invalid payload");
        }
    };

    tracing::info!(event_type = %event.event_type, "received webhook event");

    match process_event(event, &state.db, &state.stripe).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "received": true }))).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "error processing webhook");
            let status = if error.is_bad_request() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            error_response(status, &error.to_string())
        }
    }
}

pub async fn generate_solution(
    State(state): State<AppState>,
    Json(problem): Json<ProblemInfo>,
) -> Response {
    let api_key = state.config.openai_api_key.clone().unwrap_or_default();

    match state.openai.generate_solution(&problem, &api_key).await {
        Ok(solution) => (StatusCode::OK, Json(json!({ "solution": solution }))).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "solution generation failed");
            let status = match &error {
                CompletionError::MissingApiKey => StatusCode::INTERNAL_SERVER_ERROR,
                CompletionError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
                CompletionError::MalformedResponse | CompletionError::Upstream(_) => {
                    StatusCode::BAD_GATEWAY
                }
            };
            error_response(status, &error.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::HeaderValue;
    use hmac::{Hmac, Mac};
    use serde_json::Value;
    use sha2::Sha256;

    use super::*;
    use crate::{
        config::Config, solution::OpenAiClient, state::AppState, stripe_api::StripeApi,
        supabase::SupabaseClient,
    };

    const WEBHOOK_SECRET: &str = "whsec_test";

    fn test_state(store_url: String) -> AppState {
        let config = Config {
            port: 0,
            trust_proxy: false,
            tls_key_path: None,
            tls_cert_path: None,
            supabase_url: store_url.clone(),
            supabase_service_role_key: "service-role-key".to_string(),
            stripe_secret_key: Some("sk_test".to_string()),
            stripe_webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            openai_api_key: None,
            openai_model: "o1-mini".to_string(),
            openai_timeout: Duration::from_secs(5),
            generate_rate_limit: 5,
        };

        let db = SupabaseClient::new(store_url, "service-role-key").unwrap();
        let stripe = StripeApi::new(
            config.stripe_secret_key.clone(),
            config.stripe_webhook_secret.clone(),
        )
        .unwrap();
        let openai = OpenAiClient::new("o1-mini".to_string(), Duration::from_secs(5)).unwrap();
        AppState::new(config, db, stripe, openai)
    }

    fn signature_for(payload: &[u8]) -> String {
        let timestamp = chrono::Utc::now().timestamp();
        let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, String::from_utf8_lossy(payload)).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    async fn store_mocks(server: &mut mockito::ServerGuard) -> Vec<mockito::Mock> {
        let mut mocks = Vec::new();
        for method in ["GET", "PATCH", "POST"] {
            mocks.push(
                server
                    .mock(method, mockito::Matcher::Any)
                    .expect(0)
                    .create_async()
                    .await,
            );
        }
        mocks
    }

    async fn response_error(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        value["error"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn missing_signature_is_rejected_without_store_access() {
        let mut server = mockito::Server::new_async().await;
        let mocks = store_mocks(&mut server).await;
        let state = test_state(server.url());

        let response =
            handle_stripe_webhook(State(state), HeaderMap::new(), Bytes::from_static(b"{}")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_error(response).await, "No signature found");
        for mock in mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected_without_store_access() {
        let mut server = mockito::Server::new_async().await;
        let mocks = store_mocks(&mut server).await;
        let state = test_state(server.url());

        let mut headers = HeaderMap::new();
        headers.insert(
            "stripe-signature",
            HeaderValue::from_str(&format!("t={},v1=deadbeef", chrono::Utc::now().timestamp()))
                .unwrap(),
        );

        let response = handle_stripe_webhook(
            State(state),
            headers,
            Bytes::from_static(b"{\"type\":\"checkout.session.completed\"}"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        for mock in mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn verified_unhandled_event_is_acknowledged() {
        let mut server = mockito::Server::new_async().await;
        let mocks = store_mocks(&mut server).await;
        let state = test_state(server.url());

        let payload = br#"{"type":"invoice.created","data":{"object":{}}}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "stripe-signature",
            HeaderValue::from_str(&signature_for(payload)).unwrap(),
        );

        let response =
            handle_stripe_webhook(State(state), headers, Bytes::from_static(payload)).await;

        assert_eq!(response.status(), StatusCode::OK);
        for mock in mocks {
            mock.assert_async().await;
        }
    }
}
