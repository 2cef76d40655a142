use anyhow::{anyhow, Context};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Serialize};

/// Admin-privileged PostgREST client for the managed Supabase store.
#[derive(Clone)]
pub struct SupabaseClient {
    base_url: String,
    http: reqwest::Client,
}

impl SupabaseClient {
    pub fn new(base_url: String, service_role_key: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "apikey",
            HeaderValue::from_str(service_role_key).context("invalid Supabase service role key")?,
        );
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", service_role_key))
            .context("invalid Supabase service role key")?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to create Supabase HTTP client")?;

        Ok(Self { base_url, http })
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        let response = self
            .http
            .get(format!("{}/rest/v1/", self.base_url.trim_end_matches('/')))
            .send()
            .await
            .with_context(|| format!("Supabase ping failed (base_url={})", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Supabase ping returned status {}", status));
        }
        Ok(())
    }

    /// Point lookup returning the first matching row, if any.
    pub async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
        columns: &str,
    ) -> anyhow::Result<Option<T>> {
        let response = self
            .http
            .get(self.table_url(table))
            .query(filters)
            .query(&[("select", columns), ("limit", "1")])
            .send()
            .await
            .with_context(|| format!("Supabase select failed for {}", table))?;

        let body = check_response(response, "select", table).await?;
        let rows: Vec<T> = serde_json::from_str(&body)
            .with_context(|| format!("failed to decode Supabase rows for {}", table))?;
        Ok(rows.into_iter().next())
    }

    pub async fn update<T: Serialize>(
        &self,
        table: &str,
        filters: &[(&str, String)],
        changes: &T,
    ) -> anyhow::Result<()> {
        let response = self
            .http
            .patch(self.table_url(table))
            .query(filters)
            .header("Prefer", "return=minimal")
            .json(changes)
            .send()
            .await
            .with_context(|| format!("Supabase update failed for {}", table))?;

        check_response(response, "update", table).await?;
        Ok(())
    }

    /// Insert-or-update keyed on the `on_conflict` column.
    pub async fn upsert<T: Serialize>(
        &self,
        table: &str,
        on_conflict: &str,
        row: &T,
    ) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.table_url(table))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row)
            .send()
            .await
            .with_context(|| format!("Supabase upsert failed for {}", table))?;

        check_response(response, "upsert", table).await?;
        Ok(())
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), table)
    }
}

async fn check_response(
    response: reqwest::Response,
    operation: &str,
    table: &str,
) -> anyhow::Result<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("failed to read Supabase {} response for {}", operation, table))?;

    if !status.is_success() {
        return Err(anyhow!(
            "Supabase {} on {} failed with status {}: {}",
            operation,
            table,
            status,
            body
        ));
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct UserIdRow {
        user_id: String,
    }

    #[tokio::test]
    async fn select_one_returns_first_row() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/v1/subscriptions")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("stripe_subscription_id".into(), "eq.sub_123".into()),
                mockito::Matcher::UrlEncoded("select".into(), "user_id".into()),
                mockito::Matcher::UrlEncoded("limit".into(), "1".into()),
            ]))
            .with_status(200)
            .with_body(r#"[{"user_id":"user-1"}]"#)
            .create_async()
            .await;

        let client = SupabaseClient::new(server.url(), "service-role-key").unwrap();
        let row: Option<UserIdRow> = client
            .select_one(
                "subscriptions",
                &[("stripe_subscription_id", "eq.sub_123".to_string())],
                "user_id",
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(row.unwrap().user_id, "user-1");
    }

    #[tokio::test]
    async fn select_one_returns_none_for_empty_result() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/rest/v1/subscriptions")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = SupabaseClient::new(server.url(), "service-role-key").unwrap();
        let row: Option<UserIdRow> = client
            .select_one(
                "subscriptions",
                &[("stripe_subscription_id", "eq.sub_missing".to_string())],
                "user_id",
            )
            .await
            .unwrap();

        assert!(row.is_none());
    }

    #[tokio::test]
    async fn upsert_sends_merge_duplicates_preference() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/rest/v1/subscriptions")
            .match_query(mockito::Matcher::UrlEncoded(
                "on_conflict".into(),
                "user_id".into(),
            ))
            .match_header("Prefer", "resolution=merge-duplicates,return=minimal")
            .with_status(201)
            .create_async()
            .await;

        let client = SupabaseClient::new(server.url(), "service-role-key").unwrap();
        client
            .upsert(
                "subscriptions",
                "user_id",
                &json!({ "user_id": "user-1", "status": "active" }),
            )
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn update_surfaces_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PATCH", "/rest/v1/subscriptions")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body(r#"{"message":"boom"}"#)
            .create_async()
            .await;

        let client = SupabaseClient::new(server.url(), "service-role-key").unwrap();
        let result = client
            .update(
                "subscriptions",
                &[("user_id", "eq.user-1".to_string())],
                &json!({ "status": "canceled" }),
            )
            .await;

        let message = result.unwrap_err().to_string();
        assert!(message.contains("status 500"), "unexpected error: {message}");
    }
}
