use anyhow::{Result, anyhow};
use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION},
    Method, RequestBuilder,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

/// PostgREST row filter, rendered as `column=op.value` query pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct RestQuery {
    pub table: String,
    filters: Vec<(String, String)>,
    order: Option<String>,
    limit: Option<usize>,
}

impl RestQuery {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.filters.push((column.to_string(), format!("eq.{}", value)));
        self
    }

    pub fn gt(mut self, column: &str, value: &str) -> Self {
        self.filters.push((column.to_string(), format!("gt.{}", value)));
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        let direction = if ascending { "asc" } else { "desc" };
        self.order = Some(format!("{}.{}", column, direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), "*".to_string())];
        pairs.extend(self.filters.iter().cloned());
        if let Some(order) = &self.order {
            pairs.push(("order".to_string(), order.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.clone(),
            anon_key: config.supabase_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token.filter(|t| !t.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?
            );
        }

        Ok(headers)
    }

    pub async fn request<T>(&self, method: Method, path: &str,
                            auth_token: Option<&str>, body: Option<Value>)
                            -> Result<T>
    where T: DeserializeOwned {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let mut req = self.client.request(method, &url)
            .headers(self.get_headers(auth_token)?);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        self.send(req).await
    }

    /// `GET /rest/v1/{table}` with the query's filters, ordering and limit.
    pub async fn select_rows(&self, query: &RestQuery, auth_token: Option<&str>) -> Result<Vec<Value>> {
        let url = format!("{}/rest/v1/{}", self.base_url, query.table);
        debug!("Selecting rows from {}", query.table);

        let req = self.client.get(&url)
            .headers(self.get_headers(auth_token)?)
            .query(&query.query_pairs());

        self.send(req).await
    }

    /// Inserts one row and returns the stored representation (server id and timestamps).
    pub async fn insert_row(&self, table: &str, fields: Value, auth_token: Option<&str>) -> Result<Value> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        debug!("Inserting row into {}", table);

        let req = self.client.post(&url)
            .headers(self.get_headers(auth_token)?)
            .header("Prefer", "return=representation")
            .json(&fields);

        let rows: Vec<Value> = self.send(req).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| anyhow!("Insert into {} returned no representation", table))
    }

    pub async fn update_row(&self, table: &str, id: &str, fields: Value, auth_token: Option<&str>) -> Result<Value> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        debug!("Updating row {} in {}", id, table);

        let req = self.client.patch(&url)
            .headers(self.get_headers(auth_token)?)
            .header("Prefer", "return=representation")
            .query(&[("id", format!("eq.{}", id))])
            .json(&fields);

        let rows: Vec<Value> = self.send(req).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| anyhow!("Resource not found: {} row {}", table, id))
    }

    async fn send<T>(&self, req: RequestBuilder) -> Result<T>
    where T: DeserializeOwned {
        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);

            return Err(match status.as_u16() {
                401 | 403 => anyhow!("Authentication error: {}", error_text),
                404 => anyhow!("Resource not found: {}", error_text),
                _ => anyhow!("API error ({}): {}", status, error_text),
            });
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_follow_postgrest_syntax() {
        let query = RestQuery::new("sos_events")
            .eq("status", "active")
            .gt("created_at", "2024-01-01T00:00:00Z")
            .order_by("created_at", false)
            .limit(5);

        assert_eq!(query.query_pairs(), vec![
            ("select".to_string(), "*".to_string()),
            ("status".to_string(), "eq.active".to_string()),
            ("created_at".to_string(), "gt.2024-01-01T00:00:00Z".to_string()),
            ("order".to_string(), "created_at.desc".to_string()),
            ("limit".to_string(), "5".to_string()),
        ]);
    }

    #[test]
    fn bare_query_selects_everything() {
        let query = RestQuery::new("chat_messages");
        assert_eq!(query.query_pairs(), vec![("select".to_string(), "*".to_string())]);
    }
}
