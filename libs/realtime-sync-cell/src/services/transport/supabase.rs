use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::error::TransportError;
use super::{PollQuery, QueryApi, WriteApi};

/// PostgREST-backed query and write API.
pub struct SupabaseStore {
    supabase: Arc<SupabaseClient>,
    service_token: Option<String>,
}

impl SupabaseStore {
    pub fn new(config: &AppConfig) -> Self {
        let service_token = Some(config.supabase_service_token.clone()).filter(|t| !t.is_empty());
        Self {
            supabase: Arc::new(SupabaseClient::new(config)),
            service_token,
        }
    }

    fn token(&self) -> Option<&str> {
        self.service_token.as_deref()
    }
}

#[async_trait]
impl QueryApi for SupabaseStore {
    async fn query(&self, query: &PollQuery) -> Result<Vec<Value>, TransportError> {
        debug!("Polling {} for rows after {}", query.filter.table, query.created_after);
        self.supabase
            .select_rows(&query.to_rest_query(), self.token())
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}

#[async_trait]
impl WriteApi for SupabaseStore {
    async fn insert(&self, table: &str, fields: Value) -> Result<Value, TransportError> {
        self.supabase
            .insert_row(table, fields, self.token())
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn update(&self, table: &str, id: &str, fields: Value) -> Result<Value, TransportError> {
        self.supabase
            .update_row(table, id, fields, self.token())
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}
