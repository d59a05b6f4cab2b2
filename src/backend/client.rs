use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::{
    Backend, BackendError, Bucket, Filter, InsertOptions, NewBucket, Privilege, Query,
};
use crate::config::BackendConfig;

/// HTTP implementation of [`Backend`] on top of `reqwest`.
pub struct RestBackend {
    base_url: String,
    config: BackendConfig,
    client: Client,
}

impl RestBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let base_url = config.url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(BackendError::InvalidRequest(
                "backend URL is not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("shopkeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(BackendError::Transport)?;

        Ok(Self {
            base_url,
            config: config.clone(),
            client,
        })
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path)
    }

    fn storage_url(&self, path: &str) -> String {
        format!("{}/storage/v1/{}", self.base_url, path)
    }

    /// Service requests fall back to the anon key when no service key is configured.
    fn credentials(&self, privilege: Privilege) -> Result<&str, BackendError> {
        let key = match privilege {
            Privilege::Anon => self.config.key(Privilege::Anon),
            Privilege::Service => self
                .config
                .key(Privilege::Service)
                .or_else(|| self.config.key(Privilege::Anon)),
        };
        key.ok_or_else(|| {
            BackendError::InvalidRequest(format!("no API key configured for {:?} access", privilege))
        })
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        privilege: Privilege,
    ) -> Result<RequestBuilder, BackendError> {
        let key = self.credentials(privilege)?;
        trace!(%method, url, ?privilege, "Backend request");

        let mut builder = self
            .client
            .request(method, url)
            .header("apikey", key)
            .header(header::AUTHORIZATION, format!("Bearer {}", key));

        if self.config.schema != "public" {
            builder = builder
                .header("Accept-Profile", self.config.schema.as_str())
                .header("Content-Profile", self.config.schema.as_str());
        }
        Ok(builder)
    }

    async fn check(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_response(status, &body))
    }

    async fn read_json(response: Response) -> Result<Value, BackendError> {
        let response = Self::check(response).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))
    }

    fn into_rows(value: Value) -> Result<Vec<Value>, BackendError> {
        match value {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Err(BackendError::Decode(format!(
                "expected a JSON array of rows, got {}",
                short_type(&other)
            ))),
        }
    }

    fn require_filters(operation: &str, filters: &[Filter]) -> Result<(), BackendError> {
        if filters.is_empty() {
            return Err(BackendError::InvalidRequest(format!(
                "{} without filters would touch every row",
                operation
            )));
        }
        Ok(())
    }
}

fn short_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`
pub fn parse_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Some exec-SQL functions trap exceptions and answer `{"success": false, "error": ".."}`.
fn sql_rejection(body: &Value) -> Option<String> {
    let object = body.as_object()?;
    let failed = object.get("success").and_then(Value::as_bool) == Some(false);
    let error = object
        .get("error")
        .and_then(Value::as_str)
        .filter(|e| !e.is_empty());

    match (failed, error) {
        (_, Some(error)) => Some(error.to_string()),
        (true, None) => Some(
            object
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("exec_sql reported failure")
                .to_string(),
        ),
        (false, None) => None,
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn select(
        &self,
        table: &str,
        query: &Query,
        privilege: Privilege,
    ) -> Result<Vec<Value>, BackendError> {
        let response = self
            .request(Method::GET, &self.rest_url(table), privilege)?
            .query(&query.to_pairs())
            .send()
            .await?;
        Self::into_rows(Self::read_json(response).await?)
    }

    async fn count(
        &self,
        table: &str,
        filters: &[Filter],
        privilege: Privilege,
    ) -> Result<u64, BackendError> {
        let mut query = Query::new().limit(1);
        query.filters = filters.to_vec();

        let response = self
            .request(Method::GET, &self.rest_url(table), privilege)?
            .query(&query.to_pairs())
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = Self::check(response).await?;

        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| {
                BackendError::Decode(format!("missing or invalid Content-Range for {}", table))
            })
    }

    async fn insert(
        &self,
        table: &str,
        rows: &[Value],
        options: &InsertOptions,
    ) -> Result<Vec<Value>, BackendError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = self
            .request(Method::POST, &self.rest_url(table), Privilege::Service)?
            .header("Prefer", options.prefer_header())
            .json(rows);
        if let Some(column) = &options.on_conflict {
            builder = builder.query(&[("on_conflict", column.as_str())]);
        }

        debug!(table, rows = rows.len(), on_conflict = ?options.on_conflict, "Inserting rows");
        let response = builder.send().await?;
        Self::into_rows(Self::read_json(response).await?)
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &Value,
    ) -> Result<Vec<Value>, BackendError> {
        Self::require_filters("update", filters)?;
        let pairs: Vec<(String, String)> = filters.iter().map(Filter::to_pair).collect();

        let response = self
            .request(Method::PATCH, &self.rest_url(table), Privilege::Service)?
            .query(&pairs)
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await?;
        Self::into_rows(Self::read_json(response).await?)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64, BackendError> {
        Self::require_filters("delete", filters)?;
        let pairs: Vec<(String, String)> = filters.iter().map(Filter::to_pair).collect();

        let response = self
            .request(Method::DELETE, &self.rest_url(table), Privilege::Service)?
            .query(&pairs)
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let rows = Self::into_rows(Self::read_json(response).await?)?;
        Ok(rows.len() as u64)
    }

    async fn rpc(
        &self,
        function: &str,
        args: &Value,
        privilege: Privilege,
    ) -> Result<Value, BackendError> {
        let url = self.rest_url(&format!("rpc/{}", function));
        let response = self
            .request(Method::POST, &url, privilege)?
            .json(args)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn exec_sql(&self, sql: &str) -> Result<(), BackendError> {
        let mut args = Map::new();
        args.insert(self.config.exec_sql_arg.clone(), Value::String(sql.to_string()));

        let body = self
            .rpc(
                &self.config.exec_sql_function,
                &Value::Object(args),
                Privilege::Service,
            )
            .await?;

        match sql_rejection(&body) {
            Some(message) => Err(BackendError::SqlRejected(message)),
            None => Ok(()),
        }
    }

    async fn list_buckets(&self) -> Result<Vec<Bucket>, BackendError> {
        let response = self
            .request(Method::GET, &self.storage_url("bucket"), Privilege::Service)?
            .send()
            .await?;
        let value = Self::read_json(response).await?;
        serde_json::from_value(value).map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn create_bucket(&self, bucket: &NewBucket) -> Result<(), BackendError> {
        let response = self
            .request(Method::POST, &self.storage_url("bucket"), Privilege::Service)?
            .json(bucket)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let response = self
            .request(Method::GET, &self.rest_url(""), Privilege::Anon)
            .or_else(|_| self.request(Method::GET, &self.rest_url(""), Privilege::Service))?
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, headers, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> BackendConfig {
        BackendConfig {
            url: server.uri(),
            anon_key: Some("anon-key".to_string()),
            service_key: Some("service-key".to_string()),
            ..BackendConfig::default()
        }
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-0/*"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn test_sql_rejection_shapes() {
        assert_eq!(sql_rejection(&Value::Null), None);
        assert_eq!(sql_rejection(&json!({"success": true})), None);
        assert_eq!(
            sql_rejection(&json!({"success": false, "error": "relation \"x\" does not exist"})),
            Some("relation \"x\" does not exist".to_string())
        );
        assert_eq!(
            sql_rejection(&json!({"success": false})),
            Some("exec_sql reported failure".to_string())
        );
    }

    #[test]
    fn test_new_requires_url() {
        let result = RestBackend::new(&BackendConfig::default());
        assert!(matches!(result, Err(BackendError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_select_sends_filters_and_keys() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/customers"))
            .and(query_param("select", "id,phone"))
            .and(query_param("phone", "eq.+255712345678"))
            .and(header("apikey", "anon-key"))
            .and(header("authorization", "Bearer anon-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"id": "c1", "phone": "+255712345678"}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let backend = RestBackend::new(&config_for(&server)).unwrap();
        let query = Query::new()
            .columns("id,phone")
            .filter(Filter::eq("phone", "+255712345678"));
        let rows = backend
            .select("customers", &query, Privilege::Anon)
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "c1");
    }

    #[tokio::test]
    async fn test_count_reads_content_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/customers"))
            .and(header("prefer", "count=exact"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "0-0/3573")
                    .set_body_json(json!([{"id": "c1"}])),
            )
            .mount(&server)
            .await;

        let backend = RestBackend::new(&config_for(&server)).unwrap();
        let total = backend
            .count("customers", &[], Privilege::Service)
            .await
            .unwrap();
        assert_eq!(total, 3573);
    }

    #[tokio::test]
    async fn test_insert_upsert_uses_on_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/customers"))
            .and(query_param("on_conflict", "phone"))
            .and(headers(
                "prefer",
                vec!["return=representation", "resolution=ignore-duplicates"],
            ))
            .and(header("apikey", "service-key"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([{"id": "c9"}])))
            .expect(1)
            .mount(&server)
            .await;

        let backend = RestBackend::new(&config_for(&server)).unwrap();
        let rows = backend
            .insert(
                "customers",
                &[json!({"phone": "+255712000009"})],
                &InsertOptions::upsert("phone"),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_nothing_makes_no_request() {
        let server = MockServer::start().await;
        let backend = RestBackend::new(&config_for(&server)).unwrap();
        let rows = backend
            .insert("customers", &[], &InsertOptions::default())
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete_refuse_without_filters() {
        let server = MockServer::start().await;
        let backend = RestBackend::new(&config_for(&server)).unwrap();

        let update = backend.update("customers", &[], &json!({"is_active": false})).await;
        assert!(matches!(update, Err(BackendError::InvalidRequest(_))));

        let delete = backend.delete("customers", &[]).await;
        assert!(matches!(delete, Err(BackendError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_exec_sql_posts_configured_argument() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/exec_sql"))
            .and(body_json(json!({"sql": "SELECT 1"})))
            .and(header("apikey", "service-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .expect(1)
            .mount(&server)
            .await;

        let backend = RestBackend::new(&config_for(&server)).unwrap();
        backend.exec_sql("SELECT 1").await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_sql_reports_rejection_in_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/exec_sql"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "error": "syntax error at or near \"TABL\""})),
            )
            .mount(&server)
            .await;

        let backend = RestBackend::new(&config_for(&server)).unwrap();
        let err = backend.exec_sql("CREATE TABL x ()").await.unwrap_err();
        assert!(matches!(err, BackendError::SqlRejected(ref m) if m.contains("syntax error")));
    }

    #[tokio::test]
    async fn test_http_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/exec_sql"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "code": "PGRST202",
                "message": "Could not find the function public.exec_sql(sql) in the schema cache",
                "details": null,
                "hint": null
            })))
            .mount(&server)
            .await;

        let backend = RestBackend::new(&config_for(&server)).unwrap();
        let err = backend.exec_sql("SELECT 1").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Could not find the function"));
    }

    #[tokio::test]
    async fn test_service_falls_back_to_anon_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/bucket"))
            .and(header("apikey", "anon-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "product-images", "name": "product-images", "public": true, "created_at": "2025-09-01T00:00:00Z"}
            ])))
            .mount(&server)
            .await;

        let mut config = config_for(&server);
        config.service_key = None;
        let backend = RestBackend::new(&config).unwrap();
        let buckets = backend.list_buckets().await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert!(buckets[0].public);
    }
}
