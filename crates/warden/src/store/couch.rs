//! CouchDB over HTTP

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};
use url::Url;

use super::{Document, DocumentStore, StoreError, WriteFailure};

/// CouchDB client sharing one connection pool per invocation
#[derive(Debug, Clone)]
pub struct CouchStore {
    http: Client,
    base: String,
    credentials: Option<(String, Option<String>)>,
}

impl CouchStore {
    pub fn new(
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, StoreError> {
        let parsed = Url::parse(url).map_err(|e| StoreError::Malformed(format!("{url}: {e}")))?;
        Ok(Self {
            http: Client::new(),
            base: parsed.as_str().trim_end_matches('/').to_string(),
            credentials: username.map(|u| (u.to_string(), password.map(str::to_string))),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.credentials {
            Some((ref user, ref password)) => builder.basic_auth(user, password.as_deref()),
            None => builder,
        }
    }

    async fn send(
        &self,
        method: &'static str,
        path: &str,
        builder: RequestBuilder,
    ) -> Result<Response, StoreError> {
        trace!(method, path, "Document store request");
        let response = self.authorize(builder).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Status {
            method,
            path: path.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
        response
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))
    }
}

/// `/` inside a database name must reach the server as `%2F`
fn db_path(db: &str) -> String {
    format!("/{}", urlencoding::encode(db))
}

#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    #[serde(default)]
    value: Option<RowValue>,
    #[serde(default)]
    doc: Option<Document>,
}

#[derive(Debug, Default, Deserialize)]
struct RowValue {
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    docs: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct BulkResult {
    #[serde(default)]
    id: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[async_trait]
impl DocumentStore for CouchStore {
    async fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        let path = "/_all_dbs";
        let response = self.send("GET", path, self.http.get(self.url(path))).await?;
        Self::decode(response).await
    }

    async fn create_database(&self, db: &str) -> Result<(), StoreError> {
        let path = db_path(db);
        match self.send("PUT", &path, self.http.put(self.url(&path))).await {
            Ok(_) => {
                debug!(db = %db, "Created database");
                Ok(())
            }
            Err(StoreError::Status { status, .. })
                if status == StatusCode::PRECONDITION_FAILED.as_u16() =>
            {
                trace!(db = %db, "Database already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_database(&self, db: &str) -> Result<(), StoreError> {
        let path = db_path(db);
        match self.send("DELETE", &path, self.http.delete(self.url(&path))).await {
            Ok(_) => {
                debug!(db = %db, "Deleted database");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn all_documents(&self, db: &str) -> Result<Vec<Document>, StoreError> {
        let path = format!("{}/_all_docs", db_path(db));
        let request = self
            .http
            .get(self.url(&path))
            .query(&[("include_docs", "true")]);
        let response: AllDocsResponse = Self::decode(self.send("GET", &path, request).await?).await?;

        Ok(response
            .rows
            .into_iter()
            .filter(|row| !row.value.as_ref().is_some_and(|v| v.deleted))
            .filter_map(|row| row.doc)
            .collect())
    }

    async fn find_one(
        &self,
        db: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Document>, StoreError> {
        let path = format!("{}/_find", db_path(db));
        let mut selector = serde_json::Map::new();
        selector.insert(field.to_string(), json!(value));
        let request = self.http.post(self.url(&path)).json(&json!({
            "selector": selector,
            "limit": 1,
        }));
        let response: FindResponse = Self::decode(self.send("POST", &path, request).await?).await?;
        Ok(response.docs.into_iter().next())
    }

    async fn bulk_write(
        &self,
        db: &str,
        docs: &[Document],
    ) -> Result<Vec<WriteFailure>, StoreError> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let path = format!("{}/_bulk_docs", db_path(db));
        let request = self
            .http
            .post(self.url(&path))
            .json(&json!({ "docs": docs }));
        let results: Vec<BulkResult> = Self::decode(self.send("POST", &path, request).await?).await?;

        Ok(results
            .into_iter()
            .filter_map(|result| {
                result.error.map(|error| WriteFailure {
                    id: result.id,
                    error,
                    reason: result.reason.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn delete_document(&self, db: &str, id: &str, rev: &str) -> Result<(), StoreError> {
        let path = format!("{}/{}", db_path(db), urlencoding::encode(id));
        let request = self.http.delete(self.url(&path)).query(&[("rev", rev)]);
        self.send("DELETE", &path, request).await?;
        debug!(db = %db, id = %id, "Deleted document");
        Ok(())
    }
}
