use super::{
    ApiError, ByteStream, ChatBackend, ChatQuery, DocumentInfo, DocumentList, HistoryRecord,
    HistoryResponse, Message, QueryResponse, TokenPair, User,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// HTTP client for the document chat backend.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(req: RequestBuilder, token: &str) -> RequestBuilder {
        req.header("Authorization", format!("Bearer {}", token))
    }

    /// Turn a non-2xx response into `ApiError::Api` carrying the body text.
    async fn check(resp: Response) -> Result<Response, ApiError> {
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ApiError::Api {
                status,
                message: text,
            });
        }
        Ok(resp)
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
        let resp = Self::check(resp).await?;
        resp.json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }

    // ── Chat ──

    /// Non-streaming variant of the chat endpoint; returns the whole answer.
    pub async fn query(&self, query: &ChatQuery) -> Result<String, ApiError> {
        let resp = self
            .client
            .post(self.url("/api/chat/query"))
            .json(query)
            .send()
            .await?;
        let data: QueryResponse = Self::json(resp).await?;
        Ok(data.response)
    }

    // ── Documents ──

    pub async fn list_documents(&self) -> Result<Vec<DocumentInfo>, ApiError> {
        let resp = self.client.get(self.url("/api/documents/")).send().await?;
        let data: DocumentList = Self::json(resp).await?;
        Ok(data.documents)
    }

    // ── Auth ──

    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, ApiError> {
        let resp = self
            .client
            .post(self.url("/api/auth/login"))
            .json(&LoginRequest { email, password })
            .send()
            .await?;
        Self::json(resp).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let resp = self
            .client
            .post(self.url("/api/auth/refresh"))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;
        Self::json(resp).await
    }

    /// Revoke a refresh token. The access token is attached when available,
    /// but logout must also work after it expired.
    pub async fn logout(
        &self,
        access_token: Option<&str>,
        refresh_token: &str,
    ) -> Result<(), ApiError> {
        let mut req = self
            .client
            .post(self.url("/api/auth/logout"))
            .json(&RefreshRequest { refresh_token });
        if let Some(token) = access_token {
            req = Self::bearer(req, token);
        }
        Self::check(req.send().await?).await?;
        Ok(())
    }

    pub async fn me(&self, token: &str) -> Result<User, ApiError> {
        let req = Self::bearer(self.client.get(self.url("/api/auth/me")), token);
        Self::json(req.send().await?).await
    }
}

#[async_trait]
impl ChatBackend for ApiClient {
    async fn open_chat_stream(&self, query: &ChatQuery) -> Result<ByteStream, ApiError> {
        let resp = self
            .client
            .post(self.url("/api/chat/"))
            .header("Content-Type", "application/json")
            .json(query)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(ApiError::from))
            .boxed())
    }

    async fn fetch_history(&self, token: &str) -> Result<Vec<Message>, ApiError> {
        let req = Self::bearer(self.client.get(self.url("/api/chat/history")), token);
        let data: HistoryResponse = Self::json(req.send().await?).await?;
        Ok(data.messages)
    }

    async fn append_history(&self, token: &str, record: &HistoryRecord) -> Result<(), ApiError> {
        let req = Self::bearer(self.client.post(self.url("/api/chat/history")), token).json(record);
        Self::check(req.send().await?).await?;
        Ok(())
    }

    async fn clear_history(&self, token: &str) -> Result<(), ApiError> {
        let req = Self::bearer(self.client.delete(self.url("/api/chat/history")), token);
        Self::check(req.send().await?).await?;
        Ok(())
    }
}
