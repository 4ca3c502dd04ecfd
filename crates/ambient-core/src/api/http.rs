//! HTTP implementation of the API client and watch source

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::{ApiClient, ListPage, SessionStatusPatch};
use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::resources::{ResourceKind, ResourceObject, Session};
use crate::watch::{WatchSource, WatchStream, WireWatchEvent};

const API_PREFIX: &str = "/api/ambient/v1";

/// Talks JSON to the Ambient API server. Watches are newline-delimited JSON
/// streams at `{kind}/watch`.
pub struct HttpApiClient {
    client: reqwest::Client,
    /// No overall timeout: watch streams stay open indefinitely.
    stream_client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    total: usize,
}

impl HttpApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            stream_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}/{}", self.base_url, API_PREFIX, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response, what: &str) -> Result<Response, ApiError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn list(&self, kind: ResourceKind, page: u32, size: u32) -> Result<ListPage, ApiError> {
        let request = self
            .client
            .get(self.url(kind.as_str()))
            .query(&[("page", page), ("size", size)]);
        let response = self.authorized(request).send().await?;
        let response = Self::check(response, kind.as_str()).await?;
        let body: ListResponse = serde_json::from_slice(&response.bytes().await?)?;

        let items = body
            .items
            .into_iter()
            .map(|item| ResourceObject::decode(kind, item))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ListPage {
            items,
            total: body.total,
        })
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        patch: &SessionStatusPatch,
    ) -> Result<Session, ApiError> {
        let request = self
            .client
            .patch(self.url(&format!("sessions/{}/status", session_id)))
            .json(patch);
        let response = self.authorized(request).send().await?;
        let response = Self::check(response, session_id).await?;
        Ok(serde_json::from_slice(&response.bytes().await?)?)
    }
}

#[async_trait]
impl WatchSource for HttpApiClient {
    async fn open(&self, kind: ResourceKind) -> Result<WatchStream, ApiError> {
        let request = self
            .stream_client
            .get(self.url(&format!("{}/watch", kind.as_str())))
            .header(reqwest::header::ACCEPT, "application/x-ndjson");
        let response = self.authorized(request).send().await?;
        let response = Self::check(response, kind.as_str()).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ApiError::from))
            .boxed();
        Ok(decode_ndjson(bytes))
    }
}

struct NdjsonState {
    bytes: BoxStream<'static, Result<Bytes, ApiError>>,
    buf: Vec<u8>,
    done: bool,
}

/// Split a byte stream into newline-delimited JSON watch messages.
/// A transport error ends the stream after being yielded.
fn decode_ndjson(bytes: BoxStream<'static, Result<Bytes, ApiError>>) -> WatchStream {
    let state = NdjsonState {
        bytes,
        buf: Vec::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let item = serde_json::from_str::<WireWatchEvent>(text).map_err(ApiError::from);
                return Some((item, state));
            }

            if state.done {
                let rest = std::mem::take(&mut state.buf);
                let text = String::from_utf8_lossy(&rest);
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                let item = serde_json::from_str::<WireWatchEvent>(text).map_err(ApiError::from);
                return Some((item, state));
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.buf.clear();
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}
