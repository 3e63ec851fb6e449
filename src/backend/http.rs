//! HTTP client for the hosted backend's REST layout.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::realtime::{self, ConnectPayload, SseDecoder, SseFrame, CONNECT_EVENT};
use super::{Backend, BackendError, ListQuery, RecordEvent, Subscription};
use crate::config::BackendConfig;
use crate::model::conversion::Fields;

const PAGE_SIZE: usize = 500;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    total_pages: u32,
    #[serde(default)]
    items: Vec<Value>,
}

/// Backend reached over HTTP. Realtime uses server-sent events.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
    // Long-lived event streams must not inherit the request timeout.
    realtime_client: reqwest::Client,
    /// collection -> realtime client id
    realtime: Arc<Mutex<HashMap<String, String>>>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(token)
                .map_err(|_| BackendError::Http("session token is not a valid header value".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers.clone())
            .timeout(config.timeout())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Http(e.to_string()))?;
        let realtime_client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Http(e.to_string()))?;

        Ok(HttpBackend {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            realtime_client,
            realtime: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn records_url(&self, collection: &str) -> String {
        format!("{}/api/collections/{}/records", self.base_url, collection)
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}", self.records_url(collection), id)
    }

    fn send_error(&self, error: reqwest::Error) -> BackendError {
        if error.is_connect() {
            BackendError::Connection(self.base_url.clone())
        } else if error.is_timeout() {
            BackendError::Http(format!("Request timed out: {}", error))
        } else {
            BackendError::Http(error.to_string())
        }
    }

    async fn check(response: Response, collection: &str, id: Option<&str>) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            if let Some(id) = id {
                return Err(BackendError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_error_body(status.as_u16(), &body))
    }

    async fn json(response: Response) -> Result<Value, BackendError> {
        response.json().await.map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn post_subscriptions(&self, client_id: &str, subscriptions: Vec<String>) -> Result<(), BackendError> {
        let url = format!("{}/api/realtime", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "clientId": client_id, "subscriptions": subscriptions }))
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        Self::check(response, "realtime", None).await?;
        Ok(())
    }
}

/// Subscription topic, with expand options encoded the way the backend
/// expects them (`topic?options={"query":{"expand":...}}`).
fn subscription_topic(collection: &str, pattern: &str, expand: Option<&str>) -> String {
    let topic = realtime::topic(collection, pattern);
    let Some(expand) = expand else {
        return topic;
    };
    let options = json!({ "query": { "expand": expand } }).to_string();
    match reqwest::Url::parse_with_params("http://localhost/", &[("options", options)]) {
        Ok(url) => format!("{}?{}", topic, url.query().unwrap_or_default()),
        Err(_) => topic,
    }
}

fn decode_event(frame: &SseFrame) -> Option<RecordEvent> {
    match serde_json::from_str::<RecordEvent>(&frame.data) {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::warn!(event = %frame.event, "Dropping undecodable realtime frame: {err}");
            None
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn create(&self, collection: &str, fields: Fields) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(self.records_url(collection))
            .json(&fields)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        Self::json(Self::check(response, collection, None).await?).await
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<Value, BackendError> {
        let response = self
            .client
            .patch(self.record_url(collection, id))
            .json(&fields)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        Self::json(Self::check(response, collection, Some(id)).await?).await
    }

    async fn get_one(&self, collection: &str, id: &str, expand: Option<&str>) -> Result<Value, BackendError> {
        let mut request = self.client.get(self.record_url(collection, id));
        if let Some(expand) = expand {
            request = request.query(&[("expand", expand)]);
        }
        let response = request.send().await.map_err(|e| self.send_error(e))?;
        Self::json(Self::check(response, collection, Some(id)).await?).await
    }

    async fn get_full_list(&self, collection: &str, query: &ListQuery) -> Result<Vec<Value>, BackendError> {
        let mut items = Vec::new();
        let mut page = 1u32;
        loop {
            let mut params = vec![
                ("page".to_string(), page.to_string()),
                ("perPage".to_string(), PAGE_SIZE.to_string()),
            ];
            if let Some(filter) = &query.filter {
                params.push(("filter".to_string(), filter.clone()));
            }
            if let Some(sort) = &query.sort {
                params.push(("sort".to_string(), sort.clone()));
            }
            if let Some(expand) = &query.expand {
                params.push(("expand".to_string(), expand.clone()));
            }

            let response = self
                .client
                .get(self.records_url(collection))
                .query(&params)
                .send()
                .await
                .map_err(|e| self.send_error(e))?;
            let response = Self::check(response, collection, None).await?;
            let batch: ListPage = response.json().await.map_err(|e| BackendError::Decode(e.to_string()))?;

            // The server may cap perPage below what was asked for.
            let received = batch.items.len();
            items.extend(batch.items);
            if received == 0 || batch.page >= batch.total_pages {
                break;
            }
            page += 1;
        }
        tracing::debug!(collection, count = items.len(), "Fetched full list");
        Ok(items)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(self.record_url(collection, id))
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        Self::check(response, collection, Some(id)).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: &str,
        pattern: &str,
        expand: Option<&str>,
    ) -> Result<Subscription, BackendError> {
        let url = format!("{}/api/realtime", self.base_url);
        let response = self
            .realtime_client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let response = Self::check(response, "realtime", None).await?;

        let mut body = response.bytes_stream().boxed();
        let mut decoder = SseDecoder::default();
        let mut backlog: VecDeque<SseFrame> = VecDeque::new();

        // The first frame names the client id the subscription is bound to.
        let client_id = loop {
            if let Some(index) = backlog.iter().position(|frame| frame.event == CONNECT_EVENT) {
                let frame = backlog.remove(index).unwrap_or_default();
                let payload: ConnectPayload = serde_json::from_str(&frame.data)
                    .map_err(|e| BackendError::Realtime(format!("bad connect frame: {}", e)))?;
                break payload.client_id;
            }
            match body.next().await {
                Some(Ok(chunk)) => backlog.extend(decoder.push(&chunk)),
                Some(Err(e)) => return Err(BackendError::Realtime(e.to_string())),
                None => return Err(BackendError::Realtime("stream closed before connect".to_string())),
            }
        };

        self.post_subscriptions(&client_id, vec![subscription_topic(collection, pattern, expand)])
            .await?;
        self.realtime
            .lock()
            .await
            .insert(collection.to_string(), client_id.clone());
        tracing::info!(collection, client_id = %client_id, "Realtime subscription active");

        let wanted = collection.to_string();
        let events = stream::unfold(
            (body, decoder, backlog),
            move |(mut body, mut decoder, mut backlog)| {
                let wanted = wanted.clone();
                async move {
                    loop {
                        while let Some(frame) = backlog.pop_front() {
                            if realtime::frame_matches(&frame, &wanted) {
                                if let Some(event) = decode_event(&frame) {
                                    return Some((event, (body, decoder, backlog)));
                                }
                            }
                        }
                        match body.next().await {
                            Some(Ok(chunk)) => backlog.extend(decoder.push(&chunk)),
                            Some(Err(err)) => {
                                tracing::warn!(collection = %wanted, "Realtime stream failed: {err}");
                                return None;
                            }
                            None => return None,
                        }
                    }
                }
            },
        );

        Ok(Subscription::new(collection, events.boxed()))
    }

    async fn unsubscribe(&self, collection: &str) -> Result<(), BackendError> {
        let client_id = self.realtime.lock().await.remove(collection);
        match client_id {
            Some(client_id) => {
                self.post_subscriptions(&client_id, Vec::new()).await?;
                tracing::info!(collection, "Realtime subscription closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
