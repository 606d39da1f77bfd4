//! REST API Client
//!
//! History pages and optimistic-mutation endpoints. Every request carries
//! the configured timeout and, when a token is set, a bearer header.

use crate::client::config::Config;
use crate::client::error::{HistoryFetchError, MutationError};
use crate::client::optimistic::MutationApi;
use crate::client::stream::HistorySource;
use crate::shared::{EntityId, Message, Notification, Topic};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// History endpoints answer either with a bare array or a paged object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PageBody<T> {
    Items(Vec<T>),
    Paged { content: Vec<T> },
}

impl<T> PageBody<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            PageBody::Items(items) | PageBody::Paged { content: items } => items,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LikeCountResponse {
    like_count: u64,
}

/// REST client
#[derive(Debug, Clone)]
pub struct RestApi {
    config: Config,
    client: Client,
}

impl RestApi {
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.get_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str, page: u32, size: u32) -> Result<Vec<T>, HistoryFetchError> {
        let url = self.config.api_url(path);
        tracing::debug!(%url, page, size, "Fetching history page");
        let response = self
            .authorize(self.client.get(&url))
            .query(&[("page", page), ("size", size)])
            .send()
            .await
            .map_err(|e| HistoryFetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HistoryFetchError::Status {
                status: status.as_u16(),
            });
        }
        response
            .json::<PageBody<T>>()
            .await
            .map(PageBody::into_items)
            .map_err(|e| HistoryFetchError::Decode(e.to_string()))
    }

    async fn mutate(&self, request: RequestBuilder) -> Result<Response, MutationError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| MutationError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MutationError::Status {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn like_count(&self, path: &str) -> Result<u64, MutationError> {
        let response = self.mutate(self.client.post(self.config.api_url(path))).await?;
        response
            .json::<LikeCountResponse>()
            .await
            .map(|body| body.like_count)
            .map_err(|e| MutationError::Decode(e.to_string()))
    }
}

#[async_trait]
impl HistorySource<Message> for RestApi {
    async fn fetch_page(&self, topic: &Topic, page: u32, size: u32) -> Result<Vec<Message>, HistoryFetchError> {
        let Some(room) = topic.room_id() else {
            return Err(HistoryFetchError::Decode(format!("{topic} has no message history")));
        };
        self.fetch(&format!("/chat/rooms/{room}/messages"), page, size).await
    }
}

#[async_trait]
impl HistorySource<Notification> for RestApi {
    async fn fetch_page(&self, _topic: &Topic, page: u32, size: u32) -> Result<Vec<Notification>, HistoryFetchError> {
        self.fetch("/notifications", page, size).await
    }
}

#[async_trait]
impl MutationApi for RestApi {
    async fn like(&self, entity_id: EntityId) -> Result<u64, MutationError> {
        self.like_count(&format!("/posts/{entity_id}/like")).await
    }

    async fn dislike(&self, entity_id: EntityId) -> Result<u64, MutationError> {
        self.like_count(&format!("/posts/{entity_id}/dislike")).await
    }

    async fn mark_read(&self, notification_id: EntityId) -> Result<(), MutationError> {
        let url = self.config.api_url(&format!("/notifications/{notification_id}/read"));
        self.mutate(self.client.patch(url)).await?;
        Ok(())
    }
}
