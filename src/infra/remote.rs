//! JSON-over-HTTP implementation of [`RemoteSource`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cache::error::FetchError;
use crate::cache::keys::CacheKey;
use crate::domain::entities::{Category, Comment, FetchedBatch, Post, User};
use crate::remote::RemoteSource;

#[derive(Clone, Debug)]
pub struct HttpRemote {
    client: Client,
    base: Url,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let mut base = Url::parse(base_url)
            .map_err(|err| FetchError::InvalidRequest(format!("base url: {err}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| FetchError::InvalidRequest(err.to_string()))?;
        Ok(Self { client, base })
    }

    pub fn user_agent() -> &'static str {
        concat!("postcache/", env!("CARGO_PKG_VERSION"))
    }

    fn url(&self, path: &str) -> Result<Url, FetchError> {
        self.base
            .join(path)
            .map_err(|err| FetchError::InvalidRequest(format!("{path}: {err}")))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let url = self.url(path)?;
        debug!(target = "postcache::remote", url = %url, "GET");
        let resp = self.client.get(url).send().await.map_err(map_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }
        let bytes = resp.bytes().await.map_err(map_reqwest)?;
        serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode(err.to_string()))
    }

    /// Like [`Self::get`], but a 404 is an absent row rather than a failure.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, FetchError> {
        match self.get(path).await {
            Ok(value) => Ok(Some(value)),
            Err(FetchError::Status { status }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

fn map_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if err.is_decode() {
        FetchError::Decode(err.to_string())
    } else if err.is_builder() {
        FetchError::InvalidRequest(err.to_string())
    } else if let Some(status) = err.status() {
        FetchError::Status {
            status: status.as_u16(),
        }
    } else {
        FetchError::Connectivity(err.to_string())
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn fetch(&self, key: &CacheKey) -> Result<FetchedBatch, FetchError> {
        match key {
            CacheKey::AllPosts => Ok(FetchedBatch::posts(self.get::<Vec<Post>>("posts").await?)),
            CacheKey::Categories => Ok(FetchedBatch::categories(
                self.get::<Vec<Category>>("categories").await?,
            )),
            CacheKey::AuthorPosts(user) => Ok(FetchedBatch::posts(
                self.get::<Vec<Post>>(&format!("users/{user}/posts")).await?,
            )),
            CacheKey::CategoryPosts(category) => Ok(FetchedBatch::posts(
                self.get::<Vec<Post>>(&format!("categories/{category}/posts"))
                    .await?,
            )),
            CacheKey::PostDetail(id) => {
                let Some(post) = self.get_optional::<Post>(&format!("posts/{id}")).await? else {
                    return Ok(FetchedBatch::gone(*id));
                };
                let comments = self
                    .get::<Vec<Comment>>(&format!("posts/{id}/comments"))
                    .await?;
                let author = self
                    .get_optional::<User>(&format!("users/{}", post.author_id))
                    .await?;
                Ok(FetchedBatch {
                    posts: vec![post],
                    comments,
                    users: author.into_iter().collect(),
                    ..Default::default()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_resolve_under_base_prefix() {
        let remote =
            HttpRemote::new("https://blog.example.com/api/v1", Duration::from_secs(5)).expect("remote");
        assert_eq!(
            remote.url("posts/3/comments").expect("url").as_str(),
            "https://blog.example.com/api/v1/posts/3/comments"
        );
    }

    #[test]
    fn rejects_relative_base_url() {
        assert!(matches!(
            HttpRemote::new("not a url", Duration::from_secs(5)),
            Err(FetchError::InvalidRequest(_))
        ));
    }
}
