#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use postcache::cache::{CacheConfig, CacheKey, CacheManager, FetchError, ManualClock};
use postcache::domain::entities::{Category, Comment, FetchedBatch, Post, User};
use postcache::domain::types::{CategoryId, CommentId, PostId, UserId};
use postcache::remote::RemoteSource;
use postcache::store::MemoryStore;
use time::OffsetDateTime;
use time::macros::datetime;
use tokio::sync::Semaphore;

pub const T0: OffsetDateTime = datetime!(2024-03-01 12:00 UTC);

pub fn post(id: i64, author: i64, category: Option<i64>, created_at: OffsetDateTime) -> Post {
    Post {
        id: PostId(id),
        title: format!("Post {id}"),
        content: format!("Body of post {id}"),
        image_url: None,
        author_id: UserId(author),
        category_id: category.map(CategoryId),
        like_count: 0,
        comment_count: 0,
        liked_by_me: false,
        created_at,
        updated_at: None,
        last_sync_time: OffsetDateTime::UNIX_EPOCH,
    }
}

pub fn category(id: i64, name: &str) -> Category {
    Category {
        id: CategoryId(id),
        name: name.to_string(),
        description: None,
        post_count: 0,
        last_sync_time: OffsetDateTime::UNIX_EPOCH,
    }
}

pub fn comment(id: i64, post_id: i64, created_at: OffsetDateTime) -> Comment {
    Comment {
        id: CommentId(id),
        post_id: PostId(post_id),
        author_id: UserId(1),
        content: format!("comment {id}"),
        created_at,
        last_sync_time: OffsetDateTime::UNIX_EPOCH,
    }
}

pub fn user(id: i64) -> User {
    User {
        id: UserId(id),
        username: format!("user{id}"),
        display_name: None,
        avatar_url: None,
        last_sync_time: OffsetDateTime::UNIX_EPOCH,
    }
}

/// Remote double that counts fetches per key and can hold them at a gate.
#[derive(Default)]
pub struct FakeRemote {
    responses: Mutex<HashMap<CacheKey, Result<FetchedBatch, FetchError>>>,
    calls: Mutex<HashMap<CacheKey, usize>>,
    total: AtomicUsize,
    gate: Option<Semaphore>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch waits until [`Self::release`] hands it a permit.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn respond(&self, key: CacheKey, response: Result<FetchedBatch, FetchError>) {
        self.responses
            .lock()
            .expect("responses lock")
            .insert(key, response);
    }

    pub fn release(&self, fetches: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(fetches);
        }
    }

    pub fn calls(&self, key: &CacheKey) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, expected: usize) {
        for _ in 0..400 {
            if self.total_calls() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("remote never reached {expected} calls");
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn fetch(&self, key: &CacheKey) -> Result<FetchedBatch, FetchError> {
        *self
            .calls
            .lock()
            .expect("calls lock")
            .entry(key.clone())
            .or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }

        self.responses
            .lock()
            .expect("responses lock")
            .get(key)
            .cloned()
            .unwrap_or_else(|| Ok(FetchedBatch::default()))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub remote: Arc<FakeRemote>,
    pub clock: Arc<ManualClock>,
    pub manager: CacheManager,
}

pub fn harness(remote: FakeRemote, config: CacheConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(remote);
    let clock = Arc::new(ManualClock::new(T0));
    let manager = CacheManager::new(store.clone(), remote.clone(), clock.clone(), config);
    Harness {
        store,
        remote,
        clock,
        manager,
    }
}

/// Poll until `check` holds, failing after roughly two seconds.
pub async fn eventually<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
