mod support;

use std::collections::BTreeSet;
use std::time::Duration;

use postcache::cache::{CacheConfig, CacheKey, EventKind, Freshness};
use postcache::domain::entities::{Comment, FetchedBatch, Post};
use postcache::domain::types::{CategoryId, PostId, UserId};
use postcache::store::{CacheStore, CachedPayload, StoreCounts};

use support::{FakeRemote, T0, category, comment, harness, post, user};

const SECOND: Duration = Duration::from_secs(1);

fn synced_post(id: i64, synced_at: time::OffsetDateTime) -> Post {
    Post {
        last_sync_time: synced_at,
        ..post(id, 1, None, T0)
    }
}

#[tokio::test]
async fn capacity_keeps_the_most_recently_synced_posts() {
    let h = harness(FakeRemote::new(), CacheConfig::default());
    let posts: Vec<Post> = (1..=250)
        .map(|id| synced_post(id, T0 + SECOND * id as u32))
        .collect();
    h.store
        .upsert(&FetchedBatch::posts(posts))
        .await
        .expect("seed");

    let report = h
        .manager
        .eviction()
        .evict_over_capacity()
        .await
        .expect("evict");
    assert_eq!(report.posts, 50);

    let counts = h.store.counts().await.expect("counts");
    assert_eq!(counts.posts, 200);

    let view = h.store.load(&CacheKey::AllPosts).await.expect("load");
    let CachedPayload::Posts { posts } = view.payload else {
        panic!("expected posts");
    };
    let kept: BTreeSet<i64> = posts.iter().map(|post| post.id.0).collect();
    let expected: BTreeSet<i64> = (51..=250).collect();
    assert_eq!(kept, expected);

    let again = h
        .manager
        .eviction()
        .evict_over_capacity()
        .await
        .expect("evict again");
    assert!(again.is_empty());
}

#[tokio::test]
async fn capacity_trims_comments_per_post() {
    let h = harness(FakeRemote::new(), CacheConfig::default());
    let comments = (1..=120)
        .map(|id| comment(id, 1, T0))
        .map(|c| Comment {
            last_sync_time: T0 + SECOND * c.id.0 as u32,
            ..c
        })
        .chain((200..205).map(|id| comment(id, 2, T0)))
        .collect();
    h.store
        .upsert(&FetchedBatch {
            posts: vec![synced_post(1, T0), synced_post(2, T0)],
            comments,
            ..Default::default()
        })
        .await
        .expect("seed");

    let report = h
        .manager
        .eviction()
        .evict_over_capacity()
        .await
        .expect("evict");
    assert_eq!(report.comments, 20);
    assert_eq!(
        h.store.count_comments_for(PostId(1)).await.expect("count"),
        100
    );
    assert_eq!(
        h.store.count_comments_for(PostId(2)).await.expect("count"),
        5
    );

    let view = h
        .store
        .load(&CacheKey::PostDetail(PostId(1)))
        .await
        .expect("load");
    let CachedPayload::PostDetail { comments, .. } = view.payload else {
        panic!("expected detail");
    };
    assert_eq!(comments.first().map(|c| c.id.0), Some(21));
}

#[tokio::test]
async fn deleting_a_post_leaves_no_orphan_comments() {
    let h = harness(FakeRemote::new(), CacheConfig::default());
    h.store
        .upsert(&FetchedBatch {
            posts: vec![synced_post(1, T0), synced_post(2, T0)],
            comments: vec![comment(10, 1, T0), comment(11, 1, T0), comment(20, 2, T0)],
            ..Default::default()
        })
        .await
        .expect("seed");

    let report = h.store.delete_posts(&[PostId(1)]).await.expect("delete");
    assert_eq!(report.posts, 1);
    assert_eq!(report.comments, 2);

    assert_eq!(h.store.count_comments_for(PostId(1)).await.expect("count"), 0);
    assert_eq!(h.store.count_comments_for(PostId(2)).await.expect("count"), 1);
}

#[tokio::test]
async fn retention_drops_rows_older_than_a_day() {
    let h = harness(FakeRemote::new(), CacheConfig::default());
    h.manager
        .refresh(&CacheKey::Categories)
        .await
        .expect("metadata at T0");
    h.store
        .upsert(&FetchedBatch {
            posts: vec![synced_post(1, T0)],
            comments: vec![Comment {
                last_sync_time: T0,
                ..comment(1, 1, T0)
            }],
            ..Default::default()
        })
        .await
        .expect("seed");

    let day = Duration::from_secs(24 * 60 * 60);
    h.clock.set(T0 + day);
    let report = h
        .manager
        .eviction()
        .evict_expired(T0 + day)
        .await
        .expect("at boundary");
    assert!(report.is_empty());

    h.clock.set(T0 + day + SECOND);
    let mut events = h.manager.events().subscribe();
    let report = h.manager.eviction().run().await.expect("past boundary");
    assert_eq!(report.posts, 1);
    assert_eq!(report.comments, 1);
    assert_eq!(report.metadata, 1);
    assert_eq!(
        events.recv().await.expect("event").kind,
        EventKind::Evicted { report }
    );
}

#[tokio::test]
async fn clear_all_twice_leaves_every_table_empty() {
    let h = harness(FakeRemote::new(), CacheConfig::default());
    h.store
        .upsert(&FetchedBatch {
            posts: vec![synced_post(1, T0)],
            categories: vec![category(1, "rust")],
            comments: vec![comment(1, 1, T0)],
            users: vec![user(1)],
            ..Default::default()
        })
        .await
        .expect("seed");
    h.manager
        .refresh(&CacheKey::AllPosts)
        .await
        .expect("metadata");

    let first = h.manager.clear_all_cache().await.expect("clear");
    assert_eq!(first.posts, 1);
    assert_eq!(first.metadata, 1);

    let second = h.manager.clear_all_cache().await.expect("clear again");
    assert!(second.is_empty());
    assert_eq!(h.store.counts().await.expect("counts"), StoreCounts::default());
}

#[tokio::test]
async fn evicted_post_is_refetched_instead_of_served_fresh_and_empty() {
    let config = CacheConfig {
        max_cached_posts: 1,
        ..CacheConfig::default()
    };
    let h = harness(FakeRemote::new(), config);
    let detail = CacheKey::PostDetail(PostId(1));
    let by_author = CacheKey::AuthorPosts(UserId(7));
    let by_category = CacheKey::CategoryPosts(CategoryId(3));
    h.remote.respond(
        detail.clone(),
        Ok(FetchedBatch {
            posts: vec![post(1, 7, Some(3), T0)],
            comments: vec![comment(10, 1, T0)],
            users: vec![user(7)],
            ..Default::default()
        }),
    );
    h.remote.respond(
        by_author.clone(),
        Ok(FetchedBatch::posts(vec![post(1, 7, Some(3), T0)])),
    );
    h.remote.respond(
        by_category.clone(),
        Ok(FetchedBatch::posts(vec![post(1, 7, Some(3), T0)])),
    );
    h.remote.respond(
        CacheKey::AllPosts,
        Ok(FetchedBatch::posts(vec![post(2, 8, None, T0)])),
    );

    for key in [&detail, &by_author, &by_category] {
        h.manager.refresh(key).await.expect("seed");
    }
    h.clock.advance(SECOND);
    h.manager
        .refresh(&CacheKey::AllPosts)
        .await
        .expect("newer feed");

    let report = h
        .manager
        .eviction()
        .evict_over_capacity()
        .await
        .expect("evict");
    assert_eq!(report.posts, 1);
    assert_eq!(report.comments, 1);
    assert_eq!(report.metadata, 1);

    let classify = |key: CacheKey| {
        let manager = h.manager.clone();
        async move { manager.classify(&key).await.expect("classify") }
    };
    assert_eq!(classify(detail.clone()).await, Freshness::Missing);
    assert_eq!(classify(by_author.clone()).await, Freshness::Expired);
    assert_eq!(classify(by_category.clone()).await, Freshness::Expired);
    assert_eq!(classify(CacheKey::AllPosts).await, Freshness::Fresh);

    let data = h.manager.get_or_refresh(&detail).await.expect("read");
    assert_eq!(h.remote.calls(&detail), 2);
    assert_eq!(data.freshness, Freshness::Fresh);
    let CachedPayload::PostDetail { post, comments, .. } = data.payload else {
        panic!("expected detail payload");
    };
    assert_eq!(post.map(|post| post.id), Some(PostId(1)));
    assert_eq!(comments.len(), 1);
}

#[tokio::test]
async fn retention_expires_lists_that_lost_rows() {
    let h = harness(FakeRemote::new(), CacheConfig::default());
    let by_author = CacheKey::AuthorPosts(UserId(7));
    h.remote.respond(
        by_author.clone(),
        Ok(FetchedBatch::posts(vec![post(1, 7, None, T0)])),
    );
    h.manager.refresh(&by_author).await.expect("seed list");

    // The list is re-validated later without the old row being re-synced.
    let day = Duration::from_secs(24 * 60 * 60);
    h.clock.set(T0 + day);
    h.remote.respond(by_author.clone(), Ok(FetchedBatch::default()));
    h.manager.refresh(&by_author).await.expect("empty refresh");

    h.clock.set(T0 + day + SECOND);
    let report = h.manager.eviction().run().await.expect("retention");
    assert_eq!(report.posts, 1);
    assert_eq!(
        h.manager.classify(&by_author).await.expect("classify"),
        Freshness::Expired
    );
}
