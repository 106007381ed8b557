//! Client behavior against a mock board: retries, resumption, spacing and
//! tag resolution.

mod common;

use std::fs;
use std::time::{Duration, Instant};

use common::{client_for, file_body, test_config, MockBoard, MockPost};
use e621dl::e621::{finish_partial_downloads, ClientError, E621Client};
use e621dl::pipeline::{Cursor, PostSource, SearchQuery};
use reqwest::StatusCode;
use tempfile::TempDir;

fn query(tags: &[&str], limit: u32) -> SearchQuery {
    SearchQuery {
        directory: "Cats".to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        earliest: None,
        limit,
    }
}

#[tokio::test]
async fn test_missing_file_is_content_gone_and_partial_is_removed() {
    let board = MockBoard::spawn(vec![MockPost::new(7, &["cat"]).gone()]).await;
    let client = client_for(&board);
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("7.png");
    let partial = temp.path().join("7.png.request");
    fs::write(&partial, b"stale").unwrap();

    let url = format!("{}/data/7.png", board.base_url);
    let result = client.download_file(&url, &dest).await;

    assert!(matches!(
        result,
        Err(ClientError::ContentGone { status: StatusCode::NOT_FOUND, .. })
    ));
    assert!(!partial.exists());
    assert!(!dest.exists());
    assert_eq!(board.requests_to("/data/7.png").len(), 1);
}

#[tokio::test]
async fn test_transient_errors_are_retried_without_duplicating_bytes() {
    let board = MockBoard::spawn(vec![MockPost::new(1, &["cat"])]).await;
    board.script(
        "/data/1.png",
        &[
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::SERVICE_UNAVAILABLE,
        ],
    );
    let client = client_for(&board);
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("1.png");

    let size = client
        .download_file(&format!("{}/data/1.png", board.base_url), &dest)
        .await
        .unwrap();

    assert_eq!(size, 1024);
    assert_eq!(fs::read(&dest).unwrap(), file_body(1, 1024));
    assert!(!temp.path().join("1.png.request").exists());
    assert_eq!(board.requests_to("/data/1.png").len(), 4);
}

#[tokio::test]
async fn test_retries_give_up_after_the_configured_attempts() {
    let board = MockBoard::spawn(vec![MockPost::new(1, &["cat"])]).await;
    board.script("/posts/1.json", &[StatusCode::BAD_GATEWAY; 3]);
    let client = E621Client::new(e621dl::e621::ClientConfig {
        retry_attempts: 3,
        ..test_config(&board)
    })
    .unwrap();

    let result = client.lookup_post(1).await;
    assert!(matches!(result, Err(ClientError::RetriesExhausted { attempts: 3, .. })));
    assert_eq!(board.requests_to("/posts/1.json").len(), 3);
}

#[tokio::test]
async fn test_resumed_download_is_bit_identical() {
    let body = file_body(3, 4096);
    let board = MockBoard::spawn(vec![MockPost::new(3, &["cat"]).body(body.clone())]).await;
    let client = client_for(&board);
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("3.png");
    fs::write(temp.path().join("3.png.request"), &body[..1000]).unwrap();

    client
        .download_file(&format!("{}/data/3.png", board.base_url), &dest)
        .await
        .unwrap();

    assert_eq!(fs::read(&dest).unwrap(), body);
    let requests = board.requests_to("/data/3.png");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].range.as_deref(), Some("bytes=1000-"));
}

#[tokio::test]
async fn test_oversized_partial_restarts_from_zero() {
    let body = file_body(4, 100);
    let board = MockBoard::spawn(vec![MockPost::new(4, &["cat"]).body(body.clone())]).await;
    let client = client_for(&board);
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("4.png");
    fs::write(temp.path().join("4.png.request"), vec![0u8; 500]).unwrap();

    client
        .download_file(&format!("{}/data/4.png", board.base_url), &dest)
        .await
        .unwrap();

    assert_eq!(fs::read(&dest).unwrap(), body);
    let ranges: Vec<Option<String>> = board.requests_to("/data/4.png").into_iter().map(|r| r.range).collect();
    assert_eq!(ranges, vec![Some("bytes=500-".to_string()), None]);
}

#[tokio::test]
async fn test_requests_are_spaced_by_the_minimum_interval() {
    let board = MockBoard::spawn(vec![MockPost::new(1, &["cat"])]).await;
    let client = E621Client::new(e621dl::e621::ClientConfig {
        min_interval: Duration::from_millis(60),
        ..test_config(&board)
    })
    .unwrap();

    let start = Instant::now();
    for _ in 0..3 {
        client.lookup_post(1).await.unwrap();
    }

    assert!(start.elapsed() >= Duration::from_millis(120));
    assert_eq!(client.limiter().requests(), 3);
}

#[tokio::test]
async fn test_pages_follow_the_cursor() {
    let posts = (1..=5).map(|id| MockPost::new(id, &["cat"])).collect();
    let board = MockBoard::spawn(posts).await;
    let client = client_for(&board);
    let q = query(&["cat"], 2);

    let first = client.search(&q, Cursor::Start).await.unwrap();
    let ids: Vec<u64> = first.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![5, 4]);

    let second = client.search(&q, Cursor::Before(4)).await.unwrap();
    let ids: Vec<u64> = second.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![3, 2]);

    assert!(client.search(&q, Cursor::Exhausted).await.unwrap().is_empty());

    let requests = board.requests_to("/posts.json");
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].query.contains_key("page"));
    assert_eq!(requests[1].query.get("page").map(String::as_str), Some("b4"));
    assert_eq!(requests[1].query.get("tags").map(String::as_str), Some("cat"));
}

#[tokio::test]
async fn test_unknown_post_lookup_is_none() {
    let board = MockBoard::spawn(vec![MockPost::new(1, &["cat"])]).await;
    let client = client_for(&board);

    assert!(client.lookup_post(99).await.unwrap().is_none());
    let post = client.lookup_post(1).await.unwrap().unwrap();
    assert!(post.has_tag("cat"));
    assert_eq!(post.days_ago, 0);
}

#[tokio::test]
async fn test_aliases_are_resolved_once() {
    let board = MockBoard::spawn(vec![MockPost::new(1, &["cat"])]).await;
    board.add_alias("kitty", "cat");
    let client = client_for(&board);

    assert_eq!(client.resolve_alias("kitty").await.unwrap(), "cat");
    assert_eq!(client.resolve_alias("Kitty").await.unwrap(), "cat");
    assert_eq!(client.resolve_alias("-kitty").await.unwrap(), "-cat");
    assert_eq!(client.resolve_alias("cat").await.unwrap(), "cat");
    assert_eq!(client.resolve_alias("nonexistent").await.unwrap(), "");

    let kitty_lookups = board
        .requests_to("/tags.json")
        .into_iter()
        .filter(|r| r.query.get("search[name]").map(String::as_str) == Some("kitty"))
        .count();
    assert_eq!(kitty_lookups, 1);
    assert_eq!(board.requests_to("/tag_aliases.json").len(), 2);
}

#[tokio::test]
async fn test_recovery_finishes_or_removes_partials() {
    let body = file_body(3, 2048);
    let board = MockBoard::spawn(vec![MockPost::new(3, &["cat"]).body(body.clone())]).await;
    let client = client_for(&board);
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("Cats");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("3.png.request"), &body[..512]).unwrap();
    fs::write(dir.join("99.png.request"), b"orphan").unwrap();

    let report = finish_partial_downloads(&client, temp.path()).await.unwrap();

    assert_eq!(report.resumed, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(fs::read(dir.join("3.png")).unwrap(), body);
    assert!(!dir.join("3.png.request").exists());
    assert!(!dir.join("99.png.request").exists());
}
