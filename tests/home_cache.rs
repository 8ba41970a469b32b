#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use std::time::Duration;

use actix_web::test;
use quill::cache::PageCache;
use quill::models::NewPost;
use quill::repo::PostRepo;
use serde_json::Value;

// Texts of the posts on a home page response.
macro_rules! home_texts {
    ($app:expr, $uri:expr) => {{
        let resp = test::call_service(&$app, test::TestRequest::get().uri($uri).to_request()).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        body["page"]["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["text"].as_str().unwrap().to_string())
            .collect::<Vec<String>>()
    }};
}

#[actix_web::test]
async fn new_post_is_hidden_until_cache_is_cleared() {
    let fx = common::fixture();
    let leo = common::user(&fx.repo, "leo").await;
    let boss = common::admin(&fx.repo, "boss").await;
    let app = test_app!(fx.state);

    assert!(home_texts!(app, "/").is_empty());
    assert_eq!(fx.cache.len(), 1);

    fx.repo.create_post(NewPost { author_id: leo.id, text: "fresh".into(), group_id: None }).await.unwrap();
    assert!(home_texts!(app, "/").is_empty(), "cached page is served until it expires");

    // page 1 under any spelling is the same cached page
    assert!(home_texts!(app, "/?page=1").is_empty());
    assert!(home_texts!(app, "/?page=abc").is_empty());
    assert_eq!(fx.cache.len(), 1);

    let req = test::TestRequest::post().uri("/admin/cache/clear/").insert_header(common::bearer(&leo)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);

    let req = test::TestRequest::post().uri("/admin/cache/clear/").insert_header(common::bearer(&boss)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);
    assert!(fx.cache.is_empty());

    assert_eq!(home_texts!(app, "/"), vec!["fresh".to_string()]);
}

#[actix_web::test]
async fn cached_page_expires_after_ttl() {
    let fx = common::fixture_with_ttl(Duration::from_millis(50));
    let leo = common::user(&fx.repo, "leo").await;
    let app = test_app!(fx.state);

    assert!(home_texts!(app, "/").is_empty());
    fx.repo.create_post(NewPost { author_id: leo.id, text: "later".into(), group_id: None }).await.unwrap();
    assert!(home_texts!(app, "/").is_empty());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(home_texts!(app, "/"), vec!["later".to_string()]);
}

#[actix_web::test]
async fn clearing_directly_drops_every_page() {
    let fx = common::fixture();
    let leo = common::user(&fx.repo, "leo").await;
    for i in 0..11 {
        fx.repo.create_post(NewPost { author_id: leo.id, text: format!("post {i}"), group_id: None }).await.unwrap();
    }
    let app = test_app!(fx.state);
    assert_eq!(home_texts!(app, "/").len(), 10);
    assert_eq!(home_texts!(app, "/?page=2"), vec!["post 0".to_string()]);
    assert_eq!(fx.cache.len(), 2);
    fx.cache.clear();
    assert!(fx.cache.is_empty());
}

#[actix_web::test]
async fn junk_page_values_do_not_grow_the_cache() {
    let fx = common::fixture();
    let leo = common::user(&fx.repo, "leo").await;
    fx.repo.create_post(NewPost { author_id: leo.id, text: "only".into(), group_id: None }).await.unwrap();
    let app = test_app!(fx.state);

    for i in 0..500 {
        let uri = format!("/?page=junk{i}");
        assert_eq!(home_texts!(app, &uri), vec!["only".to_string()]);
        let uri = format!("/?page={}", 1000 + i);
        assert_eq!(home_texts!(app, &uri), vec!["only".to_string()]);
    }
    assert_eq!(fx.cache.len(), 1);
}

#[actix_web::test]
async fn repeated_page_parameter_uses_the_last_one() {
    let fx = common::fixture();
    let leo = common::user(&fx.repo, "leo").await;
    for i in 0..11 {
        fx.repo.create_post(NewPost { author_id: leo.id, text: format!("post {i}"), group_id: None }).await.unwrap();
    }
    let app = test_app!(fx.state);
    assert_eq!(home_texts!(app, "/?page=1&page=2"), vec!["post 0".to_string()]);
    assert_eq!(home_texts!(app, "/?page=99999999999999999999"), vec!["post 0".to_string()]);
}
