#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use actix_web::test;
use quill::models::NewPost;
use quill::repo::{FollowRepo, PostRepo};
use serde_json::Value;

#[actix_web::test]
async fn following_fills_the_feed_and_unfollowing_empties_it() {
    let fx = common::fixture();
    let reader = common::user(&fx.repo, "reader").await;
    let leo = common::user(&fx.repo, "leo").await;
    let ann = common::user(&fx.repo, "ann").await;
    fx.repo.create_post(NewPost { author_id: leo.id, text: "from leo".into(), group_id: None }).await.unwrap();
    fx.repo.create_post(NewPost { author_id: ann.id, text: "from ann".into(), group_id: None }).await.unwrap();
    let app = test_app!(fx.state);

    let feed = |user: &quill::models::User| test::TestRequest::get().uri("/follow/").insert_header(common::bearer(user)).to_request();

    let body: Value = test::read_body_json(test::call_service(&app, feed(&reader)).await).await;
    assert_eq!(body["page"]["items"].as_array().unwrap().len(), 0);

    let req = test::TestRequest::get().uri("/leo/follow/").insert_header(common::bearer(&reader)).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 302);
    assert_eq!(common::location(&resp), "/leo/");

    let body: Value = test::read_body_json(test::call_service(&app, feed(&reader)).await).await;
    let items = body["page"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["text"], "from leo");

    // posts by people leo follows do not leak into the reader's feed
    let body: Value = test::read_body_json(test::call_service(&app, feed(&ann)).await).await;
    assert_eq!(body["page"]["items"].as_array().unwrap().len(), 0);

    let req = test::TestRequest::get().uri("/leo/unfollow/").insert_header(common::bearer(&reader)).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 302);
    assert_eq!(common::location(&resp), "/leo/");

    let body: Value = test::read_body_json(test::call_service(&app, feed(&reader)).await).await;
    assert_eq!(body["page"]["items"].as_array().unwrap().len(), 0);
}

#[actix_web::test]
async fn following_twice_keeps_one_edge() {
    let fx = common::fixture();
    let reader = common::user(&fx.repo, "reader").await;
    let leo = common::user(&fx.repo, "leo").await;
    let app = test_app!(fx.state);

    for _ in 0..2 {
        let req = test::TestRequest::get().uri("/leo/follow/").insert_header(common::bearer(&reader)).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 302);
    }
    assert_eq!(fx.repo.count_followers(leo.id).await.unwrap(), 1);

    let req = test::TestRequest::get().uri("/leo/").insert_header(common::bearer(&reader)).to_request();
    let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(body["following"], true);
    assert_eq!(body["profile"]["followers_count"], 1);
}

#[actix_web::test]
async fn self_follow_is_ignored() {
    let fx = common::fixture();
    let leo = common::user(&fx.repo, "leo").await;
    let app = test_app!(fx.state);

    let req = test::TestRequest::get().uri("/leo/follow/").insert_header(common::bearer(&leo)).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 302);
    assert_eq!(fx.repo.count_following(leo.id).await.unwrap(), 0);
}

#[actix_web::test]
async fn unfollow_without_edge_and_unknown_target() {
    let fx = common::fixture();
    let reader = common::user(&fx.repo, "reader").await;
    common::user(&fx.repo, "leo").await;
    let app = test_app!(fx.state);

    let req = test::TestRequest::get().uri("/leo/unfollow/").insert_header(common::bearer(&reader)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 302);

    let req = test::TestRequest::get().uri("/ghost/follow/").insert_header(common::bearer(&reader)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}
