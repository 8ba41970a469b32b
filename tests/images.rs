#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use std::sync::Arc;

use actix_web::test;
use async_trait::async_trait;
use quill::models::PostScope;
use quill::pagination::PageNumber;
use quill::repo::PostRepo;
use quill::storage::{ImageStore, ImageStoreError};
use serde_json::Value;

async fn only_post(fx: &common::Fixture) -> quill::models::Post {
    let page = fx.repo.page_posts(PostScope::All, PageNumber::First).await.unwrap();
    assert_eq!(page.items.len(), 1);
    page.items.into_iter().next().unwrap()
}

#[actix_web::test]
async fn png_upload_is_stored_and_served() {
    let fx = common::fixture();
    let leo = common::user(&fx.repo, "leo").await;
    let app = test_app!(fx.state);
    let png = common::png();

    let (ct, body) = common::multipart(&[("text", "with picture")], Some(("small.png", png.as_slice())));
    let req = test::TestRequest::post()
        .uri("/new/")
        .insert_header(common::bearer(&leo))
        .insert_header(ct)
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 302);

    let post = only_post(&fx).await;
    let key = post.image.clone().expect("image key recorded");
    assert_eq!(key, format!("posts/{}.png", post.id));
    assert!(fx.media.path().join(&key).exists());

    let req = test::TestRequest::get().uri(&format!("/media/{key}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "image/png");
    let served = test::read_body(resp).await;
    assert_eq!(served.as_ref(), png.as_slice());

    // the image key shows up on every listing
    let req = test::TestRequest::get().uri("/leo/").to_request();
    let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(body["page"]["items"][0]["image"], key.as_str());
}

#[actix_web::test]
async fn text_file_is_rejected_as_image() {
    let fx = common::fixture();
    let leo = common::user(&fx.repo, "leo").await;
    let app = test_app!(fx.state);

    let (ct, body) = common::multipart(&[("text", "fake picture")], Some(("notes.txt", &b"just some text"[..])));
    let req = test::TestRequest::post()
        .uri("/new/")
        .insert_header(common::bearer(&leo))
        .insert_header(ct)
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["errors"]["image"][0], quill::forms::INVALID_IMAGE);
    assert_eq!(fx.repo.count_posts(PostScope::All).await.unwrap(), 0);
}

#[actix_web::test]
async fn truncated_png_is_rejected() {
    let fx = common::fixture();
    let leo = common::user(&fx.repo, "leo").await;
    let app = test_app!(fx.state);
    let png = common::png();

    let (ct, body) = common::multipart(&[("text", "broken")], Some(("broken.png", &png[..40])));
    let req = test::TestRequest::post()
        .uri("/new/")
        .insert_header(common::bearer(&leo))
        .insert_header(ct)
        .set_payload(body)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
}

#[actix_web::test]
async fn editing_can_replace_and_clear_the_image() {
    let fx = common::fixture();
    let leo = common::user(&fx.repo, "leo").await;
    let app = test_app!(fx.state);
    let png = common::png();

    let (ct, body) = common::multipart(&[("text", "v1")], Some(("a.png", png.as_slice())));
    let req = test::TestRequest::post()
        .uri("/new/")
        .insert_header(common::bearer(&leo))
        .insert_header(ct)
        .set_payload(body)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 302);
    let post = only_post(&fx).await;
    let key = post.image.clone().unwrap();
    let edit_uri = format!("/leo/{}/edit/", post.id);

    // an untouched file input keeps the current image
    let (ct, body) = common::multipart(&[("text", "v2")], Some(("", &b""[..])));
    let req = test::TestRequest::post()
        .uri(&edit_uri)
        .insert_header(common::bearer(&leo))
        .insert_header(ct)
        .set_payload(body)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 302);
    let post = only_post(&fx).await;
    assert_eq!(post.text, "v2");
    assert_eq!(post.image.as_deref(), Some(key.as_str()));

    let (ct, body) = common::multipart(&[("text", "v3"), ("image-clear", "on")], None);
    let req = test::TestRequest::post()
        .uri(&edit_uri)
        .insert_header(common::bearer(&leo))
        .insert_header(ct)
        .set_payload(body)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 302);
    let post = only_post(&fx).await;
    assert!(post.image.is_none());
    assert!(!fx.media.path().join(&key).exists());

    let req = test::TestRequest::get().uri(&format!("/media/{key}")).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_web::test]
async fn media_rejects_traversal() {
    let fx = common::fixture();
    let app = test_app!(fx.state);
    for uri in ["/media/posts/..%2Fsecret", "/media/posts/1.png", "/media/posts/abc.png"] {
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        assert_eq!(resp.status(), 404, "{uri}");
    }
}

struct BrokenStore;

#[async_trait]
impl ImageStore for BrokenStore {
    async fn save(&self, _key: &str, _mime: &str, _bytes: &[u8]) -> Result<(), ImageStoreError> {
        Err(ImageStoreError::Other("disk full".into()))
    }
    async fn load(&self, _key: &str) -> Result<(Vec<u8>, String), ImageStoreError> {
        Err(ImageStoreError::NotFound)
    }
    async fn delete(&self, _key: &str) -> Result<(), ImageStoreError> {
        Ok(())
    }
}

#[actix_web::test]
async fn failed_image_write_leaves_no_post() {
    let mut fx = common::fixture();
    fx.state.image_store = Arc::new(BrokenStore);
    let leo = common::user(&fx.repo, "leo").await;
    let app = test_app!(fx.state);
    let png = common::png();

    let (ct, body) = common::multipart(&[("text", "doomed")], Some(("a.png", png.as_slice())));
    let req = test::TestRequest::post()
        .uri("/new/")
        .insert_header(common::bearer(&leo))
        .insert_header(ct)
        .set_payload(body)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 500);
    assert_eq!(fx.repo.count_posts(PostScope::All).await.unwrap(), 0);
}

#[actix_web::test]
async fn failed_image_write_leaves_edit_unapplied() {
    let mut fx = common::fixture();
    fx.state.image_store = Arc::new(BrokenStore);
    let leo = common::user(&fx.repo, "leo").await;
    let post = fx
        .repo
        .create_post(quill::models::NewPost { author_id: leo.id, text: "before".into(), group_id: None })
        .await
        .unwrap();
    let app = test_app!(fx.state);
    let png = common::png();

    let (ct, body) = common::multipart(&[("text", "edited")], Some(("a.png", png.as_slice())));
    let req = test::TestRequest::post()
        .uri(&format!("/leo/{}/edit/", post.id))
        .insert_header(common::bearer(&leo))
        .insert_header(ct)
        .set_payload(body)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 500);
    let after = fx.repo.get_post(post.id).await.unwrap();
    assert_eq!(after.text, "before");
    assert!(after.image.is_none());
}
