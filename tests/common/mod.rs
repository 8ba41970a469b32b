#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use quill::auth::{create_jwt, Role};
use quill::cache::InMemoryPageCache;
use quill::config::Settings;
use quill::models::{NewGroup, NewUser, Group, User};
use quill::repo::inmem::InMemRepo;
use quill::repo::{GroupRepo, UserRepo};
use quill::storage::FsImageStore;
use quill::AppState;

pub const SECRET: &str = "test-secret-must-be-32-bytes-long!!";

pub fn set_secret() {
    std::env::set_var("JWT_SECRET", SECRET);
}

/// Everything a route test needs, with handles on the concrete backends so
/// tests can inspect the store and the cache directly.
pub struct Fixture {
    pub state: AppState,
    pub repo: InMemRepo,
    pub cache: Arc<InMemoryPageCache>,
    pub media: tempfile::TempDir,
}

pub fn fixture() -> Fixture {
    fixture_with_ttl(Duration::from_secs(20))
}

pub fn fixture_with_ttl(ttl: Duration) -> Fixture {
    set_secret();
    let repo = InMemRepo::new();
    let cache = Arc::new(InMemoryPageCache::new());
    let media = tempfile::tempdir().unwrap();
    let settings = Settings { index_cache_ttl: ttl, media_root: media.path().to_path_buf(), ..Settings::default() };
    let state = AppState {
        repo: Arc::new(repo.clone()),
        image_store: Arc::new(FsImageStore::new(media.path())),
        page_cache: cache.clone(),
        settings,
    };
    Fixture { state, repo, cache, media }
}

/// Builds the test service the same way `main` wires the app.
#[macro_export]
macro_rules! test_app {
    ($state:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .app_data(actix_web::web::Data::new($state.clone()))
                .configure(quill::config)
                .default_service(actix_web::web::to(quill::error::not_found)),
        )
        .await
    };
}

pub async fn user(repo: &InMemRepo, username: &str) -> User {
    repo.create_user(NewUser {
        username: username.into(),
        email: format!("{username}@example.com"),
        password_hash: "unused".into(),
        is_staff: false,
    })
    .await
    .unwrap()
}

pub async fn admin(repo: &InMemRepo, username: &str) -> User {
    repo.create_user(NewUser {
        username: username.into(),
        email: format!("{username}@example.com"),
        password_hash: "unused".into(),
        is_staff: true,
    })
    .await
    .unwrap()
}

pub async fn group(repo: &InMemRepo, slug: &str) -> Group {
    repo.create_group(NewGroup { title: slug.to_uppercase(), slug: slug.into(), description: String::new() })
        .await
        .unwrap()
}

pub fn token(user: &User) -> String {
    set_secret();
    let roles = if user.is_staff { vec![Role::User, Role::Admin] } else { vec![Role::User] };
    create_jwt(user.id, &user.username, roles).unwrap()
}

pub fn bearer(user: &User) -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", token(user)))
}

pub const BOUNDARY: &str = "QUILLBOUNDARY";

/// multipart/form-data body with text fields and an optional `image` file part.
pub fn multipart(fields: &[(&str, &str)], image: Option<(&str, &[u8])>) -> ((&'static str, String), Vec<u8>) {
    let mut body: Vec<u8> = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
        );
    }
    if let Some((filename, bytes)) = image {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    (("Content-Type", format!("multipart/form-data; boundary={BOUNDARY}")), body)
}

/// A real 200x200 white PNG.
pub fn png() -> Vec<u8> {
    use image::{ImageBuffer, Rgb};
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(200, 200, Rgb([255, 255, 255]));
    let mut buf = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png).unwrap();
    buf
}

pub fn location<B>(resp: &actix_web::dev::ServiceResponse<B>) -> String {
    resp.headers().get("location").map(|v| v.to_str().unwrap().to_string()).unwrap_or_default()
}
