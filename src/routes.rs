use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::http::header;
use actix_web::web::{self, Bytes};
use actix_web::{HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::auth::{self, Auth, CurrentUser, Role};
use crate::cache::PageCache;
use crate::config::Settings;
use crate::error::ApiError;
use crate::forms::{CleanPost, CommentForm, FormErrors, LoginForm, PostForm, SignupForm, ValidImage, INVALID_CHOICE};
use crate::models::*;
use crate::pagination::{resolve, PageNumber, PageQuery};
use crate::repo::{Repo, RepoError};
use crate::require_role;
use crate::storage::{image_key, ImageStore, ImageStoreError};

pub fn config(cfg: &mut web::ServiceConfig) {
    // fixed prefixes first: everything else falls through to the
    // /{username}/ family below
    cfg.route("/", web::get().to(index))
        .route("/auth/signup/", web::post().to(signup))
        .service(
            web::resource("/auth/login/")
                .route(web::get().to(login_page))
                .route(web::post().to(login)),
        )
        .route("/auth/logout/", web::post().to(logout))
        .route("/auth/me/", web::get().to(auth_me))
        .route("/group/new/", web::post().to(create_group))
        .route("/group/{slug}/", web::get().to(group_posts))
        .route("/follow/", web::get().to(follow_index))
        .service(
            web::resource("/new/")
                .route(web::get().to(new_post_form))
                .route(web::post().to(new_post)),
        )
        .route("/media/posts/{name}", web::get().to(get_media))
        .route("/admin/cache/clear/", web::post().to(clear_cache))
        .route("/metrics", web::get().to(metrics_endpoint))
        .route("/{username}/", web::get().to(profile))
        .route("/{username}/follow/", web::get().to(profile_follow))
        .route("/{username}/unfollow/", web::get().to(profile_unfollow))
        .route("/{username}/{post_id}/", web::get().to(post_view))
        .service(
            web::resource("/{username}/{post_id}/edit/")
                .route(web::get().to(post_edit_form))
                .route(web::post().to(post_edit)),
        )
        .route("/{username}/{post_id}/comment", web::post().to(add_comment))
        .route("/{username}/{post_id}/delete/", web::post().to(post_delete));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub image_store: Arc<dyn ImageStore>,
    pub page_cache: Arc<dyn PageCache>,
    pub settings: Settings,
}

// ---------------- helpers ------------------------------------------

fn redirect(location: impl Into<String>) -> HttpResponse {
    HttpResponse::Found().insert_header((header::LOCATION, location.into())).finish()
}

pub fn profile_url(username: &str) -> String {
    format!("/{username}/")
}

pub fn post_url(username: &str, post_id: Id) -> String {
    format!("/{username}/{post_id}/")
}

fn to_body<T: Serialize>(value: &T) -> Result<Bytes, ApiError> {
    serde_json::to_vec(value).map(Bytes::from).map_err(|e| {
        error!("failed to serialize response: {e}");
        ApiError::Internal
    })
}

fn json_bytes(body: Bytes) -> HttpResponse {
    HttpResponse::Ok().content_type(header::ContentType::json()).body(body)
}

/// Post addressed as `/<username>/<post_id>/`; both parts must agree.
async fn load_post(data: &AppState, username: &str, post_id: Id) -> Result<Post, ApiError> {
    let post = data.repo.get_post(post_id).await?;
    if post.author != username {
        return Err(ApiError::NotFound);
    }
    Ok(post)
}

async fn build_profile(data: &AppState, user: &User) -> Result<Profile, ApiError> {
    Ok(Profile {
        id: user.id,
        username: user.username.clone(),
        posts_count: data.repo.count_posts(PostScope::Author(user.id)).await?,
        followers_count: data.repo.count_followers(user.id).await?,
        following_count: data.repo.count_following(user.id).await?,
    })
}

/// Group existence is the one check the form cannot do on its own.
async fn ensure_group_exists(data: &AppState, clean: &CleanPost) -> Result<(), ApiError> {
    let Some(group_id) = clean.group_id else { return Ok(()) };
    match data.repo.get_group(group_id).await {
        Ok(_) => Ok(()),
        Err(RepoError::NotFound) => Err(FormErrors::single("group", INVALID_CHOICE).into()),
        Err(e) => Err(e.into()),
    }
}

/// Writes the blob for `post_id` and returns its key. Nothing references the
/// key until `attach_image` records it.
async fn save_image(data: &AppState, post_id: Id, img: ValidImage) -> Result<String, ApiError> {
    let key = image_key(post_id, img.extension);
    data.image_store.save(&key, img.mime, &img.bytes).await.map_err(|e| {
        error!(post_id, "failed to store image: {e}");
        ApiError::Internal
    })?;
    Ok(key)
}

/// Records `key` on the post, dropping a previous blob stored under a
/// different extension.
async fn attach_image(data: &AppState, post: &Post, key: String) -> Result<Post, ApiError> {
    let updated = data.repo.set_post_image(post.id, Some(key.clone())).await?;
    if let Some(old) = post.image.as_deref().filter(|old| *old != key) {
        discard_image(data, old).await;
    }
    Ok(updated)
}

async fn discard_image(data: &AppState, key: &str) {
    if let Err(e) = data.image_store.delete(key).await {
        warn!(key, "failed to delete image: {e}");
    }
}

// ---------------- listings -----------------------------------------

#[utoipa::path(
    get,
    path = "/",
    params(("page" = Option<String>, Query, description = "Page number, 10 posts per page")),
    responses(
        (status = 200, description = "Newest posts first; served from the page cache for up to the cache TTL")
    )
)]
pub async fn index(data: web::Data<AppState>, query: PageQuery) -> Result<HttpResponse, ApiError> {
    // keyed by the resolved page: junk and out-of-range values share an entry
    let count = data.repo.count_posts(PostScope::All).await?;
    let number = resolve(query.requested(), count).number;
    let key = format!("index_page:{number}");
    if let Some(body) = data.page_cache.get(&key) {
        return Ok(json_bytes(body));
    }
    let page = data.repo.page_posts(PostScope::All, PageNumber::Number(number as i64)).await?;
    let body = to_body(&json!({ "page": page }))?;
    data.page_cache.set(&key, body.clone(), data.settings.index_cache_ttl);
    Ok(json_bytes(body))
}

#[utoipa::path(
    get,
    path = "/group/{slug}/",
    params(("slug" = String, Path, description = "Group slug")),
    responses(
        (status = 200, description = "Group and a page of its posts"),
        (status = 404, description = "Group not found")
    )
)]
pub async fn group_posts(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: PageQuery,
) -> Result<HttpResponse, ApiError> {
    let group = data.repo.get_group_by_slug(&path.into_inner()).await?;
    let page = data.repo.page_posts(PostScope::Group(group.id), query.requested()).await?;
    Ok(HttpResponse::Ok().json(json!({ "group": group, "page": page })))
}

#[utoipa::path(
    post,
    path = "/group/new/",
    request_body = NewGroup,
    responses(
        (status = 201, description = "Group created", body = Group),
        (status = 403, description = "Admins only"),
        (status = 409, description = "Slug already taken")
    )
)]
pub async fn create_group(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
    payload: web::Json<NewGroup>,
) -> Result<HttpResponse, ApiError> {
    let claims = user.require(&req)?;
    require_role!(claims, Role::Admin);
    let new = payload.into_inner();
    let mut errors = FormErrors::default();
    if new.title.trim().is_empty() {
        errors.add("title", crate::forms::REQUIRED);
    }
    if new.slug.is_empty() || !new.slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        errors.add("slug", "Enter a valid slug consisting of letters, numbers, underscores or hyphens.");
    }
    if !errors.is_empty() {
        return Err(errors.into());
    }
    let group = data.repo.create_group(new).await?;
    info!(slug = %group.slug, "group created");
    Ok(HttpResponse::Created().json(group))
}

pub async fn follow_index(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
    query: PageQuery,
) -> Result<HttpResponse, ApiError> {
    let viewer = user.require(&req)?.user_id()?;
    let page = data.repo.page_posts(PostScope::FollowedBy(viewer), query.requested()).await?;
    Ok(HttpResponse::Ok().json(json!({ "page": page })))
}

#[utoipa::path(
    get,
    path = "/{username}/",
    params(("username" = String, Path, description = "Author username")),
    responses(
        (status = 200, description = "Author profile, a page of their posts and whether the viewer follows them"),
        (status = 404, description = "No such user")
    )
)]
pub async fn profile(
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: PageQuery,
) -> Result<HttpResponse, ApiError> {
    let author = data.repo.get_user_by_username(&path.into_inner()).await?;
    let page = data.repo.page_posts(PostScope::Author(author.id), query.requested()).await?;
    let following = match user.user_id() {
        Some(viewer) => Some(data.repo.is_following(viewer, author.id).await?),
        None => None,
    };
    let profile = build_profile(&data, &author).await?;
    Ok(HttpResponse::Ok().json(json!({ "profile": profile, "page": page, "following": following })))
}

#[utoipa::path(
    get,
    path = "/{username}/{post_id}/",
    params(
        ("username" = String, Path, description = "Author username"),
        ("post_id" = Id, Path, description = "Post id")
    ),
    responses(
        (status = 200, description = "Post with its author card and comments, newest first"),
        (status = 404, description = "No such post for this author")
    )
)]
pub async fn post_view(data: web::Data<AppState>, path: web::Path<(String, Id)>) -> Result<HttpResponse, ApiError> {
    let (username, post_id) = path.into_inner();
    let post = load_post(&data, &username, post_id).await?;
    let author = data.repo.get_user(post.author_id).await?;
    let profile = build_profile(&data, &author).await?;
    let comments = data.repo.list_comments(post.id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "post": post,
        "author_posts_count": profile.posts_count,
        "profile": profile,
        "comments": comments,
    })))
}

// ---------------- authoring ----------------------------------------

pub async fn new_post_form(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    user.require(&req)?;
    let groups = data.repo.list_groups().await?;
    Ok(HttpResponse::Ok().json(json!({
        "form": { "text": "", "group": null, "image": null },
        "groups": groups,
        "is_edit": false,
    })))
}

pub async fn new_post(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let author_id = user.require(&req)?.user_id()?;
    let clean = PostForm::from_multipart(payload).await?.validate()?;
    ensure_group_exists(&data, &clean).await?;

    let post = data
        .repo
        .create_post(NewPost { author_id, text: clean.text, group_id: clean.group_id })
        .await?;
    if let Some(img) = clean.image {
        let stored = match save_image(&data, post.id, img).await {
            Ok(key) => attach_image(&data, &post, key).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            // no half-created posts without their image
            if let Err(del) = data.repo.delete_post(post.id).await {
                error!(post_id = post.id, "failed to roll back post: {del}");
            }
            return Err(e);
        }
    }
    metrics::counter!("posts_created_total").increment(1);
    info!(post_id = post.id, author = %post.author, "post created");
    Ok(redirect("/"))
}

pub async fn post_edit_form(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<(String, Id)>,
) -> Result<HttpResponse, ApiError> {
    let viewer = user.require(&req)?.user_id()?;
    let (username, post_id) = path.into_inner();
    let post = load_post(&data, &username, post_id).await?;
    if post.author_id != viewer {
        return Ok(redirect(post_url(&username, post_id)));
    }
    let groups = data.repo.list_groups().await?;
    Ok(HttpResponse::Ok().json(json!({ "post": post, "groups": groups, "is_edit": true })))
}

pub async fn post_edit(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<(String, Id)>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let viewer = user.require(&req)?.user_id()?;
    let (username, post_id) = path.into_inner();
    let post = load_post(&data, &username, post_id).await?;
    if post.author_id != viewer {
        warn!(post_id, viewer, "edit attempt by non-author");
        return Ok(redirect(post_url(&username, post_id)));
    }

    let clean = PostForm::from_multipart(payload).await?.validate()?;
    ensure_group_exists(&data, &clean).await?;

    // the blob goes first: a failed write must leave the post untouched
    let new_key = match clean.image {
        Some(img) => Some(save_image(&data, post.id, img).await?),
        None => None,
    };
    let updated = data
        .repo
        .update_post(post.id, PostChanges { text: clean.text, group_id: clean.group_id })
        .await?;
    match (new_key, updated.image.clone()) {
        (Some(key), _) => {
            attach_image(&data, &updated, key).await?;
        }
        (None, Some(old)) if clean.clear_image => {
            data.repo.set_post_image(post.id, None).await?;
            discard_image(&data, &old).await;
        }
        _ => {}
    }
    info!(post_id, "post updated");
    Ok(redirect(post_url(&updated.author, post_id)))
}

pub async fn post_delete(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<(String, Id)>,
) -> Result<HttpResponse, ApiError> {
    let viewer = user.require(&req)?.user_id()?;
    let (username, post_id) = path.into_inner();
    let post = load_post(&data, &username, post_id).await?;
    if post.author_id != viewer {
        return Ok(redirect(post_url(&username, post_id)));
    }
    data.repo.delete_post(post.id).await?;
    if let Some(key) = post.image.as_deref() {
        discard_image(&data, key).await;
    }
    info!(post_id, "post deleted");
    Ok(redirect(profile_url(&username)))
}

pub async fn add_comment(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<(String, Id)>,
    form: Option<web::Form<CommentForm>>,
) -> Result<HttpResponse, ApiError> {
    let author_id = user.require(&req)?.user_id()?;
    let (username, post_id) = path.into_inner();
    let post = load_post(&data, &username, post_id).await?;
    let text = form.map(|f| f.into_inner()).unwrap_or_default().validate()?;
    let comment = data.repo.create_comment(NewComment { post_id: post.id, author_id, text }).await?;
    info!(post_id, comment_id = comment.id, "comment added");
    Ok(redirect(post_url(&username, post_id)))
}

// ---------------- follow graph -------------------------------------

pub async fn profile_follow(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let viewer = user.require(&req)?.user_id()?;
    let author = data.repo.get_user_by_username(&path.into_inner()).await?;
    if author.id != viewer {
        let created = data.repo.follow(viewer, author.id).await?;
        if created {
            info!(follower = viewer, followee = author.id, "follow");
        }
    }
    Ok(redirect(profile_url(&author.username)))
}

pub async fn profile_unfollow(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let viewer = user.require(&req)?.user_id()?;
    let author = data.repo.get_user_by_username(&path.into_inner()).await?;
    if data.repo.unfollow(viewer, author.id).await? {
        info!(follower = viewer, followee = author.id, "unfollow");
    }
    Ok(redirect(profile_url(&author.username)))
}

// ---------------- media / admin / metrics --------------------------

pub async fn get_media(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let key = format!("posts/{}", path.into_inner());
    match data.image_store.load(&key).await {
        Ok((bytes, mime)) => Ok(HttpResponse::Ok().insert_header((header::CONTENT_TYPE, mime)).body(bytes)),
        Err(ImageStoreError::NotFound | ImageStoreError::InvalidKey(_)) => Err(ApiError::NotFound),
        Err(e) => {
            error!("image_store load error: {e}");
            Err(ApiError::Internal)
        }
    }
}

pub async fn clear_cache(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let claims = user.require(&req)?;
    require_role!(claims, Role::Admin);
    data.page_cache.clear();
    info!(by = %claims.username, "page cache cleared");
    Ok(HttpResponse::NoContent().finish())
}

pub async fn metrics_endpoint() -> HttpResponse {
    match crate::telemetry::prometheus() {
        Some(handle) => HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(handle.render()),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}

// ---------------- accounts -----------------------------------------

#[derive(Debug, Deserialize)]
pub struct NextQuery {
    pub next: Option<String>,
}

/// Only same-site absolute paths are followed after login.
fn safe_next(next: Option<&str>) -> String {
    match next {
        Some(n) if n.starts_with('/') && !n.starts_with("//") => n.to_string(),
        _ => "/".to_string(),
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SessionResponse {
    pub user: User,
    pub token: String,
    pub next: String,
}

#[utoipa::path(
    post,
    path = "/auth/signup/",
    request_body = SignupForm,
    responses(
        (status = 201, description = "Account created and logged in", body = SessionResponse),
        (status = 400, description = "Invalid form"),
        (status = 409, description = "Username taken")
    )
)]
pub async fn signup(data: web::Data<AppState>, payload: web::Json<SignupForm>) -> Result<HttpResponse, ApiError> {
    let form = payload.into_inner();
    form.validate()?;
    let username = form.username.trim().to_string();
    let user = data
        .repo
        .create_user(NewUser {
            is_staff: data.settings.is_bootstrap_admin(&username),
            username,
            email: form.email.trim().to_string(),
            password_hash: auth::hash_password(&form.password)?,
        })
        .await?;
    let token = auth::create_jwt(user.id, &user.username, auth::roles_for(&user))?;
    info!(user_id = user.id, username = %user.username, "user signed up");
    Ok(HttpResponse::Created()
        .cookie(auth::session_cookie(&token, data.settings.secure_cookies))
        .json(SessionResponse { user, token, next: "/".into() }))
}

pub async fn login_page(query: web::Query<NextQuery>) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "login": true, "next": safe_next(query.next.as_deref()) }))
}

#[utoipa::path(
    post,
    path = "/auth/login/",
    request_body = LoginForm,
    params(("next" = Option<String>, Query, description = "Path to return to after login")),
    responses(
        (status = 200, description = "Logged in", body = SessionResponse),
        (status = 401, description = "Bad credentials")
    )
)]
pub async fn login(
    data: web::Data<AppState>,
    query: web::Query<NextQuery>,
    payload: web::Json<LoginForm>,
) -> Result<HttpResponse, ApiError> {
    let form = payload.into_inner();
    let user = match data.repo.get_user_by_username(form.username.trim()).await {
        Ok(u) => u,
        Err(RepoError::NotFound) => return Err(ApiError::Unauthorized),
        Err(e) => return Err(e.into()),
    };
    if !auth::verify_password(&form.password, &user.password_hash) {
        warn!(username = %user.username, "failed login");
        return Err(ApiError::Unauthorized);
    }
    let token = auth::create_jwt(user.id, &user.username, auth::roles_for(&user))?;
    Ok(HttpResponse::Ok()
        .cookie(auth::session_cookie(&token, data.settings.secure_cookies))
        .json(SessionResponse { user, token, next: safe_next(query.next.as_deref()) }))
}

pub async fn logout() -> HttpResponse {
    HttpResponse::Found()
        .cookie(auth::expired_session_cookie())
        .insert_header((header::LOCATION, "/"))
        .finish()
}

#[utoipa::path(
    get,
    path = "/auth/me/",
    responses(
        (status = 200, description = "Current user", body = User),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn auth_me(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.get_user(auth.0.user_id()?).await.map_err(|e| match e {
        RepoError::NotFound => ApiError::Unauthorized,
        other => other.into(),
    })?;
    Ok(HttpResponse::Ok().json(user))
}
