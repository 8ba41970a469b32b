use crate::forms::{CommentForm, LoginForm, SignupForm};
use crate::models::{Comment, Follow, Group, NewGroup, Post, Profile, User};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::index,
        crate::routes::group_posts,
        crate::routes::create_group,
        crate::routes::profile,
        crate::routes::post_view,
        crate::routes::signup,
        crate::routes::login,
        crate::routes::auth_me,
    ),
    components(schemas(
        User, Group, NewGroup, Post, Comment, Follow, Profile,
        SignupForm, LoginForm, CommentForm, crate::routes::SessionResponse
    )),
    tags(
        (name = "posts", description = "Posts, groups and the follow feed"),
        (name = "auth", description = "Accounts and sessions"),
    )
)]
pub struct ApiDoc;
