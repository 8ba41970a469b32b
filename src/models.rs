use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub type Id = i64;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    #[schema(skip)]
    pub password_hash: String,
    pub is_staff: bool,
    pub date_joined: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_staff: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Group {
    pub id: Id,
    pub title: String,
    pub slug: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewGroup {
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub description: String,
}

/// A post as it is read back: author username and group slug are joined in
/// so listings can be rendered without extra lookups.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Post {
    pub id: Id,
    pub text: String,
    pub pub_date: DateTime<Utc>,
    pub author_id: Id,
    pub author: String,
    pub group_id: Option<Id>,
    pub group: Option<String>,
    pub image: Option<String>, // storage key, served under /media/
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPost {
    pub author_id: Id,
    pub text: String,
    pub group_id: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostChanges {
    pub text: String,
    pub group_id: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Comment {
    pub id: Id,
    pub post_id: Id,
    pub author_id: Id,
    pub author: String,
    pub text: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewComment {
    pub post_id: Id,
    pub author_id: Id,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Follow {
    pub id: Id,
    pub follower_id: Id,
    pub followee_id: Id,
}

/// Author card shown on profile and post pages.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Profile {
    pub id: Id,
    pub username: String,
    pub posts_count: u64,
    pub followers_count: u64,
    pub following_count: u64,
}

/// Which posts a listing draws from. Every post list in the app is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostScope {
    All,
    Group(Id),
    Author(Id),
    /// Posts by every author the given user follows.
    FollowedBy(Id),
}
