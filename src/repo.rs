use async_trait::async_trait;

use crate::models::*;
use crate::pagination::{Page, PageNumber};

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn create_user(&self, new: NewUser) -> RepoResult<User>;
    async fn get_user(&self, id: Id) -> RepoResult<User>;
    async fn get_user_by_username(&self, username: &str) -> RepoResult<User>;
    /// Removes the user together with their posts, comments and follow edges.
    async fn delete_user(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait GroupRepo: Send + Sync {
    async fn create_group(&self, new: NewGroup) -> RepoResult<Group>;
    async fn get_group(&self, id: Id) -> RepoResult<Group>;
    async fn get_group_by_slug(&self, slug: &str) -> RepoResult<Group>;
    async fn list_groups(&self) -> RepoResult<Vec<Group>>;
    /// Posts of the group survive with their group reference cleared.
    async fn delete_group(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn create_post(&self, new: NewPost) -> RepoResult<Post>;
    async fn get_post(&self, id: Id) -> RepoResult<Post>;
    async fn update_post(&self, id: Id, changes: PostChanges) -> RepoResult<Post>;
    async fn set_post_image(&self, id: Id, image: Option<String>) -> RepoResult<Post>;
    async fn delete_post(&self, id: Id) -> RepoResult<()>;
    async fn page_posts(&self, scope: PostScope, page: PageNumber) -> RepoResult<Page<Post>>;
    async fn count_posts(&self, scope: PostScope) -> RepoResult<u64>;
}

#[async_trait]
pub trait CommentRepo: Send + Sync {
    async fn create_comment(&self, new: NewComment) -> RepoResult<Comment>;
    async fn list_comments(&self, post_id: Id) -> RepoResult<Vec<Comment>>;
}

#[async_trait]
pub trait FollowRepo: Send + Sync {
    /// Returns `true` when a new edge was written, `false` if it already existed.
    async fn follow(&self, follower: Id, followee: Id) -> RepoResult<bool>;
    /// Returns `true` when an edge was removed.
    async fn unfollow(&self, follower: Id, followee: Id) -> RepoResult<bool>;
    async fn is_following(&self, follower: Id, followee: Id) -> RepoResult<bool>;
    async fn count_followers(&self, user: Id) -> RepoResult<u64>;
    async fn count_following(&self, user: Id) -> RepoResult<u64>;
}

pub trait Repo: UserRepo + GroupRepo + PostRepo + CommentRepo + FollowRepo {}

impl<T> Repo for T where T: UserRepo + GroupRepo + PostRepo + CommentRepo + FollowRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use crate::pagination::resolve;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
    use tracing::{info, warn};

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        users: HashMap<Id, UserRow>,
        groups: HashMap<Id, Group>,
        posts: HashMap<Id, PostRow>,
        comments: HashMap<Id, CommentRow>,
        follows: HashMap<Id, Follow>,
        next_id: Id,
    }

    // `User` never serializes its password hash, so snapshots keep their own row.
    #[derive(Clone, Serialize, Deserialize)]
    struct UserRow {
        id: Id,
        username: String,
        email: String,
        password_hash: String,
        is_staff: bool,
        date_joined: chrono::DateTime<Utc>,
    }

    impl From<&UserRow> for User {
        fn from(row: &UserRow) -> Self {
            User {
                id: row.id,
                username: row.username.clone(),
                email: row.email.clone(),
                password_hash: row.password_hash.clone(),
                is_staff: row.is_staff,
                date_joined: row.date_joined,
            }
        }
    }

    // Stored without the joined username/slug columns.
    #[derive(Clone, Serialize, Deserialize)]
    struct PostRow {
        id: Id,
        text: String,
        pub_date: chrono::DateTime<Utc>,
        author_id: Id,
        group_id: Option<Id>,
        image: Option<String>,
    }

    #[derive(Clone, Serialize, Deserialize)]
    struct CommentRow {
        id: Id,
        post_id: Id,
        author_id: Id,
        text: String,
        created: chrono::DateTime<Utc>,
    }

    impl State {
        fn next_id(&mut self) -> Id {
            self.next_id += 1;
            self.next_id
        }

        fn post_view(&self, row: &PostRow) -> Post {
            Post {
                id: row.id,
                text: row.text.clone(),
                pub_date: row.pub_date,
                author_id: row.author_id,
                author: self.users.get(&row.author_id).map(|u| u.username.clone()).unwrap_or_default(),
                group_id: row.group_id,
                group: row.group_id.and_then(|g| self.groups.get(&g)).map(|g| g.slug.clone()),
                image: row.image.clone(),
            }
        }

        fn in_scope(&self, row: &PostRow, scope: PostScope) -> bool {
            match scope {
                PostScope::All => true,
                PostScope::Group(g) => row.group_id == Some(g),
                PostScope::Author(a) => row.author_id == a,
                PostScope::FollowedBy(u) => self
                    .follows
                    .values()
                    .any(|f| f.follower_id == u && f.followee_id == row.author_id),
            }
        }

        fn scoped_posts(&self, scope: PostScope) -> Vec<&PostRow> {
            let mut v: Vec<_> = self.posts.values().filter(|p| self.in_scope(p, scope)).collect();
            v.sort_by(|a, b| b.pub_date.cmp(&a.pub_date).then(b.id.cmp(&a.id))); // newest first
            v
        }

        fn remove_post(&mut self, id: Id) -> bool {
            let existed = self.posts.remove(&id).is_some();
            self.comments.retain(|_, c| c.post_id != id);
            existed
        }
    }

    /// Map-backed repository. With a snapshot path every write is flushed to
    /// a JSON file that is read back on startup.
    #[derive(Clone, Default)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Option<Arc<PathBuf>>,
    }

    impl InMemRepo {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
            let path = path.into();
            let state = Self::load_state_from(&path);
            Self { state: Arc::new(RwLock::new(state)), snapshot_path: Some(Arc::new(path)) }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        info!(path = %path.display(), "loaded in-memory snapshot");
                        s
                    }
                    Err(e) => {
                        warn!(path = %path.display(), "failed to parse snapshot: {e}; starting empty");
                        State::default()
                    }
                },
                Err(e) => {
                    info!(path = %path.display(), "no snapshot ({e}); starting empty");
                    State::default()
                }
            }
        }

        fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
            self.state.read().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }

        fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
            self.state.write().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }

        fn persist(&self) {
            let Some(path) = self.snapshot_path.as_deref() else { return };
            let serialized = match self.read() {
                Ok(state) => serde_json::to_vec_pretty(&*state),
                Err(_) => return,
            };
            let bytes = match serialized {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("failed to serialize snapshot: {e}");
                    return;
                }
            };
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            if let Err(e) = std::fs::write(path, bytes) {
                warn!(path = %path.display(), "failed to write snapshot: {e}");
            }
        }
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            let mut s = self.write()?;
            if s.users.values().any(|u| u.username == new.username) {
                return Err(RepoError::Conflict);
            }
            let id = s.next_id();
            let row = UserRow {
                id,
                username: new.username,
                email: new.email,
                password_hash: new.password_hash,
                is_staff: new.is_staff,
                date_joined: Utc::now(),
            };
            let user = User::from(&row);
            s.users.insert(id, row);
            drop(s);
            self.persist();
            Ok(user)
        }

        async fn get_user(&self, id: Id) -> RepoResult<User> {
            self.read()?.users.get(&id).map(User::from).ok_or(RepoError::NotFound)
        }

        async fn get_user_by_username(&self, username: &str) -> RepoResult<User> {
            self.read()?
                .users
                .values()
                .find(|u| u.username == username)
                .map(User::from)
                .ok_or(RepoError::NotFound)
        }

        async fn delete_user(&self, id: Id) -> RepoResult<()> {
            let mut s = self.write()?;
            if s.users.remove(&id).is_none() {
                return Err(RepoError::NotFound);
            }
            let owned: Vec<Id> = s.posts.values().filter(|p| p.author_id == id).map(|p| p.id).collect();
            for post_id in owned {
                s.remove_post(post_id);
            }
            s.comments.retain(|_, c| c.author_id != id);
            s.follows.retain(|_, f| f.follower_id != id && f.followee_id != id);
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl GroupRepo for InMemRepo {
        async fn create_group(&self, new: NewGroup) -> RepoResult<Group> {
            let mut s = self.write()?;
            if s.groups.values().any(|g| g.slug == new.slug) {
                return Err(RepoError::Conflict);
            }
            let id = s.next_id();
            let group = Group { id, title: new.title, slug: new.slug, description: new.description };
            s.groups.insert(id, group.clone());
            drop(s);
            self.persist();
            Ok(group)
        }

        async fn get_group(&self, id: Id) -> RepoResult<Group> {
            self.read()?.groups.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn get_group_by_slug(&self, slug: &str) -> RepoResult<Group> {
            self.read()?
                .groups
                .values()
                .find(|g| g.slug == slug)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn list_groups(&self) -> RepoResult<Vec<Group>> {
            let mut v: Vec<_> = self.read()?.groups.values().cloned().collect();
            v.sort_by(|a, b| a.title.cmp(&b.title));
            Ok(v)
        }

        async fn delete_group(&self, id: Id) -> RepoResult<()> {
            let mut s = self.write()?;
            if s.groups.remove(&id).is_none() {
                return Err(RepoError::NotFound);
            }
            for post in s.posts.values_mut().filter(|p| p.group_id == Some(id)) {
                post.group_id = None;
            }
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn create_post(&self, new: NewPost) -> RepoResult<Post> {
            let mut s = self.write()?;
            if !s.users.contains_key(&new.author_id) {
                return Err(RepoError::NotFound);
            }
            if let Some(g) = new.group_id {
                if !s.groups.contains_key(&g) {
                    return Err(RepoError::NotFound);
                }
            }
            let id = s.next_id();
            let row = PostRow {
                id,
                text: new.text,
                pub_date: Utc::now(),
                author_id: new.author_id,
                group_id: new.group_id,
                image: None,
            };
            let post = s.post_view(&row);
            s.posts.insert(id, row);
            drop(s);
            self.persist();
            Ok(post)
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let s = self.read()?;
            s.posts.get(&id).map(|row| s.post_view(row)).ok_or(RepoError::NotFound)
        }

        async fn update_post(&self, id: Id, changes: PostChanges) -> RepoResult<Post> {
            let mut s = self.write()?;
            if let Some(g) = changes.group_id {
                if !s.groups.contains_key(&g) {
                    return Err(RepoError::NotFound);
                }
            }
            let row = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            row.text = changes.text;
            row.group_id = changes.group_id;
            let row = row.clone();
            let post = s.post_view(&row);
            drop(s);
            self.persist();
            Ok(post)
        }

        async fn set_post_image(&self, id: Id, image: Option<String>) -> RepoResult<Post> {
            let mut s = self.write()?;
            let row = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            row.image = image;
            let row = row.clone();
            let post = s.post_view(&row);
            drop(s);
            self.persist();
            Ok(post)
        }

        async fn delete_post(&self, id: Id) -> RepoResult<()> {
            let mut s = self.write()?;
            if !s.remove_post(id) {
                return Err(RepoError::NotFound);
            }
            drop(s);
            self.persist();
            Ok(())
        }

        async fn page_posts(&self, scope: PostScope, page: PageNumber) -> RepoResult<Page<Post>> {
            let s = self.read()?;
            let rows = s.scoped_posts(scope);
            let count = rows.len() as u64;
            let window = resolve(page, count);
            let items = rows
                .into_iter()
                .skip(window.offset as usize)
                .take(window.limit as usize)
                .map(|row| s.post_view(row))
                .collect();
            Ok(Page::new(items, window, count))
        }

        async fn count_posts(&self, scope: PostScope) -> RepoResult<u64> {
            let s = self.read()?;
            Ok(s.posts.values().filter(|p| s.in_scope(p, scope)).count() as u64)
        }
    }

    #[async_trait]
    impl CommentRepo for InMemRepo {
        async fn create_comment(&self, new: NewComment) -> RepoResult<Comment> {
            let mut s = self.write()?;
            if !s.posts.contains_key(&new.post_id) {
                return Err(RepoError::NotFound);
            }
            let author = s.users.get(&new.author_id).map(|u| u.username.clone()).ok_or(RepoError::NotFound)?;
            let id = s.next_id();
            let row = CommentRow {
                id,
                post_id: new.post_id,
                author_id: new.author_id,
                text: new.text,
                created: Utc::now(),
            };
            let comment = Comment {
                id,
                post_id: row.post_id,
                author_id: row.author_id,
                author,
                text: row.text.clone(),
                created: row.created,
            };
            s.comments.insert(id, row);
            drop(s);
            self.persist();
            Ok(comment)
        }

        async fn list_comments(&self, post_id: Id) -> RepoResult<Vec<Comment>> {
            let s = self.read()?;
            let mut v: Vec<Comment> = s
                .comments
                .values()
                .filter(|c| c.post_id == post_id)
                .map(|c| Comment {
                    id: c.id,
                    post_id: c.post_id,
                    author_id: c.author_id,
                    author: s.users.get(&c.author_id).map(|u| u.username.clone()).unwrap_or_default(),
                    text: c.text.clone(),
                    created: c.created,
                })
                .collect();
            v.sort_by(|a, b| b.created.cmp(&a.created).then(b.id.cmp(&a.id)));
            Ok(v)
        }
    }

    #[async_trait]
    impl FollowRepo for InMemRepo {
        async fn follow(&self, follower: Id, followee: Id) -> RepoResult<bool> {
            let mut s = self.write()?;
            if !s.users.contains_key(&follower) || !s.users.contains_key(&followee) {
                return Err(RepoError::NotFound);
            }
            if s.follows.values().any(|f| f.follower_id == follower && f.followee_id == followee) {
                return Ok(false);
            }
            let id = s.next_id();
            s.follows.insert(id, Follow { id, follower_id: follower, followee_id: followee });
            drop(s);
            self.persist();
            Ok(true)
        }

        async fn unfollow(&self, follower: Id, followee: Id) -> RepoResult<bool> {
            let mut s = self.write()?;
            let before = s.follows.len();
            s.follows.retain(|_, f| !(f.follower_id == follower && f.followee_id == followee));
            let removed = s.follows.len() != before;
            drop(s);
            if removed {
                self.persist();
            }
            Ok(removed)
        }

        async fn is_following(&self, follower: Id, followee: Id) -> RepoResult<bool> {
            Ok(self
                .read()?
                .follows
                .values()
                .any(|f| f.follower_id == follower && f.followee_id == followee))
        }

        async fn count_followers(&self, user: Id) -> RepoResult<u64> {
            Ok(self.read()?.follows.values().filter(|f| f.followee_id == user).count() as u64)
        }

        async fn count_following(&self, user: Id) -> RepoResult<u64> {
            Ok(self.read()?.follows.values().filter(|f| f.follower_id == user).count() as u64)
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use crate::pagination::resolve;
    use sqlx::{Pool, Postgres};

    const POST_SELECT: &str = r#"
        SELECT p.id, p.text, p.pub_date, p.author_id, u.username AS author,
               p.group_id, g.slug AS "group", p.image
        FROM posts p
        JOIN users u ON u.id = p.author_id
        LEFT JOIN groups g ON g.id = p.group_id
    "#;

    const COMMENT_SELECT: &str = r#"
        SELECT c.id, c.post_id, c.author_id, u.username AS author, c.text, c.created
        FROM comments c
        JOIN users u ON u.id = c.author_id
    "#;

    fn internal(e: sqlx::Error) -> RepoError {
        RepoError::Internal(e.to_string())
    }

    /// Unique violations become `Conflict`, FK violations `NotFound`.
    fn write_error(e: sqlx::Error) -> RepoError {
        if let sqlx::Error::Database(db) = &e {
            match db.code().as_deref() {
                Some("23505") => return RepoError::Conflict,
                Some("23503") => return RepoError::NotFound,
                _ => {}
            }
        }
        internal(e)
    }

    fn read_error(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            other => internal(other),
        }
    }

    /// WHERE clause for a scope; `$1` is bound to the scope's id when present.
    fn scope_filter(scope: PostScope) -> (&'static str, Option<Id>) {
        match scope {
            PostScope::All => ("", None),
            PostScope::Group(g) => ("WHERE p.group_id = $1", Some(g)),
            PostScope::Author(a) => ("WHERE p.author_id = $1", Some(a)),
            PostScope::FollowedBy(u) => (
                "WHERE p.author_id IN (SELECT f.followee_id FROM follows f WHERE f.follower_id = $1)",
                Some(u),
            ),
        }
    }

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }

        pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
            sqlx::migrate!("./migrations").run(&self.pool).await
        }
    }

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            sqlx::query_as::<_, User>(
                "INSERT INTO users (username, email, password_hash, is_staff) VALUES ($1,$2,$3,$4)
                 RETURNING id, username, email, password_hash, is_staff, date_joined",
            )
            .bind(&new.username)
            .bind(&new.email)
            .bind(&new.password_hash)
            .bind(new.is_staff)
            .fetch_one(&self.pool)
            .await
            .map_err(write_error)
        }

        async fn get_user(&self, id: Id) -> RepoResult<User> {
            sqlx::query_as::<_, User>(
                "SELECT id, username, email, password_hash, is_staff, date_joined FROM users WHERE id=$1",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(read_error)
        }

        async fn get_user_by_username(&self, username: &str) -> RepoResult<User> {
            sqlx::query_as::<_, User>(
                "SELECT id, username, email, password_hash, is_staff, date_joined FROM users WHERE username=$1",
            )
            .bind(username)
            .fetch_one(&self.pool)
            .await
            .map_err(read_error)
        }

        async fn delete_user(&self, id: Id) -> RepoResult<()> {
            // posts, comments and follows go with it through ON DELETE CASCADE
            let res = sqlx::query("DELETE FROM users WHERE id=$1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 { return Err(RepoError::NotFound); }
            Ok(())
        }
    }

    #[async_trait]
    impl GroupRepo for PgRepo {
        async fn create_group(&self, new: NewGroup) -> RepoResult<Group> {
            sqlx::query_as::<_, Group>(
                "INSERT INTO groups (title, slug, description) VALUES ($1,$2,$3) RETURNING id, title, slug, description",
            )
            .bind(&new.title)
            .bind(&new.slug)
            .bind(&new.description)
            .fetch_one(&self.pool)
            .await
            .map_err(write_error)
        }

        async fn get_group(&self, id: Id) -> RepoResult<Group> {
            sqlx::query_as::<_, Group>("SELECT id, title, slug, description FROM groups WHERE id=$1")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(read_error)
        }

        async fn get_group_by_slug(&self, slug: &str) -> RepoResult<Group> {
            sqlx::query_as::<_, Group>("SELECT id, title, slug, description FROM groups WHERE slug=$1")
                .bind(slug)
                .fetch_one(&self.pool)
                .await
                .map_err(read_error)
        }

        async fn list_groups(&self) -> RepoResult<Vec<Group>> {
            sqlx::query_as::<_, Group>("SELECT id, title, slug, description FROM groups ORDER BY title")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)
        }

        async fn delete_group(&self, id: Id) -> RepoResult<()> {
            // posts.group_id is ON DELETE SET NULL
            let res = sqlx::query("DELETE FROM groups WHERE id=$1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 { return Err(RepoError::NotFound); }
            Ok(())
        }
    }

    #[async_trait]
    impl PostRepo for PgRepo {
        async fn create_post(&self, new: NewPost) -> RepoResult<Post> {
            let id: Id = sqlx::query_scalar(
                "INSERT INTO posts (text, author_id, group_id) VALUES ($1,$2,$3) RETURNING id",
            )
            .bind(&new.text)
            .bind(new.author_id)
            .bind(new.group_id)
            .fetch_one(&self.pool)
            .await
            .map_err(write_error)?;
            self.get_post(id).await
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            sqlx::query_as::<_, Post>(&format!("{POST_SELECT} WHERE p.id = $1"))
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(read_error)
        }

        async fn update_post(&self, id: Id, changes: PostChanges) -> RepoResult<Post> {
            let res = sqlx::query("UPDATE posts SET text=$2, group_id=$3 WHERE id=$1")
                .bind(id)
                .bind(&changes.text)
                .bind(changes.group_id)
                .execute(&self.pool)
                .await
                .map_err(write_error)?;
            if res.rows_affected() == 0 { return Err(RepoError::NotFound); }
            self.get_post(id).await
        }

        async fn set_post_image(&self, id: Id, image: Option<String>) -> RepoResult<Post> {
            let res = sqlx::query("UPDATE posts SET image=$2 WHERE id=$1")
                .bind(id)
                .bind(image.as_deref())
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 { return Err(RepoError::NotFound); }
            self.get_post(id).await
        }

        async fn delete_post(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM posts WHERE id=$1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 { return Err(RepoError::NotFound); }
            Ok(())
        }

        async fn page_posts(&self, scope: PostScope, page: PageNumber) -> RepoResult<Page<Post>> {
            let count = self.count_posts(scope).await?;
            let window = resolve(page, count);
            let (filter, bound) = scope_filter(scope);
            let sql = match bound {
                Some(_) => format!("{POST_SELECT} {filter} ORDER BY p.pub_date DESC, p.id DESC LIMIT $2 OFFSET $3"),
                None => format!("{POST_SELECT} ORDER BY p.pub_date DESC, p.id DESC LIMIT $1 OFFSET $2"),
            };
            let mut q = sqlx::query_as::<_, Post>(&sql);
            if let Some(id) = bound {
                q = q.bind(id);
            }
            let items = q
                .bind(window.limit as i64)
                .bind(window.offset as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
            Ok(Page::new(items, window, count))
        }

        async fn count_posts(&self, scope: PostScope) -> RepoResult<u64> {
            let (filter, bound) = scope_filter(scope);
            let sql = format!("SELECT COUNT(*) FROM posts p {filter}");
            let mut q = sqlx::query_scalar::<_, i64>(&sql);
            if let Some(id) = bound {
                q = q.bind(id);
            }
            let n = q.fetch_one(&self.pool).await.map_err(internal)?;
            Ok(n as u64)
        }
    }

    #[async_trait]
    impl CommentRepo for PgRepo {
        async fn create_comment(&self, new: NewComment) -> RepoResult<Comment> {
            let id: Id = sqlx::query_scalar(
                "INSERT INTO comments (post_id, author_id, text) VALUES ($1,$2,$3) RETURNING id",
            )
            .bind(new.post_id)
            .bind(new.author_id)
            .bind(&new.text)
            .fetch_one(&self.pool)
            .await
            .map_err(write_error)?;
            sqlx::query_as::<_, Comment>(&format!("{COMMENT_SELECT} WHERE c.id = $1"))
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(read_error)
        }

        async fn list_comments(&self, post_id: Id) -> RepoResult<Vec<Comment>> {
            sqlx::query_as::<_, Comment>(&format!(
                "{COMMENT_SELECT} WHERE c.post_id = $1 ORDER BY c.created DESC, c.id DESC"
            ))
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)
        }
    }

    #[async_trait]
    impl FollowRepo for PgRepo {
        async fn follow(&self, follower: Id, followee: Id) -> RepoResult<bool> {
            // a concurrent duplicate loses on the unique constraint and reports "already there"
            let res = sqlx::query(
                "INSERT INTO follows (follower_id, followee_id) VALUES ($1,$2)
                 ON CONFLICT (follower_id, followee_id) DO NOTHING",
            )
            .bind(follower)
            .bind(followee)
            .execute(&self.pool)
            .await
            .map_err(write_error)?;
            Ok(res.rows_affected() == 1)
        }

        async fn unfollow(&self, follower: Id, followee: Id) -> RepoResult<bool> {
            let res = sqlx::query("DELETE FROM follows WHERE follower_id=$1 AND followee_id=$2")
                .bind(follower)
                .bind(followee)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            Ok(res.rows_affected() > 0)
        }

        async fn is_following(&self, follower: Id, followee: Id) -> RepoResult<bool> {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM follows WHERE follower_id=$1 AND followee_id=$2)",
            )
            .bind(follower)
            .bind(followee)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }

        async fn count_followers(&self, user: Id) -> RepoResult<u64> {
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM follows WHERE followee_id=$1")
                .bind(user)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            Ok(n as u64)
        }

        async fn count_following(&self, user: Id) -> RepoResult<u64> {
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM follows WHERE follower_id=$1")
                .bind(user)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            Ok(n as u64)
        }
    }
}
