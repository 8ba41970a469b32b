use std::collections::BTreeMap;

use actix_multipart::Multipart;
use futures_util::TryStreamExt as _;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::models::Id;

pub const REQUIRED: &str = "This field is required.";
pub const INVALID_CHOICE: &str = "Select a valid choice. That choice is not one of the available choices.";
pub const INVALID_IMAGE: &str =
    "Upload a valid image. The file you uploaded was either not an image or a corrupted image.";
pub const IMAGE_TOO_LARGE: &str = "The uploaded image is too large.";
pub const TEXT_TOO_LONG: &str = "Ensure this value is at most 64 KiB.";
pub const INVALID_TEXT: &str = "Enter valid UTF-8 text.";

const IMAGE_SIZE_LIMIT: usize = 10 * 1024 * 1024; // 10 MB
const TEXT_SIZE_LIMIT: usize = 64 * 1024;

/// Raster formats a post image may use, with the file extension it is stored under.
const ALLOWED_IMAGES: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("image/bmp", "bmp"),
];

/// Usernames that would shadow a top-level route.
const RESERVED_USERNAMES: &[&str] = &["new", "follow", "group", "auth", "media", "admin", "docs", "metrics"];

/// Field name -> error messages, the shape a form is re-rendered with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormErrors(BTreeMap<String, Vec<String>>);

impl FormErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut e = Self::default();
        e.add(field, message);
        e
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    fn into_result<T>(self, ok: T) -> Result<T, FormErrors> {
        if self.is_empty() { Ok(ok) } else { Err(self) }
    }
}

impl std::fmt::Display for FormErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields: Vec<&str> = self.0.keys().map(String::as_str).collect();
        write!(f, "invalid fields: {}", fields.join(", "))
    }
}

fn required_text(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// An image that sniffs as an allowed raster type and decodes cleanly.
#[derive(Debug, Clone)]
pub struct ValidImage {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub extension: &'static str,
}

pub fn validate_image(bytes: Vec<u8>) -> Result<ValidImage, &'static str> {
    if bytes.len() > IMAGE_SIZE_LIMIT {
        return Err(IMAGE_TOO_LARGE);
    }
    let sniffed = infer::get(&bytes).map(|t| t.mime_type()).unwrap_or("application/octet-stream");
    let Some(&(mime, extension)) = ALLOWED_IMAGES.iter().find(|(m, _)| *m == sniffed) else {
        return Err(INVALID_IMAGE);
    };
    // a correct magic number is not enough, the whole image has to decode
    if image::load_from_memory(&bytes).is_err() {
        return Err(INVALID_IMAGE);
    }
    Ok(ValidImage { bytes, mime, extension })
}

/// Raw post submission as read off a multipart body. Problems found while
/// reading (oversize or non UTF-8 text) are kept in `errors`.
#[derive(Debug, Clone, Default)]
pub struct PostForm {
    pub text: Option<String>,
    pub group: Option<String>,
    pub image: Option<Vec<u8>>,
    pub clear_image: bool,
    pub errors: FormErrors,
}

/// Validated post submission.
#[derive(Debug, Clone)]
pub struct CleanPost {
    pub text: String,
    pub group_id: Option<Id>,
    pub image: Option<ValidImage>,
    pub clear_image: bool,
}

/// Reads a part, keeping at most `limit + 1` bytes. Returns whether the
/// part was longer than `limit`.
async fn read_part(field: &mut actix_multipart::Field, limit: usize) -> Result<(Vec<u8>, bool), ApiError> {
    let mut bytes: Vec<u8> = Vec::new();
    while let Some(chunk) = field.try_next().await.map_err(|e| {
        log::warn!("multipart read error: {e}");
        ApiError::BadRequest
    })? {
        let room = (limit + 1).saturating_sub(bytes.len());
        bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    let oversize = bytes.len() > limit;
    Ok((bytes, oversize))
}

impl PostForm {
    pub async fn from_multipart(mut payload: Multipart) -> Result<Self, ApiError> {
        let mut form = PostForm::default();
        while let Some(mut field) = payload.try_next().await.map_err(|e| {
            log::warn!("multipart error: {e}");
            ApiError::BadRequest
        })? {
            let name = field.content_disposition().get_name().map(str::to_string);
            match name.as_deref() {
                Some("image") => {
                    // one byte over the limit is enough for validation to reject it
                    let (bytes, _) = read_part(&mut field, IMAGE_SIZE_LIMIT).await?;
                    form.image = Some(bytes);
                }
                Some(text_field @ ("text" | "group")) => {
                    let (bytes, oversize) = read_part(&mut field, TEXT_SIZE_LIMIT).await?;
                    let value = form.text_part(text_field, bytes, oversize);
                    if text_field == "text" {
                        form.text = value;
                    } else {
                        form.group = value;
                    }
                }
                Some("image-clear") => {
                    let (bytes, _) = read_part(&mut field, 16).await?;
                    let v = String::from_utf8_lossy(&bytes).to_ascii_lowercase();
                    form.clear_image = matches!(v.trim(), "on" | "true" | "1");
                }
                _ => {
                    read_part(&mut field, 0).await?;
                }
            }
        }
        Ok(form)
    }

    fn text_part(&mut self, field: &str, bytes: Vec<u8>, oversize: bool) -> Option<String> {
        if oversize {
            self.errors.add(field, TEXT_TOO_LONG);
            return None;
        }
        match String::from_utf8(bytes) {
            Ok(text) => Some(text),
            Err(_) => {
                self.errors.add(field, INVALID_TEXT);
                None
            }
        }
    }

    /// Field-level checks. Group existence needs the store and is checked by
    /// the caller; a malformed group value is reported here.
    pub fn validate(self) -> Result<CleanPost, FormErrors> {
        let mut errors = self.errors;

        let text = required_text(self.text.as_deref());
        if text.is_none() && errors.field("text").is_none() {
            errors.add("text", REQUIRED);
        }

        let group_id = match self.group.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match raw.parse::<Id>() {
                Ok(id) => Some(id),
                Err(_) => {
                    errors.add("group", INVALID_CHOICE);
                    None
                }
            },
        };

        // an empty file part is an untouched file input
        let image = match self.image {
            Some(bytes) if !bytes.is_empty() => match validate_image(bytes) {
                Ok(img) => Some(img),
                Err(msg) => {
                    errors.add("image", msg);
                    None
                }
            },
            _ => None,
        };

        errors.into_result(CleanPost {
            text: text.unwrap_or_default(),
            group_id,
            image,
            clear_image: self.clear_image,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CommentForm {
    #[serde(default)]
    pub text: String,
}

impl CommentForm {
    pub fn validate(self) -> Result<String, FormErrors> {
        required_text(Some(&self.text)).ok_or_else(|| FormErrors::single("text", REQUIRED))
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SignupForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

impl SignupForm {
    pub fn validate(&self) -> Result<(), FormErrors> {
        let mut errors = FormErrors::default();
        let username = self.username.trim();
        if username.is_empty() {
            errors.add("username", REQUIRED);
        } else if username.chars().count() > 150
            || !username.chars().all(|c| c.is_alphanumeric() || "@.+-_".contains(c))
        {
            errors.add(
                "username",
                "Enter a valid username. This value may contain only letters, numbers, and @/./+/-/_ characters.",
            );
        } else if RESERVED_USERNAMES.contains(&username.to_ascii_lowercase().as_str()) {
            errors.add("username", "This username is not available.");
        }
        let email = self.email.trim();
        if email.is_empty() {
            errors.add("email", REQUIRED);
        } else if !email.contains('@') {
            errors.add("email", "Enter a valid email address.");
        }
        if self.password.is_empty() {
            errors.add("password", REQUIRED);
        } else if self.password.chars().count() < 8 {
            errors.add("password", "This password is too short. It must contain at least 8 characters.");
        }
        errors.into_result(())
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}
