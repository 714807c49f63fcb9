use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validator::Validator;

/// The record this service consumes: one user document per message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phone: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<DateTime<Utc>>,
}

pub fn user_validator() -> Validator<User> {
    Validator::new()
        .required("id", |u: &User| u.id.as_str())
        .username("username", |u: &User| u.username.as_str())
        .max_len("username", 100, |u: &User| u.username.as_str())
        .required("email", |u: &User| u.email.as_str())
        .email("email", |u: &User| u.email.as_str())
        .max_len("email", 100, |u: &User| u.email.as_str())
        .required("url", |u: &User| u.url.as_str())
        .url("url", |u: &User| u.url.as_str())
        .max_len("url", 255, |u: &User| u.url.as_str())
        .required("phone", |u: &User| u.phone.as_str())
        .phone("phone", |u: &User| u.phone.as_str())
        .max_len("phone", 18, |u: &User| u.phone.as_str())
        .custom("active", "active", "user must be active", |u: &User| u.active)
}
