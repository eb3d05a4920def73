//! Wire types for the auth endpoints

use serde::{Deserialize, Serialize};

/// The signed-in user as reported by `GET /auth/check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    #[serde(alias = "_id")]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// `/auth/check` answers either with the user directly or wrapped.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum CheckResponse {
    Wrapped { user: UserIdentity },
    Bare(UserIdentity),
}

impl CheckResponse {
    pub(crate) fn into_user(self) -> UserIdentity {
        match self {
            CheckResponse::Wrapped { user } => user,
            CheckResponse::Bare(user) => user,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh tokens may or may not be rotated by the server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_response_shapes() {
        let wrapped: CheckResponse =
            serde_json::from_value(json!({"user": {"_id": "u1", "email": "a@b.c"}})).unwrap();
        assert_eq!(wrapped.into_user().id, "u1");

        let bare: CheckResponse =
            serde_json::from_value(json!({"id": "u2", "role": "admin"})).unwrap();
        let user = bare.into_user();
        assert_eq!(user.id, "u2");
        assert_eq!(user.role.as_deref(), Some("admin"));
    }

    #[test]
    fn test_refresh_response_without_rotation() {
        let response: RefreshResponse =
            serde_json::from_value(json!({"accessToken": "a"})).unwrap();
        assert_eq!(response.access_token, "a");
        assert!(response.refresh_token.is_none());
    }
}
