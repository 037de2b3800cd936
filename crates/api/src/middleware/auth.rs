//! Caller identity extractor.
//!
//! Authentication happens upstream; the gateway forwards the
//! authenticated user in the `X-User-Id` header.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use quantimage_core::error::CoreError;

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated caller, taken from the `X-User-Id` header.
///
/// ```ignore
/// async fn my_handler(user: AuthUser) -> AppResult<Json<()>> {
///     tracing::info!(user_id = %user.user_id, "handling request");
///     Ok(Json(()))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

impl AuthUser {
    /// `Forbidden` unless the caller is `owner`.
    pub fn ensure_owns(&self, owner: &str, what: &str) -> Result<(), AppError> {
        if self.user_id != owner {
            return Err(AppError::Core(CoreError::Forbidden(format!(
                "Cannot access another user's {what}"
            ))));
        }
        Ok(())
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized("Missing X-User-Id header".into()))
            })?;

        Ok(AuthUser {
            user_id: user_id.to_string(),
        })
    }
}
