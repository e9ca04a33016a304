use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use super::AppState;
use crate::error::AppError;

/// Caller identity attached to every request by [`authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppUser {
    Authenticated { email: String },
    Anonymous,
}

impl AppUser {
    /// The account email, or 401 for anonymous callers.
    pub fn require(&self) -> Result<&str, AppError> {
        match self {
            AppUser::Authenticated { email } => Ok(email),
            AppUser::Anonymous => Err(AppError::unauthorized("not authenticated")),
        }
    }

    pub fn email(&self) -> Option<&str> {
        self.require().ok()
    }
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Resolves the bearer token, if any. A present but invalid token is rejected.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = match request.headers().get(AUTHORIZATION) {
        None => AppUser::Anonymous,
        Some(header) => {
            let token = header
                .to_str()
                .ok()
                .and_then(bearer_token)
                .ok_or_else(|| AppError::unauthorized("invalid token"))?;
            let claims = state.tokens.verify(token)?;
            AppUser::Authenticated { email: claims.sub }
        }
    };

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_scheme_case_insensitively() {
        assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def"));
        assert_eq!(bearer_token("bearer   abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }

    #[test]
    fn anonymous_callers_are_unauthorized() {
        assert!(AppUser::Anonymous.require().is_err());
        let user = AppUser::Authenticated {
            email: "a@b.com".into(),
        };
        assert_eq!(user.require().unwrap(), "a@b.com");
    }
}
