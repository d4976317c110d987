use actix_web::http::header;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use actix_web::ResponseError;
use serde::Serialize;
use uuid::Uuid;

/// Walk the source chain so `Debug` output shows every cause, not just the
/// outermost message.
pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{e}\n")?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{cause}")?;
        current = cause.source();
    }
    Ok(())
}

/// RFC 7807 problem body. Internal detail never leaks into 5xx responses;
/// the `correlation_id` is the handle for log lookup.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
    pub correlation_id: Uuid,
}

impl ProblemDetails {
    pub fn new(status: StatusCode, title: &str, detail: String, correlation_id: Uuid) -> Self {
        Self {
            problem_type: format!("https://notify-dispatch.dev/problems/{}", slugify(title)),
            title: title.to_string(),
            status: status.as_u16(),
            detail,
            instance: format!("urn:correlation:{correlation_id}"),
            correlation_id,
        }
    }
}

fn slugify(title: &str) -> String {
    title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// The exhaustive error surface of the HTTP layer, per the service taxonomy.
#[derive(thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("authentication failed")]
    Auth(#[source] anyhow::Error),
    #[error("idempotency key was reused with a different request body")]
    IdempotencyConflict { correlation_id: Uuid },
    #[error("rate limit exceeded")]
    RateLimited {
        retry_after: std::time::Duration,
        correlation_id: Uuid,
    },
    #[error("service is shedding load")]
    Shedding {
        retry_after: std::time::Duration,
        correlation_id: Uuid,
    },
    #[error("service unavailable")]
    Unavailable { correlation_id: Uuid },
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl std::fmt::Debug for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ApiError {
    fn correlation_id(&self) -> Uuid {
        match self {
            ApiError::IdempotencyConflict { correlation_id }
            | ApiError::RateLimited { correlation_id, .. }
            | ApiError::Shedding { correlation_id, .. }
            | ApiError::Unavailable { correlation_id } => *correlation_id,
            _ => Uuid::new_v4(),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::IdempotencyConflict { .. } => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } | ApiError::Shedding { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let correlation_id = self.correlation_id();
        let detail = match self {
            // 500s carry the correlation id only, never the cause chain
            ApiError::Unexpected(_) => "an internal error occurred".to_string(),
            other => other.to_string(),
        };
        let problem = ProblemDetails::new(status, title_for(status), detail, correlation_id);

        let mut builder = HttpResponse::build(status);
        builder.insert_header((header::CONTENT_TYPE, "application/problem+json"));
        if let ApiError::RateLimited { retry_after, .. } | ApiError::Shedding { retry_after, .. } =
            self
        {
            builder.insert_header((header::RETRY_AFTER, retry_after.as_secs().max(1).to_string()));
        }
        builder.json(problem)
    }
}

fn title_for(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "validation failed",
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::CONFLICT => "idempotency conflict",
        StatusCode::TOO_MANY_REQUESTS => "rate limited",
        StatusCode::SERVICE_UNAVAILABLE => "service unavailable",
        _ => "internal error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let err = ApiError::Unexpected(anyhow::anyhow!("password=hunter2 exploded"));
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = actix_web::body::to_bytes(resp.into_body());
        let body = futures::executor::block_on(body).unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains("correlation_id"));
    }

    #[test]
    fn rate_limited_carries_retry_after_header() {
        let err = ApiError::RateLimited {
            retry_after: std::time::Duration::from_secs(7),
            correlation_id: Uuid::new_v4(),
        };
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "7");
    }

    #[test]
    fn problem_type_is_a_stable_slug() {
        let p = ProblemDetails::new(
            StatusCode::BAD_REQUEST,
            "validation failed",
            "x".into(),
            Uuid::new_v4(),
        );
        assert!(p.problem_type.ends_with("validation-failed"));
    }
}
