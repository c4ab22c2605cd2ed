//! Body and query extractors whose rejections are Problem documents.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use http::StatusCode;
use serde::de::DeserializeOwned;

use super::problem::Problem;

const CODE_INVALID_REQUEST: &str = "SERVICE_REGISTRY_INVALID_REQUEST";

fn invalid_request(status: StatusCode, detail: String) -> Problem {
    let problem = Problem::new(status, "Invalid request", detail)
        .with_type(format!("urn:service-registry:error:{CODE_INVALID_REQUEST}"))
        .with_code(CODE_INVALID_REQUEST);
    match tracing::Span::current().id() {
        Some(id) => problem.with_trace_id(id.into_u64().to_string()),
        None => problem,
    }
}

impl From<JsonRejection> for Problem {
    fn from(rejection: JsonRejection) -> Self {
        invalid_request(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for Problem {
    fn from(rejection: QueryRejection) -> Self {
        invalid_request(rejection.status(), rejection.body_text())
    }
}

/// JSON request body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Problem;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// Query string parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Problem;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Payload {
        #[allow(dead_code)]
        name: String,
    }

    #[tokio::test]
    async fn test_malformed_json_is_a_problem() {
        let req = http::Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let Err(problem) = ApiJson::<Payload>::from_request(req, &()).await else {
            panic!("malformed body must be rejected");
        };
        assert_eq!(problem.status, StatusCode::BAD_REQUEST);
        assert_eq!(problem.code, CODE_INVALID_REQUEST);
        assert!(!problem.detail.is_empty());
    }

    #[tokio::test]
    async fn test_missing_content_type_is_a_problem() {
        let req = http::Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from(r#"{"name":"calc"}"#))
            .unwrap();

        let Err(problem) = ApiJson::<Payload>::from_request(req, &()).await else {
            panic!("body without content type must be rejected");
        };
        assert_eq!(problem.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_bad_query_is_a_problem() {
        let req = http::Request::builder().uri("/?other=1").body(()).unwrap();
        let (mut parts, ()) = req.into_parts();

        let Err(problem) = ApiQuery::<Payload>::from_request_parts(&mut parts, &()).await else {
            panic!("query without required field must be rejected");
        };
        assert_eq!(problem.status, StatusCode::BAD_REQUEST);
        assert_eq!(problem.code, CODE_INVALID_REQUEST);
    }
}
