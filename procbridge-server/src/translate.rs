//! Turns an HTTP request into a program invocation.

use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::LengthLimitError;
use mime::Mime;
use procbridge::invocation::InvocationRequest;
use procbridge::protocol::{self, FORM_SIZE_LIMIT};

use crate::routes::RouteEntry;

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("failed to read request body: {0}")]
    Body(#[source] axum::Error),
    #[error("malformed multipart body: {0}")]
    Multipart(#[from] multer::Error),
}

impl IntoResponse for TranslateError {
    fn into_response(self) -> Response {
        let status = match self {
            TranslateError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TranslateError::Body(_) | TranslateError::Multipart(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// What to do with a request.
#[derive(Debug)]
pub enum Translation {
    /// Run the program and answer with its output as `media_type`.
    Invoke {
        request: InvocationRequest,
        media_type: Mime,
    },
    /// Answer with an empty `application/json` response, the program is not run.
    // FIXME: hand JSON bodies to the program instead of answering empty.
    Json,
}

/// Reads the whole request and builds the invocation of `route`'s program.
///
/// The body is buffered once, then parsed as a form and also kept as stdin of the program.
pub async fn translate(
    route: &RouteEntry,
    request: Request,
) -> Result<Translation, TranslateError> {
    let (parts, body) = request.into_parts();
    let content_type = header_text(&parts.headers, &header::CONTENT_TYPE);
    if protocol::is_json_request(content_type.as_deref()) {
        return Ok(Translation::Json);
    }

    let body = axum::body::to_bytes(body, FORM_SIZE_LIMIT)
        .await
        .map_err(|e| {
            if exceeds_limit(&e) {
                TranslateError::PayloadTooLarge {
                    limit: FORM_SIZE_LIMIT,
                }
            } else {
                TranslateError::Body(e)
            }
        })?;

    let query = parts
        .uri
        .query()
        .map(|query| protocol::parse_urlencoded(query.as_bytes()))
        .unwrap_or_default();
    // Urlencoded values come before those of the query string, multipart values after them.
    let fields = match body_form(&parts.method, content_type.as_deref(), &body).await? {
        BodyForm::Urlencoded(mut fields) => {
            fields.extend(query);
            fields
        }
        BodyForm::Multipart(fields) => query.into_iter().chain(fields).collect(),
        BodyForm::None => query,
    };

    let accept = header_text(&parts.headers, &header::ACCEPT);
    let mut variables = protocol::form_entries(fields);
    variables.extend(protocol::header_entries(
        accept.as_deref(),
        header_text(&parts.headers, &header::HOST).as_deref(),
        header_text(&parts.headers, &header::USER_AGENT).as_deref(),
    ));

    Ok(Translation::Invoke {
        request: InvocationRequest::new(route.program(), route.timeout(), variables, body),
        media_type: protocol::response_media_type(accept.as_deref()),
    })
}

/// The first value of a header, passed on even if it is not valid UTF-8.
fn header_text(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

fn exceeds_limit(error: &axum::Error) -> bool {
    let mut source = std::error::Error::source(error);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Form fields found in a request body.
enum BodyForm {
    Urlencoded(Vec<(String, String)>),
    Multipart(Vec<(String, String)>),
    None,
}

async fn body_form(
    method: &Method,
    content_type: Option<&str>,
    body: &Bytes,
) -> Result<BodyForm, TranslateError> {
    let Some((content_type, media)) =
        content_type.and_then(|value| Some((value, value.parse::<Mime>().ok()?)))
    else {
        return Ok(BodyForm::None);
    };

    if media.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str() {
        // Urlencoded bodies only count for methods which are expected to carry one.
        if matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
            return Ok(BodyForm::Urlencoded(protocol::parse_urlencoded(body)));
        }
        return Ok(BodyForm::None);
    }
    if media.type_() == mime::MULTIPART && media.subtype() == mime::FORM_DATA {
        let fields = multipart_fields(content_type, body.clone()).await?;
        return Ok(BodyForm::Multipart(fields));
    }
    Ok(BodyForm::None)
}

async fn multipart_fields(
    content_type: &str,
    body: Bytes,
) -> Result<Vec<(String, String)>, TranslateError> {
    let boundary = multer::parse_boundary(content_type)?;
    let stream = futures_util::stream::once(async move { Ok::<_, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        // Uploaded files only reach the program through stdin.
        if field.file_name().is_some() {
            continue;
        }
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        fields.push((name, field.text().await?));
    }
    Ok(fields)
}
