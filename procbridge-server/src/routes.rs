use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use procbridge::protocol::{self, HostEnvironment};
use tokio::sync::Semaphore;

use crate::process::process;
use crate::translate::{translate, Translation};

/// Reasons a program cannot be served. All of them abort the startup.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("cannot get path of {program:?}: {source}")]
    Unresolvable {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("executable program {program:?} not found: {source}")]
    NotFound {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("{program:?} is not a file")]
    NotAFile { program: PathBuf },
    #[error("{program:?} is not executable")]
    NotExecutable { program: PathBuf },
    #[error("cannot derive a route from {program:?}")]
    InvalidRoutePath { program: PathBuf },
    #[error("{second:?} would be served under {url_path}, which already serves {first:?}")]
    Duplicate {
        url_path: String,
        first: PathBuf,
        second: PathBuf,
    },
}

/// A program served under its own url path.
#[derive(Debug)]
pub struct RouteEntry {
    url_path: String,
    program: PathBuf,
    timeout: Duration,
    /// Limits concurrent invocations, unlimited if `None`.
    permits: Option<Semaphore>,
}

impl RouteEntry {
    /// Resolves `program` against the current directory and checks that it can be executed.
    pub fn resolve(
        program: &Path,
        timeout: Duration,
        max_concurrent: Option<NonZeroUsize>,
    ) -> Result<Self, RouteError> {
        let absolute = std::path::absolute(program).map_err(|source| RouteError::Unresolvable {
            program: program.to_path_buf(),
            source,
        })?;
        let metadata = std::fs::metadata(&absolute).map_err(|source| RouteError::NotFound {
            program: absolute.clone(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(RouteError::NotAFile { program: absolute });
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(RouteError::NotExecutable { program: absolute });
            }
        }

        // Axum would treat `:name` and `*name` segments as captures.
        let Some(url_path) = protocol::url_path(&absolute)
            .filter(|path| path.len() > 1 && !path.contains(|c: char| c == ':' || c == '*'))
        else {
            return Err(RouteError::InvalidRoutePath { program: absolute });
        };

        Ok(Self {
            url_path,
            program: absolute,
            timeout,
            permits: max_concurrent.map(|permits| Semaphore::new(permits.get())),
        })
    }

    pub fn url_path(&self) -> &str {
        &self.url_path
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Resolves every program, rejecting programs which would share a url path.
pub fn resolve_all(
    programs: &[PathBuf],
    timeout: Duration,
    max_concurrent: Option<NonZeroUsize>,
) -> Result<Vec<RouteEntry>, RouteError> {
    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut entries = Vec::with_capacity(programs.len());
    for program in programs {
        let entry = RouteEntry::resolve(program, timeout, max_concurrent)?;
        if let Some(first) = seen.get(entry.url_path()) {
            return Err(RouteError::Duplicate {
                url_path: entry.url_path,
                first: first.clone(),
                second: entry.program,
            });
        }
        seen.insert(entry.url_path.clone(), entry.program.clone());
        entries.push(entry);
    }
    Ok(entries)
}

#[derive(Clone)]
struct Bridge {
    route: Arc<RouteEntry>,
    host: Arc<HostEnvironment>,
}

/// One route per program, accepting any method.
pub fn routes(entries: Vec<RouteEntry>, host: HostEnvironment) -> Router {
    let host = Arc::new(host);
    entries.into_iter().fold(Router::new(), |router, entry| {
        log::info!(program:debug = entry.program(); "handle {}", entry.url_path());
        let url_path = entry.url_path.clone();
        let bridge = Bridge {
            route: Arc::new(entry),
            host: Arc::clone(&host),
        };
        router.route(&url_path, any(run_program).with_state(bridge))
    })
}

async fn run_program(State(bridge): State<Bridge>, request: Request) -> Response {
    let id = fastrand::u64(..);
    log::info!(id, method = request.method().as_str(); "received {}", request.uri());

    let (invocation, media_type) = match translate(&bridge.route, request).await {
        Ok(Translation::Invoke {
            request,
            media_type,
        }) => (request, media_type),
        Ok(Translation::Json) => {
            log::debug!(id; "json request, program not invoked");
            return [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )]
            .into_response();
        }
        Err(e) => {
            log::warn!(id; "rejected request: {e}");
            return e.into_response();
        }
    };
    log::debug!(id; "variables: {:?}", invocation.variables());
    log::debug!(id; "stdin: {} bytes", invocation.stdin().len());

    let _permit = match &bridge.route.permits {
        // The semaphore is never closed.
        Some(permits) => permits.acquire().await.ok(),
        None => None,
    };

    let result = process(id, &bridge.host, invocation).await;
    log::info!(id, outcome:display = result.outcome(); "responding as {media_type}");

    let content_type = HeaderValue::from_str(media_type.as_ref())
        .unwrap_or(HeaderValue::from_static("text/plain"));
    // Failed programs are answered with 200 as well, the output tells what went wrong.
    ([(header::CONTENT_TYPE, content_type)], result.into_output()).into_response()
}
