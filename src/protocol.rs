use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::Path;

use mime::Mime;

/// Requests with a larger body are rejected before any program is started.
pub const FORM_SIZE_LIMIT: usize = 5_000_000;

/// Variable holding the raw `Accept` header.
pub const ACCEPT: &str = "ACCEPT";
/// Variable holding the raw `Host` header.
pub const HOST: &str = "HOST";
/// Variable holding the raw `User-Agent` header.
pub const USER_AGENT: &str = "USER_AGENT";

/// Decodes an `application/x-www-form-urlencoded` payload (or a query string).
///
/// Decoding is lenient: invalid percent escapes are kept as-is and invalid UTF-8 is replaced.
///
/// ```
/// let fields = procbridge::protocol::parse_urlencoded(b"name=a&name=b&city=New+York");
/// assert_eq!(fields[2], ("city".to_string(), "New York".to_string()));
/// ```
#[must_use]
pub fn parse_urlencoded(input: &[u8]) -> Vec<(String, String)> {
    // Decoding into string pairs cannot fail, every pair is representable.
    serde_urlencoded::from_bytes(input).unwrap_or_default()
}

/// Folds submitted form fields into environment entries.
///
/// Fields are grouped by their submitted name, groups keep the order of first appearance.
/// The name is upper-cased and all values of a group are joined by a single space.
/// Names which only collide after upper-casing stay separate entries,
/// the later one wins once the environment is assembled.
///
/// ```
/// use procbridge::protocol::form_entries;
///
/// let entries = form_entries([("name", "a"), ("city", "Bern"), ("name", "b")]);
/// assert_eq!(
///     entries,
///     [("NAME".to_string(), "a b".to_string()), ("CITY".to_string(), "Bern".to_string())]
/// );
/// ```
pub fn form_entries<I, K, V>(fields: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for (key, value) in fields {
        let key = key.into();
        match positions.get(&key) {
            Some(&index) => groups[index].1.push(value.into()),
            None => {
                positions.insert(key.clone(), groups.len());
                groups.push((key, vec![value.into()]));
            }
        }
    }
    groups
        .into_iter()
        .map(|(key, values)| (key.to_uppercase(), values.join(" ")))
        .collect()
}

/// The entries every program receives, regardless of the submitted form.
///
/// Missing headers are passed as empty strings.
#[must_use]
pub fn header_entries(
    accept: Option<&str>,
    host: Option<&str>,
    user_agent: Option<&str>,
) -> [(String, String); 3] {
    [
        (ACCEPT.to_string(), accept.unwrap_or_default().to_string()),
        (HOST.to_string(), host.unwrap_or_default().to_string()),
        (USER_AGENT.to_string(), user_agent.unwrap_or_default().to_string()),
    ]
}

/// Snapshot of the server's environment, taken once at startup.
///
/// Programs never see later changes to the server's environment,
/// and building a child environment never touches the snapshot.
#[derive(Debug, Clone, Default)]
pub struct HostEnvironment {
    vars: BTreeMap<OsString, OsString>,
}

impl HostEnvironment {
    /// Captures the environment of the current process.
    #[must_use]
    pub fn capture() -> Self {
        std::env::vars_os().collect()
    }

    /// Number of inherited variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Builds the complete environment of one child process.
    ///
    /// Starts from the snapshot and applies `entries` in order, so request entries
    /// override inherited variables and later entries override earlier ones.
    ///
    /// ```
    /// use procbridge::protocol::HostEnvironment;
    /// use std::ffi::OsString;
    ///
    /// let host: HostEnvironment = [("HOME", "/root"), ("NAME", "server")].into_iter().collect();
    /// let env = host.layered(&[("NAME".to_string(), "client".to_string())]);
    /// assert!(env.contains(&(OsString::from("NAME"), OsString::from("client"))));
    /// assert!(env.contains(&(OsString::from("HOME"), OsString::from("/root"))));
    /// ```
    #[must_use]
    pub fn layered(&self, entries: &[(String, String)]) -> Vec<(OsString, OsString)> {
        let mut vars = self.vars.clone();
        for (key, value) in entries {
            vars.insert(OsString::from(key), OsString::from(value));
        }
        vars.into_iter().collect()
    }
}

impl<K: Into<OsString>, V: Into<OsString>> FromIterator<(K, V)> for HostEnvironment {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Chooses the `Content-Type` of a response from the request's `Accept` header.
///
/// The header is parsed as one media type, parameters are dropped.
/// If that fails, or the client accepts anything (`*/*`), the response is `text/plain`.
///
/// ```
/// use procbridge::protocol::response_media_type;
///
/// assert_eq!(response_media_type(Some("application/xml")), "application/xml");
/// assert_eq!(response_media_type(Some("Text/HTML; charset=utf-8")), "text/html");
/// assert_eq!(response_media_type(Some("*/*")), "text/plain");
/// assert_eq!(response_media_type(None), "text/plain");
/// ```
#[must_use]
pub fn response_media_type(accept: Option<&str>) -> Mime {
    accept
        .and_then(|accept| accept.trim().parse::<Mime>().ok())
        .filter(|media| !(media.type_() == mime::STAR && media.subtype() == mime::STAR))
        .and_then(|media| media.essence_str().parse().ok())
        .unwrap_or(mime::TEXT_PLAIN)
}

/// Whether a request is answered with an empty JSON response instead of running the program.
///
/// Only the exact header value `application/json` qualifies.
#[must_use]
pub fn is_json_request(content_type: Option<&str>) -> bool {
    content_type == Some("application/json")
}

/// The url path a program is served under: its file name without the last extension.
///
/// ```
/// use std::path::Path;
///
/// let path = procbridge::protocol::url_path(Path::new("/opt/scripts/weather.sh"));
/// assert_eq!(path.as_deref(), Some("/weather"));
/// ```
#[must_use]
pub fn url_path(program: &Path) -> Option<String> {
    let stem = program.file_stem()?.to_str()?;
    Some(format!("/{stem}"))
}
