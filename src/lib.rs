//! This crate describes how an HTTP request is handed to an external program and how
//! the program's output travels back. The canonical server lives in the same repository.
//!
//! Every registered program becomes one route, named after its file name without the
//! extension: `/usr/local/bin/weather.sh` is served as `/weather`.
//!
//! ## Protocol
//! For every request the program is started once, without arguments.
//! * The request body is written verbatim to the program's standard input.
//! * Every form field (query string, urlencoded or multipart body) becomes an environment
//!   variable with an upper-cased name. Repeated fields are joined by a single space,
//!   so `name=a&name=b` arrives as `NAME=a b`.
//! * `ACCEPT`, `HOST` and `USER_AGENT` always carry the respective request headers,
//!   empty if the client did not send them.
//! * The server's own environment is inherited, request variables take precedence.
//!
//! Everything the program writes to stdout and stderr is returned as the response body,
//! independent of its exit code. See [`protocol`] for the details.
//!
//! ## Content type
//! The server does not know what a program prints, the client does.
//! The response therefore carries the media type requested in `Accept`,
//! or `text/plain` if none (or `*/*`) was requested. See [`protocol::response_media_type`].
//!
//! ## Long running programs
//! Each invocation is bounded by a timeout, after which the program is killed
//! and whatever it printed so far is returned.
//!
//! ## Security
//! The programs are not sandboxed in any way, every client can feed them arbitrary
//! environment variables. Make sure the server is only reachable from trusted hosts.

pub mod invocation;
pub mod protocol;
