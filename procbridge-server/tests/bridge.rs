//! Tests which start the binary with a few shell scripts and call their routes.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use httpc_test::Client;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Child;

/// Prints the variables set by the bridge.
const ENV_SCRIPT: &str = r#"
echo "NAME=[$NAME]"
echo "CITY=[$CITY]"
echo "GREETING=[$GREETING]"
echo "UPLOAD=[${UPLOAD-unset}]"
echo "ACCEPT=[$ACCEPT]"
echo "HOST=[$HOST]"
echo "USER_AGENT=[$USER_AGENT]"
"#;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("Couldn't write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Couldn't make script executable");
    path
}

/// Starts the binary serving `programs` and waits until it accepts connections.
async fn spawn_server(programs: &[PathBuf], timeout: u64) -> anyhow::Result<(Child, u16)> {
    spawn_server_with(programs, timeout, &[]).await
}

async fn spawn_server_with(
    programs: &[PathBuf],
    timeout: u64,
    options: &[&str],
) -> anyhow::Result<(Child, u16)> {
    // IANA recommended port range.
    let port = fastrand::u16(49152..65535);
    let child = tokio::process::Command::new(env!("CARGO_BIN_EXE_procbridge-server"))
        .kill_on_drop(true)
        .args(["--host", "127.0.0.1"])
        .args(["--port", &port.to_string()])
        .args(["--timeout", &timeout.to_string()])
        .args(options)
        .args(programs)
        .spawn()
        .expect("Couldn't spawn server");

    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok((child, port));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("server did not start listening on port {port}")
}

fn client(port: u16) -> anyhow::Result<Client> {
    Ok(httpc_test::new_client(format!("http://127.0.0.1:{port}"))?)
}

#[tokio::test(flavor = "current_thread")]
async fn form_fields_become_environment() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = script(dir.path(), "env.sh", ENV_SCRIPT);
    let (mut child, port) = spawn_server(&[env], 5).await?;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/env?city=Bern"))
        .form(&[("name", "a"), ("name", "b")])
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body = response.text().await?;
    assert!(body.contains("NAME=[a b]\n"), "{body}");
    assert!(body.contains("CITY=[Bern]\n"), "{body}");
    assert!(body.contains(&format!("HOST=[127.0.0.1:{port}]\n")), "{body}");

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn query_fields_become_environment() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = script(dir.path(), "env.sh", ENV_SCRIPT);
    let (mut child, port) = spawn_server(&[env], 5).await?;
    let hc = client(port)?;

    let response = hc.do_get("/env?name=x&name=y").await?;
    response.print().await?;
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.text_body()?.contains("NAME=[x y]\n"));

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn header_variables_are_always_set() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = script(dir.path(), "env.sh", ENV_SCRIPT);
    let (mut child, port) = spawn_server(&[env], 5).await?;

    // Neither Accept nor User-Agent, which every http client library adds.
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream
        .write_all(b"GET /env HTTP/1.1\r\nHost: bridge.test\r\nConnection: close\r\n\r\n")
        .await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("content-type: text/plain\r\n"), "{response}");
    assert!(response.contains("ACCEPT=[]\n"), "{response}");
    assert!(response.contains("HOST=[bridge.test]\n"), "{response}");
    assert!(response.contains("USER_AGENT=[]\n"), "{response}");

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn multipart_files_are_not_variables() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = script(dir.path(), "env.sh", ENV_SCRIPT);
    let (mut child, port) = spawn_server(&[env], 5).await?;

    let form = reqwest::multipart::Form::new()
        .text("greeting", "hello")
        .part(
            "upload",
            reqwest::multipart::Part::text("file content").file_name("notes.txt"),
        );
    let body = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/env"))
        .multipart(form)
        .send()
        .await?
        .text()
        .await?;
    assert!(body.contains("GREETING=[hello]\n"), "{body}");
    assert!(body.contains("UPLOAD=[unset]\n"), "{body}");

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn body_is_piped_to_stdin() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let cat = script(dir.path(), "cat.sh", "cat");
    let (mut child, port) = spawn_server(&[cat], 5).await?;
    let http = reqwest::Client::new();

    let body = http
        .post(format!("http://127.0.0.1:{port}/cat"))
        .body("raw\nbytes")
        .send()
        .await?
        .text()
        .await?;
    assert_eq!(body, "raw\nbytes");

    // Form bodies are parsed and still reach stdin unchanged.
    let body = http
        .post(format!("http://127.0.0.1:{port}/cat"))
        .form(&[("name", "a b")])
        .send()
        .await?
        .text()
        .await?;
    assert_eq!(body, "name=a+b");

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn timeout_kills_program() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let slow = script(dir.path(), "slow.sh", "echo a\nsleep 5\necho b");
    let (mut child, port) = spawn_server(&[slow], 1).await?;

    let start = Instant::now();
    let response = reqwest::get(format!("http://127.0.0.1:{port}/slow")).await?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await?, "a\n");
    assert!(start.elapsed() < Duration::from_secs(4));

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn failing_program_is_relayed() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let failing = script(dir.path(), "failing.sh", "echo out\necho err >&2\nexit 3");
    let (mut child, port) = spawn_server(&[failing], 5).await?;

    let response = reqwest::get(format!("http://127.0.0.1:{port}/failing")).await?;
    assert_eq!(response.status(), 200);
    let body = response.text().await?;
    assert_eq!(body.len(), "out\nerr\n".len());
    assert!(body.contains("out\n"));
    assert!(body.contains("err\n"));

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn content_type_follows_accept() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let xml = script(dir.path(), "xml.sh", "echo '<ok/>'");
    let (mut child, port) = spawn_server(&[xml], 5).await?;
    let http = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/xml");

    for (accept, expected) in [
        ("application/xml", "application/xml"),
        ("application/xml; charset=utf-8", "application/xml"),
        ("*/*", "text/plain"),
        ("text/html,application/xhtml+xml", "text/plain"),
    ] {
        let response = http.get(&url).header("Accept", accept).send().await?;
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], expected, "Accept: {accept}");
        assert_eq!(response.text().await?, "<ok/>\n");
    }

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn json_requests_skip_the_program() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let marker = dir.path().join("spawned");
    let touch = script(
        dir.path(),
        "touch.sh",
        &format!("touch '{}'\necho ran", marker.display()),
    );
    let (mut child, port) = spawn_server(&[touch], 5).await?;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/touch"))
        .header("Content-Type", "application/json")
        .body(r#"{"name": "a"}"#)
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.text().await?, "");
    assert!(!marker.exists());

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn routes_run_independently() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let slow = script(dir.path(), "slow.sh", "sleep 3\necho slow");
    let fast = script(dir.path(), "fast.sh", "echo fast");
    let (mut child, port) = spawn_server(&[slow, fast], 10).await?;

    let slow = tokio::spawn(reqwest::get(format!("http://127.0.0.1:{port}/slow")));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let start = Instant::now();
    let fast = reqwest::get(format!("http://127.0.0.1:{port}/fast")).await?;
    assert_eq!(fast.text().await?, "fast\n");
    assert!(start.elapsed() < Duration::from_secs(2));

    assert_eq!(slow.await??.text().await?, "slow\n");

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn concurrency_limit_queues_requests() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let slow = script(dir.path(), "slow.sh", "sleep 1\necho slow");
    let (mut child, port) = spawn_server_with(&[slow], 5, &["--max-concurrent", "1"]).await?;

    let start = Instant::now();
    let first = tokio::spawn(reqwest::get(format!("http://127.0.0.1:{port}/slow")));
    let second = tokio::spawn(reqwest::get(format!("http://127.0.0.1:{port}/slow")));
    assert_eq!(first.await??.text().await?, "slow\n");
    assert_eq!(second.await??.text().await?, "slow\n");

    // The second invocation only starts once the first one is done.
    assert!(start.elapsed() >= Duration::from_millis(1900), "{:?}", start.elapsed());

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn oversized_body_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let marker = dir.path().join("spawned");
    let touch = script(dir.path(), "touch.sh", &format!("touch '{}'", marker.display()));
    let (mut child, port) = spawn_server(&[touch], 5).await?;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/touch"))
        .body(vec![b'x'; 5_000_001])
        .send()
        .await?;
    assert_eq!(response.status(), 413);
    assert!(!marker.exists());

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_route_is_not_found() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = script(dir.path(), "env.sh", ENV_SCRIPT);
    let (mut child, port) = spawn_server(&[env], 5).await?;
    let hc = client(port)?;

    let response = hc.do_get("/other").await?;
    assert_eq!(response.status().as_u16(), 404);

    child.kill().await.expect("Couldn't kill server");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn missing_program_aborts_startup() -> anyhow::Result<()> {
    let dir = TempDir::new()?;

    let status = tokio::process::Command::new(env!("CARGO_BIN_EXE_procbridge-server"))
        .kill_on_drop(true)
        .args(["--port", &fastrand::u16(49152..65535).to_string()])
        .arg(dir.path().join("missing.sh"))
        .status();
    let status = tokio::time::timeout(Duration::from_secs(10), status).await??;

    assert!(!status.success());
    Ok(())
}
