//! Calls a locally running server, started with `cargo run -p procbridge-server -- demos/greet.sh`.

const URL: &str = "http://localhost:8000";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let hc = httpc_test::new_client(URL)?;

    hc.do_get("/greet").await?.print().await?;

    let response = hc.do_get("/greet?name=dev&name=team").await?;
    response.print().await?;
    println!("Greeting: {}", response.text_body()?.trim());

    Ok(())
}
