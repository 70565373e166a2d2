#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    livepoll::start_server().await;
}
