use anyhow::Result;
use autonet::utils::tracing::init_tracing;
use base64::{Engine, prelude::BASE64_STANDARD};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let random: [u8; 32] = rand::random();
    let jwt_secret = BASE64_STANDARD.encode(random);

    info!("jwt_secret = {}", jwt_secret);

    Ok(())
}
