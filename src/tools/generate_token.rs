use anyhow::Result;
use autonet::{
    api::auth::{AuthHandler, DEFAULT_TOKEN_TTL_SECS},
    resources::identity::Identity,
    utils::tracing::init_tracing,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = std::env::args().collect::<Vec<String>>();

    if args.len() < 5 || args.len() > 7 {
        error!(
            "Usage: generate-token-tool <jwt-secret> <user-id> <external-id> <display-name> [admin] [email]"
        );
        return Ok(());
    }

    let jwt_secret = args[1].clone();
    let identity = Identity {
        user_id: args[2].clone(),
        external_id: args[3].clone(),
        display_name: args[4].clone(),
        is_admin: args.get(5).is_some_and(|a| a == "admin" || a == "true"),
        email: args.get(6).cloned(),
    };

    let token = AuthHandler::new(jwt_secret).generate_token(&identity, DEFAULT_TOKEN_TTL_SECS)?;
    info!("token = {}", token);

    Ok(())
}
