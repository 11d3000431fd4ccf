use ganymede::builder::Builder;
use ganymede::server::Server;

#[tokio::main]
async fn main() {
    // Build a platform, connect to the configured storage engine and enable all features...
    let platform = match Builder::new().enable_all().build().await {
        Ok(platform) => platform,
        Err(error) => {
            log::error!("Cannot start GANYMEDE: {:#}", error);
            std::process::exit(1);
        }
    };

    platform.require::<Server>().event_loop().await;
}
