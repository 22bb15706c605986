// dropminer-server/src/login.rs

use async_trait::async_trait;
use tracing::info;

use dropminer_common::models::LoginPrompt;
use dropminer_core::auth::LoginHandler;
use dropminer_core::Error;

/// Prints the device code on stdout so it is visible whatever the log filter.
pub struct ConsoleLoginHandler;

#[async_trait]
impl LoginHandler for ConsoleLoginHandler {
    async fn show_prompt(&self, prompt: &LoginPrompt) -> Result<(), Error> {
        println!();
        println!("  To sign in, open {} and enter the code:", prompt.verification_uri);
        println!();
        println!("      {}", prompt.user_code);
        println!();
        println!("  The code expires in {} minutes.", prompt.expires_in / 60);
        println!();
        info!("[Login] waiting for device code {} to be activated", prompt.user_code);
        Ok(())
    }
}
