//! CLI commands that talk to a running server.

use serde::Deserialize;

use crate::config::Config;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddUserReply {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    setup_link: String,
}

/// `--add-user <username>`: invite through the running admin listener so
/// the live hub learns about the user, then print the setup link.
pub async fn add_user(username: &str, config: &Config) -> Result<(), String> {
    let url = format!("http://{}/admin/users", config.admin_addr);
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .basic_auth(&config.admin_user, Some(&config.admin_password))
        .json(&serde_json::json!({ "username": username }))
        .send()
        .await
        .map_err(|e| format!("failed to call admin API: {e}. Is the server running?"))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| format!("failed to read response: {e}"))?;

    if !status.is_success() {
        return Err(format!("failed to add user (status {status}): {body}"));
    }

    let reply: AddUserReply =
        serde_json::from_str(&body).map_err(|e| format!("failed to decode response: {e}"))?;
    if !reply.success {
        return Err(format!("failed to add user: {}", reply.message));
    }

    println!();
    println!("User created successfully!");
    println!("Username:   {}", reply.username);
    println!("Setup link: {}", reply.setup_link);
    println!();
    println!("Share this link with the user to complete registration.");
    Ok(())
}
