//! Terminal prompts for credentials and confirmations.

use dialoguer::{Confirm, Input, Password};

use crate::auth::{CredentialProvider, Credentials};
use crate::error::{Result, TransferError};
use crate::session::Token;

/// Reads credentials interactively from the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    pub fn new() -> Self {
        Self
    }
}

fn prompt_error(e: dialoguer::Error) -> TransferError {
    TransferError::Prompt(e.to_string())
}

impl CredentialProvider for TerminalPrompt {
    fn credentials(&self) -> Result<Credentials> {
        let username: String = Input::new()
            .with_prompt("username")
            .interact_text()
            .map_err(prompt_error)?;
        let password = Password::new()
            .with_prompt("password")
            .interact()
            .map_err(prompt_error)?;
        let otp: String = Input::new()
            .with_prompt("one time code")
            .interact_text()
            .map_err(prompt_error)?;

        Ok(Credentials {
            username: username.trim().to_string(),
            password,
            otp: otp.trim().to_string(),
        })
    }

    fn confirm_refresh(&self, token: &Token) -> Result<bool> {
        Confirm::new()
            .with_prompt(format!(
                "Your session expires at {}. Do you want to refresh your login session?",
                token.expires_at.format("%H:%M:%S")
            ))
            .default(true)
            .interact()
            .map_err(prompt_error)
    }
}
