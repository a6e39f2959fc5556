//! Interactive confirmation coordination.
//!
//! Network stages must be able to suspend on a user decision without tying up
//! the async I/O threads. Implementations run their blocking prompt on the
//! blocking pool and resolve exactly once per request.

use async_trait::async_trait;
use log::warn;

/// User decisions the workflow can block on.
#[async_trait]
pub trait Interactor: Send + Sync {
    /// Ask for a yes/no confirmation. `false` cancels the current run.
    async fn confirm(&self, title: &str, message: &str) -> bool;

    /// Ask for the 6-digit verification code sent to the user's devices.
    /// `None` means the user declined, which fails authentication with a
    /// dedicated cancellation condition.
    async fn request_verification_code(&self) -> Option<String>;
}

/// Terminal prompts via `inquire`, executed off the async runtime.
pub struct CliInteractor;

#[async_trait]
impl Interactor for CliInteractor {
    async fn confirm(&self, title: &str, message: &str) -> bool {
        let title = title.to_string();
        let message = message.to_string();

        let answer = tokio::task::spawn_blocking(move || {
            println!("\n{title}");
            inquire::Confirm::new(&message).with_default(false).prompt()
        })
        .await;

        match answer {
            Ok(Ok(confirmed)) => confirmed,
            Ok(Err(error)) => {
                warn!("confirmation prompt failed: {error}");
                false
            }
            Err(error) => {
                warn!("confirmation prompt panicked: {error}");
                false
            }
        }
    }

    async fn request_verification_code(&self) -> Option<String> {
        let answer = tokio::task::spawn_blocking(|| {
            inquire::Text::new("Enter the 6-digit verification code sent to your devices:")
                .with_validator(|input: &str| {
                    let trimmed = input.trim();
                    if trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_digit()) {
                        Ok(inquire::validator::Validation::Valid)
                    } else {
                        Ok(inquire::validator::Validation::Invalid(
                            "The code is 6 digits.".into(),
                        ))
                    }
                })
                .prompt()
        })
        .await;

        match answer {
            Ok(Ok(code)) => Some(code.trim().to_string()),
            _ => None,
        }
    }
}
