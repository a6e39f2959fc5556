//! Error taxonomy for the installation workflow.

use thiserror::Error;

/// Top-level failures of an installation run.
///
/// `Cancelled` is a silent termination: the outermost caller filters it (and
/// the requires-two-factor condition from the portal) before surfacing
/// anything to the user.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("The operation was cancelled.")]
    Cancelled,

    #[error("You are not a member of any developer teams.")]
    NoTeam,

    #[error("The developer certificate's private key could not be found.")]
    MissingPrivateKey,

    #[error("The developer certificate could not be found.")]
    MissingCertificate,

    /// A pipeline stage failed. `title` is the stage-specific display title
    /// (e.g. "Failed to Authenticate"). The cause keeps its own chain so the
    /// silent-failure filter can still see through the wrapper.
    #[error("{title}")]
    Stage {
        title: &'static str,
        cause: anyhow::Error,
    },
}

impl InstallError {
    pub fn stage(title: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        InstallError::Stage {
            title,
            cause: cause.into(),
        }
    }
}

/// Failures while acquiring machine-attestation (anisette) data.
#[derive(Debug, Error)]
pub enum AnisetteError {
    /// The primary source's channel is absent or interrupted. Triggers the
    /// plugin fallback; surfaced only if the fallback also fails to start.
    #[error("anisette service unavailable: {0}")]
    Unavailable(String),

    #[error("No plugin responded to the anisette data request.")]
    PluginNotFound,

    #[error("The received anisette data is invalid.")]
    InvalidAnisetteData,
}

/// Failures while fetching the device runtime-support image.
#[derive(Debug, Error)]
pub enum DeveloperDiskError {
    #[error("The URL to download the Developer disk image could not be determined.")]
    UnknownDownloadUrl,

    #[error("The device's operating system does not support installing Developer disk images.")]
    UnsupportedOperatingSystem,

    #[error("DeveloperDiskImage.dmg and its signature could not be found in the downloaded archive.")]
    DownloadedImageNotFound,

    #[error("failed to download Developer disk image")]
    Http(#[from] reqwest::Error),

    #[error("failed to read Developer disk feed")]
    Feed(#[from] serde_json::Error),

    #[error("failed to unpack Developer disk archive")]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Returns true when `error` (or anything in its chain, including the causes
/// held inside stage wrappers) represents a user cancellation that must not
/// be surfaced as an error dialog.
pub fn is_silent_failure(error: &anyhow::Error) -> bool {
    error.chain().any(is_silent_cause)
}

fn is_silent_cause(cause: &(dyn std::error::Error + 'static)) -> bool {
    use crate::portal::PortalError;

    if let Some(install) = cause.downcast_ref::<InstallError>() {
        return match install {
            InstallError::Cancelled => true,
            InstallError::Stage { cause, .. } => is_silent_failure(cause),
            _ => false,
        };
    }

    matches!(
        cause.downcast_ref::<PortalError>(),
        Some(PortalError::RequiresTwoFactor)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_silent_even_when_wrapped_in_a_stage() {
        let err = InstallError::stage("Failed to Fetch Certificate", InstallError::Cancelled);
        let err = anyhow::Error::from(err).context("Could not install app to device.");
        assert!(is_silent_failure(&err));
    }

    #[test]
    fn ordinary_stage_failures_are_not_silent() {
        let err: anyhow::Error =
            InstallError::stage("Failed to Fetch Team", InstallError::NoTeam).into();
        assert!(!is_silent_failure(&err));
    }

    #[test]
    fn two_factor_refusal_is_silent() {
        let err = anyhow::Error::from(crate::portal::PortalError::RequiresTwoFactor)
            .context("Failed to Authenticate");
        assert!(is_silent_failure(&err));
    }

    #[test]
    fn stage_wrapping_a_contextualized_cancellation_stays_silent() {
        // The shape the pipeline produces: an anyhow chain with context,
        // held inside a stage wrapper, wrapped again in anyhow.
        let cause = anyhow::Error::from(InstallError::Cancelled)
            .context("certificate resolution aborted");
        let err: anyhow::Error = InstallError::stage("Failed to Fetch Certificate", cause).into();
        assert!(is_silent_failure(&err));
    }

    #[test]
    fn stage_wrapping_a_two_factor_refusal_stays_silent() {
        let cause = anyhow::Error::from(crate::portal::PortalError::RequiresTwoFactor);
        let err: anyhow::Error = InstallError::stage("Failed to Authenticate", cause).into();
        assert!(is_silent_failure(&err));
    }
}
