use crate::error::ServerError;
use std::fmt;

/// A validated project identifier: `[A-Za-z0-9_-]+`.
///
/// The host app is expected to reject any other shape before a request
/// ever reaches this subsystem (spec §6), but we validate again at the
/// boundary so a `ProjectId` can be trusted to be safe to interpolate
/// into file names, log messages, and spawn arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ServerError> {
        let raw = raw.into();
        validate_project_id(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validates that `raw` matches `[A-Za-z0-9_-]+` (spec §3).
pub fn validate_project_id(raw: &str) -> Result<(), ServerError> {
    if !raw.is_empty()
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        Ok(())
    } else {
        Err(ServerError::RootInvalid(format!(
            "project id '{raw}' must match [A-Za-z0-9_-]+"
        )))
    }
}
