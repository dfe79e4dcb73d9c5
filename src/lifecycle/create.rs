use serde::Deserialize;

use super::{Lifecycle, LifecycleError};
use crate::config::Config;
use crate::storage::models::{File, Upload, MAX_FILE_NAME_LENGTH};

/// Parameters of a new upload, as sent by the client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewUpload {
    /// Seconds. 0 selects the server default, -1 asks for no expiration.
    pub ttl: i64,
    pub one_shot: bool,
    pub stream: bool,
    pub removable: bool,
    pub login: Option<String>,
    pub password: Option<String>,
    pub otp: Option<String>,
    pub comments: Option<String>,
    /// Files declared up front, uploaded later under their assigned ids.
    pub files: Vec<DeclaredFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeclaredFile {
    pub name: String,
}

fn check_features(config: &Config, params: &NewUpload) -> Result<(), LifecycleError> {
    let features = &config.features;
    let disabled = if params.one_shot && !features.one_shot {
        Some("one shot uploads are not enabled")
    } else if params.stream && !features.stream_mode {
        Some("stream mode is not enabled")
    } else if params.removable && !features.removable {
        Some("removable uploads are not enabled")
    } else if params.password.is_some() && !features.protected_by_password {
        Some("password protection is not enabled")
    } else if params.otp.is_some() {
        Some("OTP protection is not enabled")
    } else {
        None
    };

    match disabled {
        Some(reason) => Err(LifecycleError::InvalidParameter(reason.to_string())),
        None => Ok(()),
    }
}

/// Effective TTL for a requested one.
pub(crate) fn resolve_ttl(config: &Config, requested: i64) -> Result<i64, LifecycleError> {
    let ttl = if requested == 0 {
        config.limits.default_ttl
    } else {
        requested
    };
    let max_ttl = config.limits.max_ttl;

    if ttl == -1 && !config.allows_infinite_ttl() {
        return Err(LifecycleError::InvalidParameter(format!(
            "cannot set infinite TTL (maximum allowed is {max_ttl})"
        )));
    }
    if ttl < -1 {
        return Err(LifecycleError::InvalidParameter(format!("invalid TTL {ttl}")));
    }
    if max_ttl > 0 && ttl > max_ttl {
        return Err(LifecycleError::InvalidParameter(format!(
            "invalid TTL {ttl} (maximum allowed is {max_ttl})"
        )));
    }
    let representable = chrono::Duration::try_seconds(ttl)
        .and_then(|delta| chrono::Utc::now().checked_add_signed(delta))
        .is_some();
    if ttl > 0 && !representable {
        return Err(LifecycleError::InvalidParameter(format!("invalid TTL {ttl}")));
    }
    Ok(ttl)
}

pub(crate) fn check_file_name(name: &str) -> Result<(), LifecycleError> {
    if name.is_empty() {
        return Err(LifecycleError::MissingParameter("file name".to_string()));
    }
    if name.chars().count() > MAX_FILE_NAME_LENGTH {
        return Err(LifecycleError::InvalidParameter(format!(
            "file name is too long, maximum is {MAX_FILE_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

impl Lifecycle {
    /// Create an upload and its declared files.
    ///
    /// The returned upload still carries its token: it must be shown to the
    /// creator once and never again.
    pub fn create_upload(
        &self,
        params: NewUpload,
        remote_ip: Option<String>,
    ) -> Result<(Upload, Vec<File>), LifecycleError> {
        let config = &self.state.config;
        check_features(config, &params)?;
        let ttl = resolve_ttl(config, params.ttl)?;

        let max_files = config.limits.max_file_per_upload;
        if params.files.len() > max_files {
            return Err(LifecycleError::QuotaExceeded(format!(
                "too many files, maximum is {max_files}"
            )));
        }

        let mut upload = Upload::new(ttl)
            .map_err(|_| LifecycleError::Internal("unable to generate upload id".to_string()))?;
        upload.stream = params.stream;
        upload.one_shot = params.one_shot || params.stream;
        upload.removable = params.removable;
        upload.comments = params.comments.filter(|c| !c.is_empty());
        upload.remote_ip = remote_ip;
        if let Some(password) = params.password.as_deref() {
            upload.set_password(params.login.as_deref(), password);
        }

        let files = params
            .files
            .iter()
            .map(|declared| {
                check_file_name(&declared.name)?;
                Ok(File::new(&upload.id, declared.name.clone()))
            })
            .collect::<Result<Vec<_>, LifecycleError>>()?;

        self.state.metadata.create_upload(&upload, &files)?;
        tracing::info!(
            upload_id = %upload.id,
            ttl,
            one_shot = upload.one_shot,
            stream = upload.stream,
            files = files.len(),
            "Upload created"
        );

        Ok((upload, files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_ttl_uses_default() {
        let config = Config::default();
        assert_eq!(resolve_ttl(&config, 0).unwrap(), config.limits.default_ttl);
        assert_eq!(resolve_ttl(&config, 60).unwrap(), 60);
    }

    #[test]
    fn test_infinite_ttl_needs_permission() {
        let mut config = Config::default();
        assert!(matches!(
            resolve_ttl(&config, -1),
            Err(LifecycleError::InvalidParameter(_))
        ));

        config.limits.max_ttl = -1;
        assert_eq!(resolve_ttl(&config, -1).unwrap(), -1);
    }

    #[test]
    fn test_ttl_bounds() {
        let mut config = Config::default();
        assert!(resolve_ttl(&config, -2).is_err());

        config.limits.max_ttl = 3600;
        assert!(resolve_ttl(&config, 3601).is_err());
        assert_eq!(resolve_ttl(&config, 3600).unwrap(), 3600);
    }

    #[test]
    fn test_huge_ttl_is_rejected() {
        let config = Config::default();
        assert!(matches!(
            resolve_ttl(&config, i64::MAX),
            Err(LifecycleError::InvalidParameter(_))
        ));
        assert!(matches!(
            resolve_ttl(&config, 1_000_000_000_000_000_000),
            Err(LifecycleError::InvalidParameter(_))
        ));
        assert!(resolve_ttl(&config, 100 * 365 * 24 * 3600).is_ok());
    }

    #[test]
    fn test_file_name_rules() {
        assert!(check_file_name("a.txt").is_ok());
        assert!(matches!(
            check_file_name(""),
            Err(LifecycleError::MissingParameter(_))
        ));
        let long = "é".repeat(MAX_FILE_NAME_LENGTH);
        assert!(check_file_name(&long).is_ok());
        assert!(check_file_name(&format!("{long}x")).is_err());
    }

    #[test]
    fn test_disabled_features_rejected() {
        let mut config = Config::default();
        config.features.stream_mode = false;
        let params = NewUpload {
            stream: true,
            ..Default::default()
        };
        assert!(check_features(&config, &params).is_err());

        let params = NewUpload {
            otp: Some("123456".to_string()),
            ..Default::default()
        };
        assert!(check_features(&Config::default(), &params).is_err());
    }
}
