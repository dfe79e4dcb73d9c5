use crate::storage::models::Upload;

/// Rights of the caller over one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// The caller presented the upload token.
    UploadAdmin,
    Anonymous,
}

impl AccessDecision {
    /// Decide from the `X-UploadToken` header value, if any.
    pub fn for_upload(upload: &Upload, upload_token: Option<&str>) -> Self {
        match upload_token {
            Some(token) if !upload.upload_token.is_empty() && same(token, &upload.upload_token) => {
                AccessDecision::UploadAdmin
            }
            _ => AccessDecision::Anonymous,
        }
    }

    pub fn is_upload_admin(self) -> bool {
        self == AccessDecision::UploadAdmin
    }

    pub fn can_add_files(self) -> bool {
        self.is_upload_admin()
    }

    pub fn can_remove(self, upload: &Upload) -> bool {
        self.is_upload_admin() || upload.removable
    }

    /// Password protection applies to everybody but the upload admin.
    pub fn needs_credentials(self, upload: &Upload) -> bool {
        upload.protected_by_password && !self.is_upload_admin()
    }
}

fn same(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}
