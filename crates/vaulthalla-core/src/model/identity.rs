//! Users, groups, and S3 API keys.

/// A daemon user. `uid` binds the row to the POSIX uid seen on FUSE calls.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub uid: u32,
    /// Admin role granting daemon-wide permissions, if any.
    pub admin_role_id: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub gid: u32,
    pub created_at: i64,
}

/// Credentials for an S3-compatible endpoint.
///
/// The secret is encrypted with the daemon master key at rest; the decrypted
/// form only ever lives in this in-memory struct.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub access_key: String,
    pub secret_access_key: String,
    pub region: String,
    pub endpoint: String,
    pub provider: String,
}

impl ApiKey {
    /// Host portion of the endpoint, as signed into SigV4 headers.
    pub fn host(&self) -> &str {
        let stripped = self
            .endpoint
            .strip_prefix("https://")
            .or_else(|| self.endpoint.strip_prefix("http://"))
            .unwrap_or(&self.endpoint);
        stripped.trim_end_matches('/')
    }
}
