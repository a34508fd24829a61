use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable key for principal-scoped data (carts, drafts, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PrincipalId(pub String);

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrincipalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Role {
    #[default]
    User,
    Staff,
    Admin,
}

impl Role {
    /// Parse a role string from the profile endpoint.
    /// Unknown values fall back to `User`.
    pub fn from_str(s: Option<&str>) -> Self {
        match s.map(|r| r.trim().to_lowercase()).as_deref() {
            Some("admin") => Role::Admin,
            Some("staff") => Role::Staff,
            _ => Role::User,
        }
    }
}

fn deserialize_role<'de, D>(deserializer: D) -> Result<Role, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(Role::from_str(raw.as_deref()))
}

/// The signed-in principal as returned by `GET /profile/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Principal {
    #[serde(default)]
    pub id: Option<i64>,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, deserialize_with = "deserialize_role")]
    pub role: Role,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

impl Principal {
    /// Key used for principal-scoped caches. Falls back to the username
    /// for servers that do not expose a numeric id on the profile.
    pub fn principal_id(&self) -> PrincipalId {
        match self.id {
            Some(id) => PrincipalId(id.to_string()),
            None => PrincipalId(self.username.clone()),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.username
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Staff | Role::Admin)
    }
}

/// Image sent with a profile update as the `profile_picture` file part.
#[derive(Clone, PartialEq, Eq)]
pub struct PictureUpload {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl PictureUpload {
    /// Content type is guessed from the file extension.
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let ext = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let mime = match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "webp" => "image/webp",
            _ => "application/octet-stream",
        };
        Self {
            file_name,
            mime: mime.to_string(),
            bytes,
        }
    }
}

impl fmt::Debug for PictureUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PictureUpload")
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Body for `PUT /profile/`. Sent as JSON, or as a multipart form when a
/// picture is attached.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    pub username: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_password: Option<String>,
    #[serde(skip)]
    pub profile_picture: Option<PictureUpload>,
}

impl ProfileUpdate {
    /// Start an update that keeps the principal's current name and email.
    pub fn from_principal(principal: &Principal) -> Self {
        Self {
            username: principal.username.clone(),
            email: principal.email.clone(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.new_password = Some(password.to_string());
        self.confirm_password = Some(password.to_string());
        self
    }

    pub fn with_picture(mut self, picture: PictureUpload) -> Self {
        self.profile_picture = Some(picture);
        self
    }

    /// Text fields of the multipart form, in the order they are sent.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("username", self.username.clone()),
            ("email", self.email.clone()),
        ];
        if let Some(ref password) = self.new_password {
            fields.push(("new_password", password.clone()));
        }
        if let Some(ref confirm) = self.confirm_password {
            fields.push(("confirm_password", confirm.clone()));
        }
        fields
    }
}
