//! Persisted client session
//!
//! The session is the small key-value set that survives restarts: token,
//! current user, selected class and the pending-action flags handed out at
//! login. The sync core only reads the selected class and the token.

use crate::types::ClassId;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot read session file {0}: {1}")]
    Read(PathBuf, io::Error),

    #[error("cannot write session file {0}: {1}")]
    Write(PathBuf, io::Error),

    #[error("session file {0} is corrupt: {1}")]
    Corrupt(PathBuf, serde_json::Error),

    #[error("cannot encode session: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What the sync core needs from the session
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub class_id: Option<ClassId>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Teacher,
    Student,
    Judge,
    Audience,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UserInfo {
    pub id: u64,
    pub username: String,
    pub role: UserRole,
    pub display_name: String,

    #[serde(default)]
    pub workspace_id: Option<u64>,

    #[serde(default)]
    pub class_id: Option<ClassId>,

    #[serde(default)]
    pub has_presented: bool,

    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: String,
}

/// `POST /auth/login` response
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub user: UserInfo,

    #[serde(default)]
    pub available_classes: Vec<ClassInfo>,

    #[serde(default)]
    pub need_select_class: bool,

    #[serde(default)]
    pub need_change_password: bool,

    #[serde(default)]
    pub need_set_topic: bool,
}

/// `POST /auth/select-class` response
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SelectClassResponse {
    pub access_token: String,
    pub class_id: ClassId,
    pub class_name: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Session {
    pub token: Option<String>,
    pub user: Option<UserInfo>,
    pub current_class_id: Option<ClassId>,
    pub current_class_name: Option<String>,
    pub available_classes: Vec<ClassInfo>,
    pub need_select_class: bool,
    pub need_change_password: bool,
    pub need_set_topic: bool,
}

impl Session {
    pub fn context(&self) -> SessionContext {
        SessionContext {
            class_id: self.current_class_id,
            token: self.token.clone(),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.token.is_some()
    }

    pub fn has_selected_class(&self) -> bool {
        self.current_class_id.is_some()
    }

    pub fn apply_login(&mut self, response: LoginResponse) {
        self.token = Some(response.access_token);
        self.need_select_class = response.need_select_class;
        self.need_change_password = response.need_change_password;
        self.need_set_topic = response.need_set_topic;
        self.available_classes = response.available_classes;

        // Students are bound to their class, no selection step
        if response.user.role == UserRole::Student {
            if let Some(class) = self.available_classes.first() {
                self.current_class_id = Some(class.id);
                self.current_class_name = Some(class.name.clone());
            }
        }
        self.user = Some(response.user);
    }

    pub fn apply_class_selection(&mut self, response: SelectClassResponse) {
        self.token = Some(response.access_token);
        self.current_class_id = Some(response.class_id);
        self.current_class_name = Some(response.class_name);
    }

    /// Change class without a new token
    pub fn switch_class(&mut self, class_id: ClassId, class_name: &str) {
        self.current_class_id = Some(class_id);
        self.current_class_name = Some(class_name.to_string());
    }

    /// Forget credentials after the server rejected them
    pub fn clear_credentials(&mut self) {
        self.token = None;
        self.user = None;
        self.current_class_id = None;
        self.current_class_name = None;
    }

    pub fn logout(&mut self) {
        *self = Session::default();
    }
}

/// Session backed by a JSON file, or held only in memory
#[derive(Debug, Default)]
pub struct SessionStore {
    path: Option<PathBuf>,
    session: Session,
}

impl SessionStore {
    /// Session that is never written anywhere
    pub fn ephemeral(session: Session) -> Self {
        Self {
            path: None,
            session,
        }
    }

    /// Restore the session saved at `path`, or start empty if there is none
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, SessionError> {
        let path = path.as_ref().to_path_buf();
        let session = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| SessionError::Corrupt(path.clone(), e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No saved session at {}", path.display());
                Session::default()
            }
            Err(e) => return Err(SessionError::Read(path, e)),
        };

        if session.is_logged_in() {
            info!(
                class_id = ?session.current_class_id,
                "Restored session from {}",
                path.display()
            );
        }

        Ok(Self {
            path: Some(path),
            session,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn context(&self) -> SessionContext {
        self.session.context()
    }

    /// Mutate the session and persist the result
    pub async fn update<F>(&mut self, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut Session),
    {
        f(&mut self.session);
        self.save().await
    }

    async fn save(&self) -> Result<(), SessionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SessionError::Write(path.clone(), e))?;
            }
        }

        // Write aside then rename so a crash never leaves half a file
        let body = serde_json::to_string_pretty(&self.session)?;
        let tmp_path = path.with_extension("partial");
        if let Err(e) = fs::write(&tmp_path, body).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(SessionError::Write(tmp_path, e));
        }
        fs::rename(&tmp_path, path).await.map_err(|e| SessionError::Write(path.clone(), e))
    }
}
