//! Login and class selection
//!
//! These calls produce the session the sync layer reads its class and token
//! from. Switching class and logging out are local only.

use podium_common::session::{LoginResponse, SelectClassResponse, Session};
use podium_common::ClassId;
use tracing::info;

use crate::api::{ApiClient, ApiError, LOGIN_PATH};

const SELECT_CLASS_PATH: &str = "/auth/select-class";

#[derive(serde::Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
    login_type: &'a str,
}

#[derive(serde::Serialize)]
struct SelectClassRequest {
    class_id: ClassId,
}

impl ApiClient {
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        login_type: &str,
    ) -> Result<Session, ApiError> {
        let request = LoginRequest {
            username,
            password,
            login_type,
        };
        let response: LoginResponse = self.post(LOGIN_PATH, &[], &request).await?;

        let mut store = self.session().write().await;
        store.update(|session| session.apply_login(response)).await?;

        let session = store.session();
        info!(
            username,
            class_id = ?session.current_class_id,
            need_select_class = session.need_select_class,
            "Logged in"
        );
        Ok(session.clone())
    }

    pub async fn select_class(&self, class_id: ClassId) -> Result<Session, ApiError> {
        let user_id = self
            .session()
            .read()
            .await
            .session()
            .user
            .as_ref()
            .map(|user| user.id)
            .ok_or(ApiError::NotLoggedIn)?;

        let response: SelectClassResponse = self
            .post(
                SELECT_CLASS_PATH,
                &[("user_id", user_id.to_string())],
                &SelectClassRequest { class_id },
            )
            .await?;

        let mut store = self.session().write().await;
        store.update(|session| session.apply_class_selection(response)).await?;
        info!(%class_id, "Selected class");
        Ok(store.session().clone())
    }

    /// Change the selected class, keeping the current token
    pub async fn switch_class(&self, class_id: ClassId, class_name: &str) -> Result<(), ApiError> {
        self.session()
            .write()
            .await
            .update(|session| session.switch_class(class_id, class_name))
            .await?;
        info!(%class_id, "Switched class");
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        self.session().write().await.update(Session::logout).await?;
        info!("Logged out");
        Ok(())
    }
}
