use server_api::ApiContext;

use crate::{auth::AuthConfig, hub::NotificationHub};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) auth: AuthConfig,
    pub(crate) hub: NotificationHub,
}
