//! Sign-in with a previously confirmed verification code.

use serde_json::json;

use super::dispatch::Handler;
use super::{HandlerError, Session};
use crate::protocol::{
    AUTHORIZATION_SIGN_IN_FAILURE, AUTHORIZATION_SIGN_IN_REQUEST, AUTHORIZATION_SIGN_IN_SUCCESS, Action,
    SignInRequest,
};

impl Handler for SignInRequest {
    const REQUEST: &'static str = AUTHORIZATION_SIGN_IN_REQUEST;
    const FAILURE: &'static str = AUTHORIZATION_SIGN_IN_FAILURE;

    async fn handle(self, session: &Session) -> Result<Action, HandlerError> {
        let found = session.db(|db| db.find_client_with_code(&self.country_code, &self.phone_number, &self.code))?;
        let Some(client) = found else {
            tracing::info!(conn_id = session.id(), "Sign-in refused");
            return Ok(Action::failure(Self::FAILURE, ["invalid credentials"]));
        };

        session.registry().sign_in(session.id(), client.clone())?;
        tracing::info!(conn_id = session.id(), client_id = client.id, "Signed in");
        Ok(Action::success(AUTHORIZATION_SIGN_IN_SUCCESS, json!({ "id": client.id })))
    }
}
