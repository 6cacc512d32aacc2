//! Phone number verification: request a code, then submit it.
//!
//! Requesting a code caches the (possibly new) client on the connection
//! without signing it in and without any previously confirmed code, so the
//! next submit is always checked with the SMS provider. Identities cached by
//! sign-in or an earlier successful submit compare the stored code directly.

use serde_json::json;

use super::dispatch::Handler;
use super::{HandlerError, Session};
use crate::protocol::{
    Action, RequestCodeRequest, SubmitCodeRequest, VERIFICATION_REQUEST_CODE_FAILURE,
    VERIFICATION_REQUEST_CODE_REQUEST, VERIFICATION_REQUEST_CODE_SUCCESS, VERIFICATION_SUBMIT_CODE_FAILURE,
    VERIFICATION_SUBMIT_CODE_REQUEST, VERIFICATION_SUBMIT_CODE_SUCCESS,
};

impl Handler for RequestCodeRequest {
    const REQUEST: &'static str = VERIFICATION_REQUEST_CODE_REQUEST;
    const FAILURE: &'static str = VERIFICATION_REQUEST_CODE_FAILURE;

    async fn handle(self, session: &Session) -> Result<Action, HandlerError> {
        let sent = session.state().sms.start(&self.country_code, &self.phone_number).await?;
        if !sent {
            tracing::warn!(conn_id = session.id(), "SMS provider refused to send a verification code");
            return Ok(Action::failure(Self::FAILURE, ["failed to send verification code"]));
        }

        let mut client = session.db(|db| db.find_or_create_client(&self.country_code, &self.phone_number))?;
        // A fresh code is on its way; the confirmed one is stale until resubmitted.
        client.verification_code = None;
        session.registry().set_identity(session.id(), client.clone())?;
        tracing::info!(conn_id = session.id(), client_id = client.id, "Verification code sent");
        Ok(Action::success(VERIFICATION_REQUEST_CODE_SUCCESS, json!({})))
    }
}

impl Handler for SubmitCodeRequest {
    const REQUEST: &'static str = VERIFICATION_SUBMIT_CODE_REQUEST;
    const FAILURE: &'static str = VERIFICATION_SUBMIT_CODE_FAILURE;

    async fn handle(self, session: &Session) -> Result<Action, HandlerError> {
        let Some(mut client) = session.client()? else {
            return Ok(Action::failure(Self::FAILURE, ["unknown client"]));
        };

        let matched = match client.verification_code.as_deref() {
            None => {
                session
                    .state()
                    .sms
                    .check(&client.country_code, &client.phone_number, &self.code)
                    .await?
            }
            Some(stored) => stored == self.code,
        };
        if !matched {
            tracing::info!(conn_id = session.id(), client_id = client.id, "Incorrect verification code");
            return Ok(Action::failure(Self::FAILURE, ["incorrect verification code"]));
        }

        session.db(|db| db.update_verification_code(client.id, &self.code))?;
        client.verification_code = Some(self.code);
        let id = client.id;
        session.registry().sign_in(session.id(), client)?;
        tracing::info!(conn_id = session.id(), client_id = id, "Verification confirmed");
        Ok(Action::success(VERIFICATION_SUBMIT_CODE_SUCCESS, json!({ "id": id })))
    }
}
