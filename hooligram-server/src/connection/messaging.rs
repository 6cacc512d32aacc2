//! Sending a message to a group.
//!
//! The message is stored, then handed to the delivery dispatcher with the
//! group's current member list as recipients. The job is queued before the
//! sender's success is written.

use super::dispatch::Handler;
use super::{HandlerError, Session};
use crate::delivery::MessageDelivery;
use crate::protocol::{
    Action, MESSAGING_SEND_FAILURE, MESSAGING_SEND_REQUEST, MESSAGING_SEND_SUCCESS, MessagingSendRequest,
};

impl Handler for MessagingSendRequest {
    const REQUEST: &'static str = MESSAGING_SEND_REQUEST;
    const FAILURE: &'static str = MESSAGING_SEND_FAILURE;

    async fn handle(self, session: &Session) -> Result<Action, HandlerError> {
        let Some(client) = session.signed_in_client()? else {
            return Ok(Action::failure(Self::FAILURE, ["not signed in"]));
        };

        let stored = session.db(|db| {
            if !db.is_member(self.group_id, client.id)? {
                return Ok(None);
            }
            let message = db.create_message(self.group_id, client.id, &self.content)?;
            let recipient_ids = db.member_ids(self.group_id)?;
            Ok(Some((message, recipient_ids)))
        })?;
        let Some((message, recipient_ids)) = stored else {
            return Ok(Action::failure(Self::FAILURE, ["not in group"]));
        };

        tracing::debug!(
            conn_id = session.id(),
            client_id = client.id,
            group_id = message.group_id,
            message_id = message.id,
            recipients = recipient_ids.len(),
            "Message stored"
        );
        let payload = Action::deliver(&message).payload;
        if session
            .state()
            .deliveries
            .send(MessageDelivery { message, recipient_ids })
            .is_err()
        {
            tracing::warn!(conn_id = session.id(), "Delivery queue closed, message will not be pushed");
        }
        Ok(Action::success(MESSAGING_SEND_SUCCESS, payload))
    }
}
