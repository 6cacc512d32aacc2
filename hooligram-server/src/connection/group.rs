//! Group management: create, add a member, leave.

use serde_json::json;

use super::dispatch::Handler;
use super::{HandlerError, Session};
use crate::protocol::{
    Action, GROUP_ADD_MEMBER_FAILURE, GROUP_ADD_MEMBER_REQUEST, GROUP_ADD_MEMBER_SUCCESS, GROUP_CREATE_FAILURE,
    GROUP_CREATE_REQUEST, GROUP_CREATE_SUCCESS, GROUP_LEAVE_FAILURE, GROUP_LEAVE_REQUEST, GROUP_LEAVE_SUCCESS,
    GroupAddMemberRequest, GroupCreateRequest, GroupLeaveRequest,
};

/// Drop repeated ids, keeping the first occurrence of each.
fn dedup_keep_order(ids: &[i64]) -> Vec<i64> {
    let mut seen = std::collections::HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

impl Handler for GroupCreateRequest {
    const REQUEST: &'static str = GROUP_CREATE_REQUEST;
    const FAILURE: &'static str = GROUP_CREATE_FAILURE;

    async fn handle(self, session: &Session) -> Result<Action, HandlerError> {
        let Some(client) = session.signed_in_client()? else {
            return Ok(Action::failure(Self::FAILURE, ["not signed in"]));
        };

        let member_ids = dedup_keep_order(&self.member_ids);
        let mut reasons = Vec::new();
        if member_ids.len() < 2 {
            reasons.push("need at least two members");
        }
        if !member_ids.contains(&client.id) {
            reasons.push("include group creator in member_ids");
        }
        if !reasons.is_empty() {
            return Ok(Action::failure(Self::FAILURE, reasons));
        }

        let group = session.db(|db| db.create_group(&self.name, &member_ids))?;
        tracing::info!(
            conn_id = session.id(),
            client_id = client.id,
            group_id = group.id,
            members = group.member_ids.len(),
            "Group created"
        );
        Ok(Action::success(
            GROUP_CREATE_SUCCESS,
            json!({
                "id": group.id,
                "name": group.name,
                "member_ids": group.member_ids,
                "date_created": group.date_created,
            }),
        ))
    }
}

impl Handler for GroupAddMemberRequest {
    const REQUEST: &'static str = GROUP_ADD_MEMBER_REQUEST;
    const FAILURE: &'static str = GROUP_ADD_MEMBER_FAILURE;

    async fn handle(self, session: &Session) -> Result<Action, HandlerError> {
        let Some(client) = session.signed_in_client()? else {
            return Ok(Action::failure(Self::FAILURE, ["not signed in"]));
        };

        let allowed = session.db(|db| db.is_member(self.group_id, client.id))?;
        if !allowed {
            return Ok(Action::failure(Self::FAILURE, ["not allowed"]));
        }

        session.db(|db| db.add_members(self.group_id, &[self.member_id]))?;
        tracing::info!(
            conn_id = session.id(),
            client_id = client.id,
            group_id = self.group_id,
            member_id = self.member_id,
            "Group member added"
        );
        Ok(Action::success(
            GROUP_ADD_MEMBER_SUCCESS,
            json!({ "group_id": self.group_id, "member_id": self.member_id }),
        ))
    }
}

impl Handler for GroupLeaveRequest {
    const REQUEST: &'static str = GROUP_LEAVE_REQUEST;
    const FAILURE: &'static str = GROUP_LEAVE_FAILURE;

    async fn handle(self, session: &Session) -> Result<Action, HandlerError> {
        let Some(client) = session.signed_in_client()? else {
            return Ok(Action::failure(Self::FAILURE, ["not signed in"]));
        };

        let member = session.db(|db| db.is_member(self.group_id, client.id))?;
        if !member {
            return Ok(Action::failure(Self::FAILURE, ["not in group"]));
        }

        session.db(|db| db.remove_members(self.group_id, &[client.id]))?;
        tracing::info!(conn_id = session.id(), client_id = client.id, group_id = self.group_id, "Left group");
        Ok(Action::success(GROUP_LEAVE_SUCCESS, json!({ "group_id": self.group_id })))
    }
}
