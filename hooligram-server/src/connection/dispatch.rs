//! Action routing.
//!
//! [`Handlers`] maps a request type tag to a route. A route decodes the
//! payload into the handler's typed request, runs the handler, writes the
//! resulting action to the connection and returns it. The read loop never
//! writes the result a second time.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use super::{HandlerError, Session};
use crate::protocol::{Action, Frame, FromPayload, ProtocolError};

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Action> + Send + 'a>>;

/// A type-erased route.
pub type HandlerFn = for<'a> fn(&'a Session, Map<String, Value>) -> HandlerFuture<'a>;

/// A typed request that knows how to answer itself.
pub trait Handler: FromPayload + Send + 'static {
    /// Type tag this handler is registered under.
    const REQUEST: &'static str;
    /// Type tag of the failure response.
    const FAILURE: &'static str;

    fn handle(self, session: &Session) -> impl Future<Output = Result<Action, HandlerError>> + Send;
}

fn route<R: Handler>(session: &Session, payload: Map<String, Value>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let action = match R::from_payload(&payload) {
            Err(reasons) => Action::failure(R::FAILURE, reasons),
            Ok(request) => match request.handle(session).await {
                Ok(action) => action,
                Err(e) => {
                    tracing::error!(conn_id = session.id(), kind = R::REQUEST, "Handler failed: {e}");
                    Action::failure(R::FAILURE, ["server error"])
                }
            },
        };
        session.reply(&action);
        action
    })
}

/// Registration table from request type to route.
#[derive(Default)]
pub struct Handlers {
    routes: HashMap<&'static str, HandlerFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request type the server understands.
    pub fn standard() -> Self {
        use crate::protocol::{
            GroupAddMemberRequest, GroupCreateRequest, GroupLeaveRequest, MessagingSendRequest,
            RequestCodeRequest, SignInRequest, SubmitCodeRequest,
        };
        let mut handlers = Self::new();
        handlers
            .register::<SignInRequest>()
            .register::<RequestCodeRequest>()
            .register::<SubmitCodeRequest>()
            .register::<GroupCreateRequest>()
            .register::<GroupAddMemberRequest>()
            .register::<GroupLeaveRequest>()
            .register::<MessagingSendRequest>();
        handlers
    }

    pub fn register<R: Handler>(&mut self) -> &mut Self {
        self.routes.insert(R::REQUEST, route::<R> as HandlerFn);
        self
    }

    #[cfg(test)]
    pub fn contains(&self, kind: &str) -> bool {
        self.routes.contains_key(kind)
    }

    /// Route one frame. Unknown types are answered with a protocol error.
    pub async fn dispatch(&self, session: &Session, frame: Frame) -> Action {
        match self.routes.get(frame.kind.as_str()) {
            Some(route) => route(session, frame.payload).await,
            None => {
                tracing::debug!(conn_id = session.id(), kind = %frame.kind, "Unsupported action");
                let action = Action::error(&ProtocolError::Unsupported(frame.kind));
                session.reply(&action);
                action
            }
        }
    }
}
