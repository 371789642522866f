//! OCPP 2.1 dispatcher
//!
//! Extends 2.0.1 through the parent fallback: only the actions overridden
//! here get 2.1-specific handling, everything else resolves to the 2.0.1
//! table. Display-message management is the 2.1 surface the emulator
//! answers.

use std::sync::Arc;

use serde_json::json;

use crate::domain::OcppVersion;

use super::{handler, Dispatcher};

/// Build the OCPP 2.1 dispatch table over the 2.0.1 parent.
pub fn dispatcher(parent: Arc<Dispatcher>) -> Dispatcher {
    let mut d = Dispatcher::new(OcppVersion::V21, Some(parent));

    d.register(
        "SetDisplayMessage",
        handler(|ctx| async move {
            let accepted = ctx.station.set_display_message(ctx.payload["message"].clone()).await;
            Ok(json!({ "status": if accepted { "Accepted" } else { "Rejected" } }))
        }),
    );

    d.register(
        "GetDisplayMessages",
        handler(|ctx| async move {
            let request_id = ctx.payload["requestId"].as_i64().unwrap_or(0);
            let any = ctx.station.send_display_messages(request_id).await;
            Ok(json!({ "status": if any { "Accepted" } else { "Unknown" } }))
        }),
    );

    d.register(
        "ClearDisplayMessage",
        handler(|ctx| async move {
            let id = ctx.payload["id"].as_i64().unwrap_or(0);
            let cleared = ctx.station.clear_display_message(id).await;
            Ok(json!({ "status": if cleared { "Accepted" } else { "Unknown" } }))
        }),
    );

    d
}
