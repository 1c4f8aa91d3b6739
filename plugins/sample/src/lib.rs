// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

//! Reference detection rule compiled to a `rulecraft:detection` component:
//! flags an AWS CloudTrail record for a failed console sign-in.

use bindings::exports::rulecraft::detection::rule::{Capabilities, Guest};
use serde_json::Value;

mod bindings {
    wit_bindgen::generate!({
        path: "../../wit",
        world: "plugin",
    });
}

struct Detection;

impl Guest for Detection {
    fn load() -> Capabilities {
        Capabilities {
            has_title: true,
            has_dedup: true,
            has_alert_context: true,
        }
    }

    fn rule(event: String) -> Result<bool, String> {
        let event: Value = serde_json::from_str(&event).map_err(|e| e.to_string())?;

        let is_console_login = event.get("eventName").and_then(Value::as_str) == Some("ConsoleLogin");
        let failed = event
            .get("responseElements")
            .and_then(|r| r.get("ConsoleLogin"))
            .and_then(Value::as_str)
            == Some("Failure");

        Ok(is_console_login && failed)
    }

    fn title(event: String) -> Result<String, String> {
        let event: Value = serde_json::from_str(&event).map_err(|e| e.to_string())?;
        let user = event
            .get("userIdentity")
            .and_then(|u| u.get("arn"))
            .and_then(Value::as_str)
            .unwrap_or("unknown user");

        Ok(format!("Failed console login for {user}"))
    }

    fn dedup(event: String) -> Result<String, String> {
        let event: Value = serde_json::from_str(&event).map_err(|e| e.to_string())?;
        let account_id = event
            .get("recipientAccountId")
            .and_then(Value::as_str)
            .ok_or("recipientAccountId is required")?;

        Ok(account_id.to_string())
    }

    fn alert_context(event: String) -> Result<String, String> {
        let event: Value = serde_json::from_str(&event).map_err(|e| e.to_string())?;
        let context = serde_json::json!({
            "sourceIPAddress": event.get("sourceIPAddress"),
            "userAgent": event.get("userAgent"),
            "errorMessage": event.get("errorMessage"),
        });

        serde_json::to_string(&context).map_err(|e| e.to_string())
    }
}

bindings::export!(Detection with_types_in bindings);
