// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

mod engine;
pub mod state;
pub use engine::{Config, Engine};

wasmtime::component::bindgen!({
    path: "../../wit",
    world: "plugin",
    async: true,
});

pub mod detection_component {
    pub use crate::exports::rulecraft::detection::rule;
    pub use crate::Plugin;
}
