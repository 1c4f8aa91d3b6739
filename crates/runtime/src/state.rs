// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use wasmtime::component::ResourceTable;

/// Per-instance host state.
///
/// Rule components receive no WASI capabilities: no filesystem, no clock
/// beyond what the guest can compute itself, no outbound network. A
/// detection predicate has no legitimate need for any of it, and keeping
/// the linker free of WASI imports means the component model's export-only
/// `plugin` world is all a rule ever has to satisfy.
#[derive(Default)]
pub struct State {
    table: ResourceTable,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&mut self) -> &mut ResourceTable {
        &mut self.table
    }
}
