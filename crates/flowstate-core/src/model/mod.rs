// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Value types shared by definitions, the store and the engine.

pub mod instance;
pub mod next_action;
pub mod settings;
pub mod state;

pub use self::instance::{
    ActionType, InstanceStatus, NewInstance, StateVariables, WorkflowInstance,
    WorkflowInstanceAction, changed_variables,
};
pub use self::next_action::NextAction;
pub use self::settings::WorkflowSettings;
pub use self::state::{WorkflowState, WorkflowStateType};
