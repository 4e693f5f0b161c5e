// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions bundled with the standalone executor.
//!
//! `order` takes an order from receipt through stock reservation and payment
//! to shipping. Payment is confirmed from outside: set the `paid` variable
//! and wake the instance up through the management API. Each paid order
//! creates an `invoice` child workflow.

use chrono::{TimeDelta, Utc};
use serde_json::Value;

use flowstate_core::definition::{DefinitionRegistry, StateVariable, WorkflowDefinition, handler_fn};
use flowstate_core::model::{
    NewInstance, NextAction, WorkflowSettings, WorkflowState, WorkflowStateType,
};

pub const ORDER: &str = "order";
pub const INVOICE: &str = "invoice";

pub const RECEIVED: WorkflowState = WorkflowState::new("received", WorkflowStateType::Start);
pub const RESERVE_STOCK: WorkflowState =
    WorkflowState::new("reserve_stock", WorkflowStateType::Normal);
pub const AWAIT_PAYMENT: WorkflowState =
    WorkflowState::new("await_payment", WorkflowStateType::Wait);
pub const SHIPPED: WorkflowState = WorkflowState::new("shipped", WorkflowStateType::End);
pub const CANCELLED: WorkflowState = WorkflowState::new("cancelled", WorkflowStateType::End);
pub const MANUAL_REVIEW: WorkflowState =
    WorkflowState::new("manual_review", WorkflowStateType::Manual);
pub const ORDER_ERROR: WorkflowState = WorkflowState::new("error", WorkflowStateType::Manual);

pub const ISSUE: WorkflowState = WorkflowState::new("issue", WorkflowStateType::Start);
pub const ISSUED: WorkflowState = WorkflowState::new("issued", WorkflowStateType::End);
pub const INVOICE_ERROR: WorkflowState = WorkflowState::new("error", WorkflowStateType::Manual);

/// Minutes between stock checks while an item is out of stock.
const RESTOCK_CHECK_MINUTES: i64 = 15;

/// Registry with every bundled definition.
pub fn registry() -> flowstate_core::Result<DefinitionRegistry> {
    DefinitionRegistry::new().with(order()?)?.with(invoice()?)
}

pub fn order() -> flowstate_core::Result<WorkflowDefinition> {
    WorkflowDefinition::builder(ORDER, RECEIVED, ORDER_ERROR)
        .description("Order fulfilment: stock reservation, payment and shipping")
        .settings(WorkflowSettings::default().max_retries(8))
        .state_with_variables(
            RECEIVED,
            vec![
                StateVariable::string("order_id").read_only(),
                StateVariable::integer("amount").read_only(),
            ],
            handler_fn(|_, args| {
                let amount = args.get("amount").and_then(Value::as_i64).unwrap_or(0);
                if amount <= 0 {
                    return Ok(NextAction::move_to_state(
                        CANCELLED,
                        format!("Rejected order with amount {}", amount),
                    ));
                }
                Ok(NextAction::move_to_state(RESERVE_STOCK, "Order accepted"))
            }),
        )
        .state_with_variables(
            RESERVE_STOCK,
            vec![
                StateVariable::boolean("in_stock").default_value("true").read_only(),
                StateVariable::integer("stock_checks").default_value("0"),
            ],
            handler_fn(|_, args| {
                let checks = args.get("stock_checks").and_then(Value::as_i64).unwrap_or(0) + 1;
                args.set("stock_checks", Value::from(checks));
                if args.get("in_stock").and_then(Value::as_bool).unwrap_or(false) {
                    Ok(NextAction::move_to_state(AWAIT_PAYMENT, "Stock reserved"))
                } else {
                    Ok(NextAction::retry_after(
                        Utc::now() + TimeDelta::minutes(RESTOCK_CHECK_MINUTES),
                        format!("Out of stock (check {})", checks),
                    ))
                }
            }),
        )
        .state_with_variables(
            AWAIT_PAYMENT,
            vec![
                StateVariable::string("order_id").read_only(),
                StateVariable::integer("amount").read_only(),
                StateVariable::boolean("paid").default_value("false").read_only(),
            ],
            handler_fn(|execution, args| {
                if !args.get("paid").and_then(Value::as_bool).unwrap_or(false) {
                    return Ok(NextAction::stop_in_state(AWAIT_PAYMENT, "Waiting for payment"));
                }
                let order_id = args.get("order_id").and_then(Value::as_str).unwrap_or_default();
                let amount = args.get("amount").and_then(Value::as_i64).unwrap_or(0);
                let mut invoice = NewInstance::new(INVOICE)
                    .variable("order_id", order_id)
                    .variable("amount", amount.to_string());
                if let Some(key) = execution.business_key() {
                    invoice = invoice.business_key(key);
                }
                execution.add_child_workflow(invoice);
                Ok(NextAction::move_to_state(SHIPPED, "Payment received"))
            }),
        )
        .permit(RECEIVED, RESERVE_STOCK)
        .permit(RECEIVED, CANCELLED)
        .permit_with_failure(RESERVE_STOCK, AWAIT_PAYMENT, MANUAL_REVIEW)
        .permit(AWAIT_PAYMENT, AWAIT_PAYMENT)
        .permit(AWAIT_PAYMENT, SHIPPED)
        .build()
}

pub fn invoice() -> flowstate_core::Result<WorkflowDefinition> {
    WorkflowDefinition::builder(INVOICE, ISSUE, INVOICE_ERROR)
        .description("Invoice issued for a paid order")
        .state_with_variables(
            ISSUE,
            vec![StateVariable::string("order_id").read_only()],
            handler_fn(|execution, args| {
                let order_id = args.get("order_id").and_then(Value::as_str).unwrap_or_default();
                anyhow::ensure!(!order_id.is_empty(), "invoice without order id");
                execution.set_variable("invoice_number", format!("INV-{}", order_id));
                Ok(NextAction::move_to_state(ISSUED, "Invoice issued"))
            }),
        )
        .permit(ISSUE, ISSUED)
        .build()
}
