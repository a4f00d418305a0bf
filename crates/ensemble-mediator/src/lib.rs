//! Typed message bus between agents

mod mediator;
mod stats;

pub use mediator::{
    EVENT_DELEGATION_COMPLETE, EVENT_MESSAGE_SENT, Mediator, MediatorEvent, SubscriptionId,
};
pub use stats::AgentStats;

pub use ensemble_core::{BusMessage, DelegationResult, MessageKind, MessagePriority};
