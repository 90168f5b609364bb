//! Domain vocabulary: change states, views, and machines for the
//! subscription / member-assignment / notification flow.

pub mod assignment;
pub mod email;
pub mod subscription;

pub use assignment::{AssignMembers, AssignmentMachine, AssignmentTracker, MemberAssign};
pub use email::{EmailSender, EmailsToSend, LoggingMailer, MailTransport, Notification};
pub use subscription::{SubscriptionCreate, SubscriptionList};

use std::sync::Arc;

use crate::core::CoreBuilder;

/// Register the full domain vocabulary on a core builder.
pub fn register(builder: CoreBuilder) -> CoreBuilder {
    builder
        .change(Box::new(SubscriptionCreate::default()))
        .change(Box::new(AssignMembers))
        .change(Box::new(MemberAssign::default()))
        .view(Box::new(SubscriptionList::default()))
        .view(Box::new(AssignmentTracker::default()))
        .view(Box::new(EmailsToSend::default()))
        .machine(Arc::new(AssignmentMachine))
}

/// Partition holding all events of one subscription.
pub(crate) fn subscription_partition(subscription_id: &str) -> String {
    format!("sub-{subscription_id}")
}
