use std::fmt;

use chrono::NaiveDate;

use crate::models::InvoiceStatus;

/// Externally triggered lifecycle events.
///
/// The state machine progresses through these states:
/// - Draft: being composed
/// - Sent: delivered to the recipient
/// - Overdue: sent and past its due date
/// - Paid: settled (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The invoice was delivered to the recipient.
    Send,

    /// Payment was received.
    Pay,

    /// An overdue sweep found the due date in the past.
    DueDatePassed,
}

impl LifecycleEvent {
    /// Status the event moves an invoice into.
    pub fn target(&self) -> InvoiceStatus {
        match self {
            LifecycleEvent::Send => InvoiceStatus::Sent,
            LifecycleEvent::Pay => InvoiceStatus::Paid,
            LifecycleEvent::DueDatePassed => InvoiceStatus::Overdue,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Send => write!(f, "send"),
            LifecycleEvent::Pay => write!(f, "pay"),
            LifecycleEvent::DueDatePassed => write!(f, "due_date_passed"),
        }
    }
}

/// Trait for state transitions in the invoice lifecycle.
///
/// Defines which events are accepted in which states. Re-applying the event
/// that produced the current state is accepted, so callers can retry.
pub trait Transition {
    /// Determines the next status for `event`, or `None` if the event is not
    /// allowed in `current`.
    fn transition(current: InvoiceStatus, event: LifecycleEvent) -> Option<InvoiceStatus>;

    /// Gets the initial status for a new invoice.
    fn initial_state() -> InvoiceStatus {
        InvoiceStatus::Draft
    }
}

/// Default lifecycle:
/// - Draft -> Sent
/// - Draft | Sent | Overdue -> Paid
/// - Sent -> Overdue (only once the due date has passed)
pub struct InvoiceStateMachine;

impl Transition for InvoiceStateMachine {
    fn transition(current: InvoiceStatus, event: LifecycleEvent) -> Option<InvoiceStatus> {
        use InvoiceStatus::*;

        match (current, event) {
            (Draft | Sent, LifecycleEvent::Send) => Some(Sent),
            (Draft | Sent | Overdue | Paid, LifecycleEvent::Pay) => Some(Paid),
            (Sent | Overdue, LifecycleEvent::DueDatePassed) => Some(Overdue),
            _ => None,
        }
    }
}

/// `true` when the due date lies strictly before `today`. Invoices without a
/// due date are never overdue.
pub fn is_past_due(due_date: Option<NaiveDate>, today: NaiveDate) -> bool {
    due_date.map(|due| due < today).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_to_sent_transition() {
        let next = InvoiceStateMachine::transition(InvoiceStatus::Draft, LifecycleEvent::Send);
        assert_eq!(next, Some(InvoiceStatus::Sent));
    }

    #[test]
    fn test_send_is_idempotent() {
        let next = InvoiceStateMachine::transition(InvoiceStatus::Sent, LifecycleEvent::Send);
        assert_eq!(next, Some(InvoiceStatus::Sent));
    }

    #[test]
    fn test_paid_invoice_cannot_be_resent_or_become_overdue() {
        assert_eq!(
            InvoiceStateMachine::transition(InvoiceStatus::Paid, LifecycleEvent::Send),
            None
        );
        assert_eq!(
            InvoiceStateMachine::transition(InvoiceStatus::Paid, LifecycleEvent::DueDatePassed),
            None
        );
    }

    #[test]
    fn test_only_sent_invoices_become_overdue() {
        assert_eq!(
            InvoiceStateMachine::transition(InvoiceStatus::Draft, LifecycleEvent::DueDatePassed),
            None
        );
        assert_eq!(
            InvoiceStateMachine::transition(InvoiceStatus::Sent, LifecycleEvent::DueDatePassed),
            Some(InvoiceStatus::Overdue)
        );
    }

    #[test]
    fn test_overdue_invoice_can_be_paid() {
        let next = InvoiceStateMachine::transition(InvoiceStatus::Overdue, LifecycleEvent::Pay);
        assert_eq!(next, Some(InvoiceStatus::Paid));
    }

    #[test]
    fn test_past_due_is_strict() {
        let today = NaiveDate::from_ymd_opt(2024, 4, 10).unwrap();
        assert!(is_past_due(NaiveDate::from_ymd_opt(2024, 4, 9), today));
        assert!(!is_past_due(Some(today), today));
        assert!(!is_past_due(None, today));
    }

    #[test]
    fn test_initial_state_is_draft() {
        assert_eq!(InvoiceStateMachine::initial_state(), InvoiceStatus::Draft);
    }
}
