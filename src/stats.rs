use chrono::NaiveDate;
use serde::Serialize;
use utoipa::ToSchema;

use crate::models::{Invoice, InvoiceState};

/// Aggregate figures over a set of invoices.
#[derive(Serialize, Debug, Default, Clone, PartialEq, ToSchema)]
pub struct InvoiceStats {
    pub total: usize,
    pub pending: usize,
    pub paid: usize,
    pub cancelled: usize,
    pub amount_pending: f64,
    pub amount_paid: f64,
    /// Pending invoices whose due date has passed
    pub overdue: usize,
    /// Pending invoices due today or within the next 7 days
    pub due_next_7_days: usize,
}

impl InvoiceStats {
    pub fn compute(invoices: &[Invoice], today: NaiveDate) -> Self {
        let mut stats = Self {
            total: invoices.len(),
            ..Self::default()
        };

        for invoice in invoices {
            match invoice.state {
                InvoiceState::Pending => {
                    stats.pending += 1;
                    stats.amount_pending += invoice.amount;
                    let days = (invoice.due_date - today).num_days();
                    if days < 0 {
                        stats.overdue += 1;
                    } else if days <= 7 {
                        stats.due_next_7_days += 1;
                    }
                }
                InvoiceState::Paid => {
                    stats.paid += 1;
                    stats.amount_paid += invoice.amount;
                }
                InvoiceState::Cancelled => stats.cancelled += 1,
            }
        }

        stats
    }
}
