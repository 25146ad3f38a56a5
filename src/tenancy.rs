//! Who may see and change an invoice.
//!
//! Admins see everything. An invoice without an organization belongs to the
//! user who created it. An invoice inside an organization follows the
//! caller's membership role in that organization.

use crate::models::{Invoice, Membership, User};

/// `membership` is the caller's membership in `invoice.org_id`, if any.
pub fn can_read(user: &User, invoice: &Invoice, membership: Option<&Membership>) -> bool {
    allowed(user, invoice, membership, |m| m.role.can_read())
}

pub fn can_write(user: &User, invoice: &Invoice, membership: Option<&Membership>) -> bool {
    allowed(user, invoice, membership, |m| m.role.can_write())
}

pub fn can_delete(user: &User, invoice: &Invoice, membership: Option<&Membership>) -> bool {
    allowed(user, invoice, membership, |m| m.role.can_manage_members())
}

fn allowed(
    user: &User,
    invoice: &Invoice,
    membership: Option<&Membership>,
    role_allows: impl Fn(&Membership) -> bool,
) -> bool {
    if user.is_admin() {
        return true;
    }
    match invoice.org_id {
        None => invoice.created_by == user.id,
        Some(org_id) => membership
            .filter(|m| m.org_id == org_id && m.user_id == user.id)
            .map(role_allows)
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceState, OrgRole, UserRole};
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    fn user(id: u64, role: UserRole) -> User {
        User {
            id,
            username: format!("u{}", id),
            email: None,
            password_hash: String::new(),
            role,
            parent_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn invoice(created_by: u64, org_id: Option<Uuid>) -> Invoice {
        Invoice {
            id: 1,
            org_id,
            client_name: "Cliente".into(),
            phone: None,
            amount: 10.0,
            description: String::new(),
            state: InvoiceState::Pending,
            reference: None,
            due_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            created_by,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn member(user_id: u64, org_id: Uuid, role: OrgRole) -> Membership {
        Membership {
            id: Uuid::new_v4(),
            user_id,
            org_id,
            role,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn personal_invoices_belong_to_creator() {
        let inv = invoice(1, None);
        assert!(can_delete(&user(1, UserRole::Client), &inv, None));
        assert!(!can_read(&user(2, UserRole::Client), &inv, None));
        assert!(can_read(&user(2, UserRole::Admin), &inv, None));
    }

    #[test]
    fn org_invoices_follow_membership_role() {
        let org = Uuid::new_v4();
        let inv = invoice(1, Some(org));
        let viewer = user(2, UserRole::Client);
        let as_viewer = member(2, org, OrgRole::Viewer);
        assert!(can_read(&viewer, &inv, Some(&as_viewer)));
        assert!(!can_write(&viewer, &inv, Some(&as_viewer)));

        let agent = member(2, org, OrgRole::Agent);
        assert!(can_write(&viewer, &inv, Some(&agent)));
        assert!(!can_delete(&viewer, &inv, Some(&agent)));

        let suspended = member(2, org, OrgRole::Suspended);
        assert!(!can_read(&viewer, &inv, Some(&suspended)));

        // the creator loses access once the invoice is in an org they left
        assert!(!can_read(&user(1, UserRole::Client), &inv, None));
    }

    #[test]
    fn membership_of_another_org_does_not_count() {
        let inv = invoice(1, Some(Uuid::new_v4()));
        let elsewhere = member(2, Uuid::new_v4(), OrgRole::Owner);
        assert!(!can_read(&user(2, UserRole::Client), &inv, Some(&elsewhere)));
    }
}
