//! Seed script for NOA Cobros.
//!
//! Populates the storage directory (`DATA_DIR`, default `noa_data`) with:
//! - an admin account (`ADMIN_USERNAME` / `ADMIN_PASSWORD`, default admin/admin)
//! - two staff users, jeff (manager) and hermann (agent)
//! - the "NOA" organization
//! - sample invoices due in 15, 7 and 0 days, so one worker run hits every wave
//!   (only when the organization is new, re-runs leave invoices alone)
//!
//! Run: cargo run --bin seed   (with the server stopped, sled locks the directory)

use chrono::{Duration, Local, NaiveDate, Utc};
use uuid::Uuid;

use noa_cobros::auth::hash_password;
use noa_cobros::config::AppConfig;
use noa_cobros::logging::init_logging;
use noa_cobros::error::StorageResult;
use noa_cobros::models::{Invoice, InvoiceState, OrgRole, Organization, User, UserRole};
use noa_cobros::storage::Storage;

const STAFF_PASSWORD: &str = "Noa2025!";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    let _guard = init_logging("seed", &config.log_dir);

    let storage = Storage::open(&config.data_dir)?;

    let (admin_name, admin_pass, admin_email) = match &config.admin_seed {
        Some(seed) => (seed.username.clone(), seed.password.clone(), seed.email.clone()),
        None => {
            tracing::warn!("ADMIN_USERNAME / ADMIN_PASSWORD not set, using admin/admin");
            ("admin".to_string(), "admin".to_string(), None)
        }
    };
    let admin = storage.ensure_user(
        &admin_name,
        admin_email,
        hash_password(&admin_pass, config.bcrypt_cost)?,
        UserRole::Admin,
    )?;

    let mut staff = vec![];
    for (username, role) in [("jeff", OrgRole::Manager), ("hermann", OrgRole::Agent)] {
        let user = storage.ensure_user(
            username,
            Some(format!("{}@noa.seg", username)),
            hash_password(STAFF_PASSWORD, config.bcrypt_cost)?,
            UserRole::Client,
        )?;
        staff.push((user, role));
    }

    let (org, created) = seed_organization(&storage, admin.id, &staff)?;
    if created {
        seed_invoices(&storage, org.id, admin.id, Local::now().date_naive())?;
    } else {
        tracing::info!(org_id = %org.id, "organization already seeded, keeping its invoices");
    }

    storage.flush().await?;
    tracing::info!(org_id = %org.id, admin = %admin.username, "seed complete");
    Ok(())
}

/// Finds or creates the "NOA" organization and sets the staff memberships.
/// Returns whether the organization was created by this run.
fn seed_organization(
    storage: &Storage,
    admin_id: u64,
    staff: &[(User, OrgRole)],
) -> StorageResult<(Organization, bool)> {
    let existing = storage
        .organizations_for_user(admin_id)?
        .into_iter()
        .find(|(org, _)| org.name == "NOA");
    let (org, created) = match existing {
        Some((org, _)) => (org, false),
        None => (storage.create_organization("NOA", admin_id)?.0, true),
    };
    for (user, role) in staff {
        storage.upsert_membership(org.id, user.id, *role)?;
    }
    Ok((org, created))
}

fn seed_invoices(storage: &Storage, org_id: Uuid, admin_id: u64, today: NaiveDate) -> StorageResult<()> {
    let samples = [
        ("Ana Mora", "50688880001", 45_000.0, 15, InvoiceState::Pending),
        ("Beto Solano", "50688880002", 12_500.0, 7, InvoiceState::Pending),
        ("Carla Vargas", "50688880003", 80_000.0, 0, InvoiceState::Pending),
        ("Dario Rojas", "50688880004", 30_000.0, -3, InvoiceState::Pending),
        ("Elena Quesada", "50688880005", 22_000.0, 7, InvoiceState::Paid),
    ];

    for (i, (client, phone, amount, days, state)) in samples.into_iter().enumerate() {
        let now = Utc::now();
        let invoice = storage.create_invoice(Invoice {
            id: 0,
            org_id: Some(org_id),
            client_name: client.to_string(),
            phone: Some(phone.to_string()),
            amount,
            description: "Servicio mensual".to_string(),
            state,
            reference: Some(format!("F-{:04}", i + 1)),
            due_date: today + Duration::days(days),
            created_by: admin_id,
            created_at: now,
            updated_at: now,
        })?;
        tracing::info!(invoice_id = invoice.id, client, due = %invoice.due_date, "sample invoice");
    }
    Ok(())
}
