use crate::models::Invoice;

pub const CSV_HEADER: [&str; 10] = [
    "id",
    "org_id",
    "client_name",
    "phone",
    "amount",
    "description",
    "state",
    "reference",
    "due_date",
    "created_at",
];

/// Renders invoices as CSV with a header row. Fields are quoted when needed.
pub fn invoices_to_csv(invoices: &[Invoice]) -> Result<String, csv::Error> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record(CSV_HEADER)?;

    for invoice in invoices {
        writer.write_record([
            invoice.id.to_string(),
            invoice.org_id.map(|id| id.to_string()).unwrap_or_default(),
            invoice.client_name.clone(),
            invoice.phone.clone().unwrap_or_default(),
            format!("{:.2}", invoice.amount),
            invoice.description.clone(),
            invoice.state.to_string(),
            invoice.reference.clone().unwrap_or_default(),
            invoice.due_date.to_string(),
            invoice.created_at.to_rfc3339(),
        ])?;
    }

    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    // Every field written above is valid UTF-8
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InvoiceState;
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn header_only_for_empty_list() {
        let csv = invoices_to_csv(&[]).unwrap();
        assert_eq!(
            csv,
            "id,org_id,client_name,phone,amount,description,state,reference,due_date,created_at\n"
        );
    }

    #[test]
    fn quotes_fields_with_commas_and_quotes() {
        let created = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap();
        let invoice = Invoice {
            id: 5,
            org_id: None,
            client_name: "Pérez, Juan".into(),
            phone: Some("50688887777".into()),
            amount: 1500.0,
            description: "Dijo \"pago mañana\"".into(),
            state: InvoiceState::Paid,
            reference: None,
            due_date: NaiveDate::from_ymd_opt(2026, 10, 30).unwrap(),
            created_by: 1,
            created_at: created,
            updated_at: created,
        };
        let csv = invoices_to_csv(&[invoice]).unwrap();
        let row = csv.lines().nth(1).unwrap();
        assert_eq!(
            row,
            "5,,\"Pérez, Juan\",50688887777,1500.00,\"Dijo \"\"pago mañana\"\"\",paid,,2026-10-30,2026-10-01T12:00:00+00:00"
        );
    }
}
