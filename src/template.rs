use chrono::NaiveDate;
use std::collections::HashMap;

use crate::models::Invoice;

/// Body used when no `reminder` template is stored for the channel.
pub const DEFAULT_REMINDER: &str = "Hola {client}, le recordamos que su factura {reference} por {amount} \
vence el {due_date} ({days} días). Detalle: {description}.";

/// Replaces `{name}` markers with values from `vars`.
///
/// Unknown markers and unbalanced braces are copied verbatim.
pub fn render(body: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(|c: char| c == '}' || c == '{') {
            Some(close) if after.as_bytes()[close] == b'}' => {
                let name = &after[..close];
                match vars.get(name.trim()) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Placeholder values for an invoice reminder.
pub fn invoice_vars(invoice: &Invoice, today: NaiveDate) -> HashMap<&'static str, String> {
    HashMap::from([
        ("client", invoice.client_name.clone()),
        ("amount", format!("{:.2}", invoice.amount)),
        ("due_date", invoice.due_date.to_string()),
        ("reference", invoice.reference.clone().unwrap_or_default()),
        ("description", invoice.description.clone()),
        ("days", (invoice.due_date - today).num_days().to_string()),
        ("state", invoice.state.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InvoiceState;
    use chrono::Utc;

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn substitutes_known_placeholders() {
        let out = render("Hola {client}, debe {amount}", &vars(&[("client", "Ana"), ("amount", "10.00")]));
        assert_eq!(out, "Hola Ana, debe 10.00");
    }

    #[test]
    fn keeps_unknown_and_unbalanced_markers() {
        let v = vars(&[("client", "Ana")]);
        assert_eq!(render("{unknown} {client}", &v), "{unknown} Ana");
        assert_eq!(render("open { brace {client}", &v), "open { brace Ana");
        assert_eq!(render("tail {client", &v), "tail {client");
        assert_eq!(render("{{client}}", &v), "{Ana}");
    }

    #[test]
    fn invoice_vars_cover_reminder_fields() {
        let now = Utc::now();
        let invoice = Invoice {
            id: 3,
            org_id: None,
            client_name: "Beto".into(),
            phone: None,
            amount: 99.5,
            description: "Póliza".into(),
            state: InvoiceState::Pending,
            reference: Some("F-001".into()),
            due_date: NaiveDate::from_ymd_opt(2026, 10, 26).unwrap(),
            created_by: 1,
            created_at: now,
            updated_at: now,
        };
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let text = render(DEFAULT_REMINDER, &invoice_vars(&invoice, today));
        assert_eq!(
            text,
            "Hola Beto, le recordamos que su factura F-001 por 99.50 vence el 2026-10-26 (7 días). Detalle: Póliza."
        );
    }
}
