use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fs;

const TOKEN_FILE: &str = ".noa_token";

#[derive(Parser)]
#[command(name = "noa-cli")]
#[command(about = "CLI for the NOA Cobros API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, env = "BACKEND_URL", default_value = "http://localhost:8080")]
    url: String,
}

#[derive(Subcommand)]
enum Commands {
    Register {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
        #[arg(short, long)]
        email: Option<String>,
    },
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    Me,
    CreateInvoice {
        #[arg(short, long)]
        client: String,
        #[arg(short, long)]
        amount: f64,
        /// Due date, YYYY-MM-DD
        #[arg(short, long)]
        due: String,
        #[arg(short, long)]
        phone: Option<String>,
        #[arg(short, long)]
        reference: Option<String>,
        #[arg(short = 'D', long, default_value = "")]
        description: String,
        #[arg(short, long)]
        org: Option<String>,
    },
    ListInvoices {
        #[arg(short, long)]
        state: Option<String>,
        #[arg(short, long)]
        org: Option<String>,
    },
    GetInvoice {
        #[arg(short, long)]
        id: u64,
    },
    UpdateInvoice {
        #[arg(short, long)]
        id: u64,
        #[arg(short, long)]
        state: Option<String>,
        #[arg(short, long)]
        amount: Option<f64>,
        #[arg(short, long)]
        due: Option<String>,
        #[arg(short, long)]
        phone: Option<String>,
    },
    DeleteInvoice {
        #[arg(short, long)]
        id: u64,
    },
    /// Downloads the CSV export to a file
    Export {
        #[arg(short, long, default_value = "facturas.csv")]
        output: String,
    },
    Stats,
    CreateOrg {
        #[arg(short, long)]
        name: String,
    },
    ListOrgs,
    AddMember {
        #[arg(short, long)]
        org: String,
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        role: Option<String>,
    },
    ListMembers {
        #[arg(short, long)]
        org: String,
    },
    /// Sends WhatsApp reminders for the given invoice ids
    Notify {
        #[arg(short, long, num_args = 1.., required = true)]
        ids: Vec<u64>,
        #[arg(short, long)]
        template: Option<String>,
    },
    Logout,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
}

fn with_token(builder: RequestBuilder) -> RequestBuilder {
    match fs::read_to_string(TOKEN_FILE) {
        Ok(token) => builder.bearer_auth(token.trim()),
        Err(_) => builder,
    }
}

async fn print_response(res: Response) -> Result<(), reqwest::Error> {
    let status = res.status();
    let text = res.text().await?;
    let pretty = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or(text);
    println!("{} {}", status, pretty);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let client = Client::new();
    let url = cli.url.trim_end_matches('/');

    match cli.command {
        Commands::Register { username, password, email } => {
            let res = client
                .post(format!("{}/auth/register", url))
                .json(&json!({ "username": username, "password": password, "email": email }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Login { username, password } => {
            let res = client
                .post(format!("{}/auth/login", url))
                .json(&json!({ "username": username, "password": password }))
                .send()
                .await?;
            if res.status().is_success() {
                let body: LoginResponse = res.json().await?;
                fs::write(TOKEN_FILE, body.access_token)?;
                println!("Logged in. Token saved to {}", TOKEN_FILE);
            } else {
                println!("Login failed: {}", res.text().await?);
            }
        }
        Commands::Me => {
            let res = with_token(client.get(format!("{}/me", url))).send().await?;
            print_response(res).await?;
        }
        Commands::CreateInvoice { client: client_name, amount, due, phone, reference, description, org } => {
            let res = with_token(client.post(format!("{}/invoices", url)))
                .json(&json!({
                    "client_name": client_name,
                    "amount": amount,
                    "due_date": due,
                    "phone": phone,
                    "reference": reference,
                    "description": description,
                    "org_id": org,
                }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::ListInvoices { state, org } => {
            let mut query = vec![];
            if let Some(state) = state {
                query.push(("state", state));
            }
            if let Some(org) = org {
                query.push(("org_id", org));
            }
            let res = with_token(client.get(format!("{}/invoices", url)).query(&query))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::GetInvoice { id } => {
            let res = with_token(client.get(format!("{}/invoices/{}", url, id))).send().await?;
            print_response(res).await?;
        }
        Commands::UpdateInvoice { id, state, amount, due, phone } => {
            // Only the flags given on the command line are sent
            let mut patch = Map::new();
            if let Some(state) = state {
                patch.insert("state".to_string(), json!(state));
            }
            if let Some(amount) = amount {
                patch.insert("amount".to_string(), json!(amount));
            }
            if let Some(due) = due {
                patch.insert("due_date".to_string(), json!(due));
            }
            if let Some(phone) = phone {
                patch.insert("phone".to_string(), json!(phone));
            }
            let res = with_token(client.patch(format!("{}/invoices/{}", url, id)))
                .json(&Value::Object(patch))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::DeleteInvoice { id } => {
            let res = with_token(client.delete(format!("{}/invoices/{}", url, id))).send().await?;
            println!("{}", res.status());
        }
        Commands::Export { output } => {
            let res = with_token(client.get(format!("{}/export/invoices.csv", url))).send().await?;
            if res.status().is_success() {
                fs::write(&output, res.bytes().await?)?;
                println!("Export written to {}", output);
            } else {
                print_response(res).await?;
            }
        }
        Commands::Stats => {
            let res = with_token(client.get(format!("{}/stats", url))).send().await?;
            print_response(res).await?;
        }
        Commands::CreateOrg { name } => {
            let res = with_token(client.post(format!("{}/orgs", url)))
                .json(&json!({ "name": name }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::ListOrgs => {
            let res = with_token(client.get(format!("{}/orgs", url))).send().await?;
            print_response(res).await?;
        }
        Commands::AddMember { org, username, role } => {
            let res = with_token(client.post(format!("{}/orgs/{}/users", url, org)))
                .json(&json!({ "username": username, "role": role }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::ListMembers { org } => {
            let res = with_token(client.get(format!("{}/orgs/{}/users", url, org))).send().await?;
            print_response(res).await?;
        }
        Commands::Notify { ids, template } => {
            let res = with_token(client.post(format!("{}/notify", url)))
                .json(&json!({ "ids": ids, "template": template }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Logout => {
            let _ = fs::remove_file(TOKEN_FILE);
            println!("Logged out (token removed).");
        }
    }

    Ok(())
}
