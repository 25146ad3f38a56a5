use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("invalid {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

/// Global account role, independent of any organization.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Tester,
    #[default]
    Client,
}

string_enum!(UserRole { Admin => "admin", Tester => "tester", Client => "client" });

/// Stored user row. Never serialized to clients directly, see [`PublicUser`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: String,
    pub role: UserRole,
    /// Account that owns this one, set by admins on creation
    #[serde(default)]
    pub parent_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct PublicUser {
    pub id: u64,
    pub username: String,
    pub email: Option<String>,
    pub role: UserRole,
    pub parent_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            parent_id: user.parent_id,
            created_at: user.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceState {
    #[default]
    Pending,
    Paid,
    Cancelled,
}

string_enum!(InvoiceState { Pending => "pending", Paid => "paid", Cancelled => "cancelled" });

/// The billable record ("cobro" / "factura").
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct Invoice {
    pub id: u64,
    pub org_id: Option<Uuid>,
    pub client_name: String,
    /// WhatsApp recipient for reminders
    pub phone: Option<String>,
    pub amount: f64,
    pub description: String,
    pub state: InvoiceState,
    pub reference: Option<String>,
    #[schema(value_type = String, format = Date)]
    pub due_date: NaiveDate,
    pub created_by: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OrgStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub status: OrgStatus,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    pub fn is_active(&self) -> bool {
        self.status == OrgStatus::Active
    }
}

/// Role of a user inside one organization.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OrgRole {
    Owner,
    Manager,
    Agent,
    Viewer,
    Suspended,
}

string_enum!(OrgRole {
    Owner => "owner",
    Manager => "manager",
    Agent => "agent",
    Viewer => "viewer",
    Suspended => "suspended",
});

impl OrgRole {
    pub fn can_manage_members(&self) -> bool {
        matches!(self, OrgRole::Owner | OrgRole::Manager)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, OrgRole::Owner | OrgRole::Manager | OrgRole::Agent)
    }

    pub fn can_read(&self) -> bool {
        !matches!(self, OrgRole::Suspended)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct Membership {
    pub id: Uuid,
    pub user_id: u64,
    pub org_id: Uuid,
    pub role: OrgRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Whatsapp,
    Email,
    Sms,
}

string_enum!(Channel { Whatsapp => "whatsapp", Email => "email", Sms => "sms" });

/// Named message template for one notification channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct Template {
    pub id: u64,
    pub name: String,
    pub channel: Channel,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// JWT claims. `sub` carries the user id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: UserRole,
    pub iat: usize,
    pub exp: usize,
}

impl Claims {
    pub fn user_id(&self) -> Option<u64> {
        self.sub.parse().ok()
    }
}
